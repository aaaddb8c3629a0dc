//! Scan orchestration.
//!
//! Drives one run through its phases in order: cache load, discovery sweep,
//! one batched engine call per planned port, module enrichment, and cache
//! persistence. A failing phase is reported and skipped; the run goes on
//! with whatever state the earlier phases produced.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use ipnet::Ipv4Net;

use assetinv_cache::{HostCache, ScanState};
use assetinv_core::types::NOT_APPLICABLE;
use assetinv_core::{HostRecord, Inventory};

use crate::config::ProbeModule;
use crate::engine::{EngineJob, EngineMode, ScanEngine};
use crate::modules::{ModuleContext, ModuleRegistry, ModuleRun};
use crate::plan::ScanPlan;
use crate::resolve::{resolve_hosts, HostResolver};
use crate::targets;

/// Per-run switches, already validated by the CLI.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub targets: Vec<Ipv4Net>,
    pub blacklist: Vec<Ipv4Net>,
    pub whitelist: Option<Vec<Ipv4Net>>,
    /// Explicit `--ports`; module ports are added on top.
    pub ports: Vec<u16>,
    pub skip_ping: bool,
    pub force_ping: bool,
    pub force_syn: bool,
    pub resolve_dns: bool,
    pub force_dns: bool,
    pub probe: ProbeModule,
    pub syn_port: u16,
    pub dns_concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            blacklist: Vec::new(),
            whitelist: None,
            ports: Vec::new(),
            skip_ping: false,
            force_ping: false,
            force_syn: false,
            resolve_dns: true,
            force_dns: false,
            probe: ProbeModule::Icmp,
            syn_port: 80,
            dns_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    Completed,
    Skipped(String),
    Failed(String),
}

/// Outcome of one discovery or port phase.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: String,
    pub responded: usize,
    pub new_hosts: usize,
    pub status: PhaseStatus,
}

impl PhaseReport {
    fn skipped(phase: &str, reason: &str) -> Self {
        tracing::info!(phase, reason, "Phase skipped");
        Self {
            phase: phase.to_string(),
            responded: 0,
            new_hosts: 0,
            status: PhaseStatus::Skipped(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub phases: Vec<PhaseReport>,
    pub modules: Vec<ModuleRun>,
    pub cache_saved: bool,
}

/// Blacklist removed, then restricted to the whitelist when one is given.
pub fn filter_targets(
    targets: &[Ipv4Net],
    blacklist: &[Ipv4Net],
    whitelist: Option<&[Ipv4Net]>,
) -> Vec<Ipv4Net> {
    let allowed = targets::subtract(targets, blacklist);
    match whitelist {
        Some(list) => targets::intersect(&allowed, list),
        None => allowed,
    }
}

fn host_nets<I: IntoIterator<Item = Ipv4Addr>>(ips: I) -> Vec<Ipv4Net> {
    let nets: Vec<Ipv4Net> = ips.into_iter().map(Ipv4Net::from).collect();
    targets::normalize(&nets)
}

pub struct Orchestrator {
    engine: Arc<dyn ScanEngine>,
    resolver: Arc<dyn HostResolver>,
    cache: HostCache,
    registry: ModuleRegistry,
    inventory: Arc<Inventory>,
    state: ScanState,
    options: RunOptions,
    plan: ScanPlan,
    scope: Vec<Ipv4Net>,
    work_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ScanEngine>,
        resolver: Arc<dyn HostResolver>,
        work_dir: impl Into<PathBuf>,
        registry: ModuleRegistry,
        options: RunOptions,
    ) -> Self {
        let work_dir = work_dir.into();
        let plan = ScanPlan::new(options.ports.iter().copied(), registry.required_ports());
        let scope = filter_targets(
            &options.targets,
            &options.blacklist,
            options.whitelist.as_deref(),
        );
        let inventory = Arc::new(Inventory::new());
        inventory.register_columns(registry.csv_headers());

        tracing::info!(
            networks = scope.len(),
            addresses = targets::address_count(&scope),
            ports = ?plan.ports(),
            "Scan scope"
        );

        Self {
            engine,
            resolver,
            cache: HostCache::new(&work_dir),
            registry,
            inventory,
            state: ScanState::default(),
            options,
            plan,
            scope,
            work_dir,
        }
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    /// Targets after blacklist/whitelist filtering.
    pub fn scope(&self) -> &[Ipv4Net] {
        &self.scope
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &HostCache {
        &self.cache
    }

    /// Seed the inventory from the previous run. Never removes hosts.
    pub async fn load_cache(&mut self) {
        let snapshot = self.cache.load(&[&self.registry]);
        for host in snapshot.hosts {
            self.inventory.upsert(host);
        }
        self.state = snapshot.state;

        if self.options.resolve_dns && self.options.force_dns {
            let unnamed: Vec<Ipv4Addr> = self
                .inventory
                .snapshot()
                .into_iter()
                .filter(|h| h.hostname().is_empty())
                .map(|h| h.ip)
                .collect();
            if !unnamed.is_empty() {
                tracing::info!(hosts = unnamed.len(), "Resolving hostnames for cached hosts");
                self.resolve(unnamed).await;
            }
        }
    }

    async fn resolve(&self, ips: Vec<Ipv4Addr>) {
        if !self.options.resolve_dns || ips.is_empty() {
            return;
        }
        resolve_hosts(
            &self.inventory,
            self.resolver.clone(),
            ips,
            self.options.dns_concurrency,
        )
        .await;
    }

    /// Alive-host sweep over networks not yet swept.
    pub async fn discover(&mut self) -> PhaseReport {
        const PHASE: &str = "ping";
        if self.options.skip_ping {
            return PhaseReport::skipped(PHASE, "discovery disabled");
        }

        let nets: Vec<Ipv4Net> = if self.options.force_ping {
            self.scope.clone()
        } else {
            self.scope
                .iter()
                .filter(|n| !self.state.is_swept(n))
                .copied()
                .collect()
        };
        if nets.is_empty() {
            return PhaseReport::skipped(PHASE, "all target networks already swept");
        }

        let exclude = if self.options.force_ping {
            Vec::new()
        } else {
            host_nets(
                self.inventory
                    .ips()
                    .into_iter()
                    .filter(|ip| targets::contains(&nets, ip)),
            )
        };

        let job = EngineJob {
            phase: PHASE.to_string(),
            mode: EngineMode::Discovery {
                probe: self.options.probe,
                port: self.options.syn_port,
            },
            targets: nets.clone(),
            exclude,
        };

        let output = match self.engine.run(&job).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(phase = PHASE, error = %e, "Discovery failed, continuing");
                return PhaseReport {
                    phase: PHASE.to_string(),
                    responded: 0,
                    new_hosts: 0,
                    status: PhaseStatus::Failed(e.to_string()),
                };
            }
        };

        let mut new_ips = Vec::new();
        for (ip, _) in &output.hits {
            if targets::contains(&nets, ip) && self.inventory.upsert(HostRecord::new(*ip)) {
                new_ips.push(*ip);
            }
        }
        self.state.record_sweep(&nets);

        tracing::info!(
            scan_id = %output.scan_id,
            phase = PHASE,
            responded = output.hits.len(),
            new = new_ips.len(),
            total = self.inventory.len(),
            "Discovery complete"
        );

        let new_hosts = new_ips.len();
        self.resolve(new_ips).await;

        PhaseReport {
            phase: PHASE.to_string(),
            responded: output.hits.len(),
            new_hosts,
            status: PhaseStatus::Completed,
        }
    }

    /// One batched SYN scan for `port`.
    pub async fn scan_port(&mut self, port: u16) -> PhaseReport {
        let phase = format!("port-{port}");
        let force = self.options.force_syn;

        let known_in_scope: Vec<Ipv4Addr> = self
            .inventory
            .ips()
            .into_iter()
            .filter(|ip| targets::contains(&self.scope, ip))
            .collect();

        let (job_targets, exclude, submitted) = if self.options.skip_ping {
            let done: Vec<Ipv4Addr> = if force {
                Vec::new()
            } else {
                self.state
                    .scanned
                    .get(&port)
                    .map(|hosts| hosts.iter().copied().collect())
                    .unwrap_or_default()
            };
            (self.scope.clone(), host_nets(done), known_in_scope)
        } else {
            let pending: Vec<Ipv4Addr> = known_in_scope
                .into_iter()
                .filter(|ip| force || !self.state.is_scanned(port, ip))
                .collect();
            (host_nets(pending.iter().copied()), Vec::new(), pending)
        };

        if job_targets.is_empty() {
            return PhaseReport::skipped(&phase, "no hosts left to scan on this port");
        }

        let job = EngineJob {
            phase: phase.clone(),
            mode: EngineMode::PortScan { port },
            targets: job_targets.clone(),
            exclude,
        };

        let output = match self.engine.run(&job).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(phase = %phase, error = %e, "Port scan failed, continuing");
                return PhaseReport {
                    phase,
                    responded: 0,
                    new_hosts: 0,
                    status: PhaseStatus::Failed(e.to_string()),
                };
            }
        };

        let mut new_ips = Vec::new();
        let mut open = Vec::new();
        for (ip, _) in &output.hits {
            if !targets::contains(&job_targets, ip) {
                continue;
            }
            if self.inventory.add_open_port(*ip, port) {
                new_ips.push(*ip);
            }
            open.push(*ip);
        }
        self.state
            .mark_scanned(port, submitted.into_iter().chain(open.iter().copied()));

        tracing::info!(
            scan_id = %output.scan_id,
            phase = %phase,
            open = open.len(),
            new = new_ips.len(),
            "Port scan complete"
        );

        let new_hosts = new_ips.len();
        self.resolve(new_ips).await;

        PhaseReport {
            phase,
            responded: open.len(),
            new_hosts,
            status: PhaseStatus::Completed,
        }
    }

    /// Run the selected modules against the inventory.
    pub async fn enrich(&self) -> Vec<ModuleRun> {
        if !self.registry.has_active() {
            return Vec::new();
        }
        let ctx = ModuleContext {
            inventory: self.inventory.clone(),
            artifact_dir: self.work_dir.clone(),
        };
        self.registry.run_active(&ctx).await
    }

    /// Write hosts and bookkeeping to the cache. Failures are logged.
    pub fn persist(&self) -> bool {
        self.inventory.fill_missing(NOT_APPLICABLE);
        self.cache.dump(
            &self.inventory.snapshot(),
            &self.inventory.columns(),
            &self.state,
        )
    }

    /// All phases in order. The cache is loaded separately so callers can
    /// persist whatever a partial run produced.
    pub async fn run(&mut self) -> RunSummary {
        let mut summary = RunSummary::default();

        summary.phases.push(self.discover().await);

        let ports = self.plan.ports().to_vec();
        for port in ports {
            summary.phases.push(self.scan_port(port).await);
        }

        summary.modules = self.enrich().await;
        summary.cache_saved = self.persist();

        let new_hosts: usize = summary.phases.iter().map(|p| p.new_hosts).sum();
        tracing::info!(
            hosts = self.inventory.len(),
            new = new_hosts,
            "Run complete"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOutput;
    use crate::error::{InventoryError, Result};
    use crate::resolve::NoResolver;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use uuid::Uuid;

    /// Answers from a fixed table: discovery returns `alive`, port scans
    /// return `open[port]`, both limited to the job's targets minus excludes.
    #[derive(Default)]
    struct FakeEngine {
        alive: Vec<Ipv4Addr>,
        open: HashMap<u16, Vec<Ipv4Addr>>,
        fail_ports: Vec<u16>,
        jobs: Mutex<Vec<EngineJob>>,
    }

    #[async_trait]
    impl ScanEngine for FakeEngine {
        async fn run(&self, job: &EngineJob) -> Result<EngineOutput> {
            self.jobs.lock().push(job.clone());
            let candidates = match job.mode {
                EngineMode::Discovery { .. } => self.alive.clone(),
                EngineMode::PortScan { port } => {
                    if self.fail_ports.contains(&port) {
                        return Err(InventoryError::EngineLaunch {
                            program: "zmap".to_string(),
                            reason: "permission denied".to_string(),
                        });
                    }
                    self.open.get(&port).cloned().unwrap_or_default()
                }
            };
            let hits = candidates
                .into_iter()
                .filter(|ip| targets::contains(&job.targets, ip))
                .filter(|ip| !targets::contains(&job.exclude, ip))
                .map(|ip| (ip, job.mode.port()))
                .collect();
            Ok(EngineOutput {
                scan_id: Uuid::new_v4(),
                hits,
                artifact: None,
                duration: Duration::ZERO,
            })
        }
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn orchestrator(engine: Arc<FakeEngine>, dir: &std::path::Path, options: RunOptions) -> Orchestrator {
        Orchestrator::new(
            engine,
            Arc::new(NoResolver),
            dir,
            ModuleRegistry::new(),
            options,
        )
    }

    #[test]
    fn test_filter_targets() {
        let scope = filter_targets(
            &[net("10.0.0.0/24")],
            &[net("10.0.0.0/25")],
            Some(&[net("10.0.0.128/26"), net("192.168.0.0/16")]),
        );
        assert_eq!(scope, vec![net("10.0.0.128/26")]);
    }

    #[tokio::test]
    async fn test_discovery_then_port_scan() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            alive: vec![ip(1), ip(2)],
            open: [(22, vec![ip(1)])].into(),
            ..Default::default()
        });
        let options = RunOptions {
            targets: vec![net("10.0.0.0/30")],
            ports: vec![22],
            ..Default::default()
        };
        let mut orch = orchestrator(engine.clone(), dir.path(), options);
        orch.load_cache().await;
        let summary = orch.run().await;

        assert_eq!(summary.phases.len(), 2);
        assert_eq!(summary.phases[0].new_hosts, 2);
        assert_eq!(summary.phases[1].responded, 1);
        assert!(summary.cache_saved);

        let hosts = orch.inventory().snapshot();
        assert_eq!(hosts.len(), 2);
        assert!(hosts[0].open_ports.contains(&22));
        assert!(hosts[1].open_ports.is_empty());
        assert!(orch.state().is_scanned(22, &ip(2)));

        // Port scans only target hosts that answered discovery.
        let jobs = engine.jobs.lock();
        assert_eq!(jobs[1].targets, vec![net("10.0.0.1/32"), net("10.0.0.2/32")]);
    }

    #[tokio::test]
    async fn test_rerun_skips_done_work() {
        let dir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            targets: vec![net("10.0.0.0/30")],
            ports: vec![22],
            ..Default::default()
        };
        let engine = Arc::new(FakeEngine {
            alive: vec![ip(1)],
            open: [(22, vec![ip(1)])].into(),
            ..Default::default()
        });
        let mut first = orchestrator(engine, dir.path(), options.clone());
        first.load_cache().await;
        first.run().await;

        let engine = Arc::new(FakeEngine {
            alive: vec![ip(1), ip(3)],
            ..Default::default()
        });
        let mut second = orchestrator(engine.clone(), dir.path(), options.clone());
        second.load_cache().await;
        assert!(second.inventory().contains(&ip(1)));
        let summary = second.run().await;

        assert!(matches!(summary.phases[0].status, PhaseStatus::Skipped(_)));
        assert!(matches!(summary.phases[1].status, PhaseStatus::Skipped(_)));
        assert!(engine.jobs.lock().is_empty());
        assert!(second.inventory().get(&ip(1)).unwrap().open_ports.contains(&22));

        // Forcing both re-probes, excluding nothing.
        let forced = RunOptions {
            force_ping: true,
            force_syn: true,
            ..options
        };
        let mut third = orchestrator(engine.clone(), dir.path(), forced);
        third.load_cache().await;
        let summary = third.run().await;
        assert_eq!(summary.phases[0].new_hosts, 1);
        let jobs = engine.jobs.lock();
        assert!(jobs[0].exclude.is_empty());
        assert_eq!(jobs[1].targets, vec![net("10.0.0.1/32"), net("10.0.0.3/32")]);
    }

    #[tokio::test]
    async fn test_known_hosts_excluded_from_new_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let mut orch = orchestrator(
            engine.clone(),
            dir.path(),
            RunOptions {
                targets: vec![net("10.0.0.0/29")],
                ..Default::default()
            },
        );
        orch.inventory().upsert(HostRecord::new(ip(5)));
        orch.discover().await;
        assert_eq!(engine.jobs.lock()[0].exclude, vec![net("10.0.0.5/32")]);
    }

    #[tokio::test]
    async fn test_failed_phase_does_not_stop_run() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            alive: vec![ip(1)],
            open: [(80, vec![ip(1)])].into(),
            fail_ports: vec![445],
            ..Default::default()
        });
        let options = RunOptions {
            targets: vec![net("10.0.0.0/30")],
            ports: vec![80, 445],
            ..Default::default()
        };
        let mut orch = orchestrator(engine, dir.path(), options);
        let summary = orch.run().await;

        assert_eq!(summary.phases[1].phase, "port-445");
        assert!(matches!(summary.phases[1].status, PhaseStatus::Failed(_)));
        assert_eq!(summary.phases[2].status, PhaseStatus::Completed);
        // A failed phase leaves its port unscanned so the next run retries it.
        assert!(!orch.state().is_scanned(445, &ip(1)));
        assert!(orch.state().is_scanned(80, &ip(1)));
        assert!(summary.cache_saved);
    }

    #[tokio::test]
    async fn test_skip_ping_scans_whole_scope() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine {
            open: [(3389, vec![ip(6)])].into(),
            ..Default::default()
        });
        let options = RunOptions {
            targets: vec![net("10.0.0.0/29")],
            blacklist: vec![net("10.0.0.7/32")],
            ports: vec![3389],
            skip_ping: true,
            ..Default::default()
        };
        let mut orch = orchestrator(engine.clone(), dir.path(), options);
        let summary = orch.run().await;

        assert!(matches!(summary.phases[0].status, PhaseStatus::Skipped(_)));
        assert_eq!(summary.phases[1].new_hosts, 1);
        assert!(orch.inventory().contains(&ip(6)));
        let jobs = engine.jobs.lock();
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].targets,
            vec![net("10.0.0.0/30"), net("10.0.0.4/31"), net("10.0.0.6/32")]
        );
    }
}
