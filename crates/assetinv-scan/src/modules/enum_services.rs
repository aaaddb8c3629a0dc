//! Remote service enumeration over SMB.
//!
//! Runs an impacket-style exec program against every host with 445 open,
//! asking for the Windows product name and the `sc query` lines that match
//! the configured service names. Output is delimited by a canary so the two
//! answers can be told apart. Rejected credentials feed a circuit breaker so
//! a bad password cannot lock out the account across the whole estate.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::process::Command;

use assetinv_core::types::{Informativeness, NO, OS, YES};
use assetinv_core::{HostRecord, Inventory};

use super::breaker::CircuitBreaker;
use super::pool::{TaskOutcome, WorkerPool};
use super::{Module, ModuleContext};
use crate::config::EnumServicesConfig;
use crate::error::{InventoryError, Result};

const CANARY: &str = "!@#";
const LOGON_FAILURE: &str = "STATUS_LOGON_FAILURE";
const SMB_PORT: u16 = 445;

// ── Credentials ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Password {
        domain: String,
        username: String,
        password: String,
    },
    Hashes {
        domain: String,
        username: String,
        hashes: String,
    },
    /// Ticket from `KRB5CCNAME`; the target must be a hostname.
    Kerberos { domain: String, username: String },
}

impl Credentials {
    pub fn from_config(config: &EnumServicesConfig, ticket: Option<OsString>) -> Result<Self> {
        let domain = config.domain.clone();
        let username = config.username.clone();
        if !username.is_empty() && !config.password.is_empty() {
            return Ok(Self::Password {
                domain,
                username,
                password: config.password.clone(),
            });
        }
        if !username.is_empty() && !config.hashes.is_empty() {
            return Ok(Self::Hashes {
                domain,
                username,
                hashes: config.hashes.clone(),
            });
        }
        match ticket {
            Some(_) => Ok(Self::Kerberos { domain, username }),
            None => Err(InventoryError::Module(
                "Username or password missing and no KRB5CCNAME variable found".to_string(),
            )),
        }
    }

    pub fn needs_hostname(&self) -> bool {
        matches!(self, Self::Kerberos { .. })
    }

    pub fn exec_args(&self, target: &str) -> Vec<String> {
        match self {
            Self::Password {
                domain,
                username,
                password,
            } => vec![format!("{domain}/{username}:{password}@{target}")],
            Self::Hashes {
                domain,
                username,
                hashes,
            } => vec![
                "-hashes".to_string(),
                hashes.clone(),
                format!("{domain}/{username}@{target}"),
            ],
            Self::Kerberos { domain, username } => vec![
                "-k".to_string(),
                "-no-pass".to_string(),
                format!("{domain}/{username}@{target}"),
            ],
        }
    }
}

// ── Remote execution ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn exec(&self, target: &str, command: &str) -> Result<ExecOutput>;
}

/// Runs the configured exec program as a child process.
pub struct ProcessExec {
    program: String,
    credentials: Credentials,
    timeout: Duration,
}

impl ProcessExec {
    pub fn new(program: &str, credentials: Credentials, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            credentials,
            timeout,
        }
    }
}

#[async_trait]
impl RemoteExec for ProcessExec {
    async fn exec(&self, target: &str, command: &str) -> Result<ExecOutput> {
        tracing::debug!(program = %self.program, %target, "Executing remote command");

        let mut child = Command::new(&self.program);
        child
            .args(self.credentials.exec_args(target))
            .arg(command)
            .env("PYTHONIOENCODING", "UTF-8")
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, child.output())
            .await
            .map_err(|_| InventoryError::EngineTimeout {
                program: self.program.clone(),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| InventoryError::EngineLaunch {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ── Command and output parsing ────────────────────────────────────

/// The cmd.exe one-liner: product name, canary, matching services.
pub fn build_command(services: &BTreeMap<String, String>) -> String {
    let keywords: BTreeSet<&str> = services
        .values()
        .flat_map(|name| name.split_whitespace())
        .collect();
    let keywords: Vec<&str> = keywords.into_iter().collect();
    let echo = format!("echo {CANARY}");
    [
        "(",
        &echo,
        "&",
        r#"reg query "hklm\software\microsoft\windows nt\currentversion" /v productname"#,
        "&",
        &echo,
        "&",
        &format!(r#"sc query | findstr /i "{}""#, keywords.join(" ")),
        ")",
    ]
    .join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProbe {
    pub os: String,
    /// CSV column → present.
    pub services: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    LogonFailure,
    Unparsable,
}

pub fn parse_output(
    stdout: &str,
    services: &BTreeMap<String, String>,
) -> std::result::Result<ServiceProbe, ProbeFailure> {
    if stdout.contains(LOGON_FAILURE) {
        return Err(ProbeFailure::LogonFailure);
    }
    let mut chunks = stdout.split(CANARY).skip(1);
    let (Some(os_chunk), Some(svc_chunk)) = (chunks.next(), chunks.next()) else {
        return Err(ProbeFailure::Unparsable);
    };
    let lines = |chunk: &str| -> Vec<String> {
        chunk
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    };

    // "    ProductName    REG_SZ    Windows 10 Pro"
    let os_lines = lines(os_chunk);
    let os = os_lines
        .last()
        .map(|l| l.split_whitespace().skip(2).collect::<Vec<_>>().join(" "))
        .filter(|os| !os.is_empty())
        .ok_or(ProbeFailure::Unparsable)?;

    // "SERVICE_NAME: CSFalconService"
    let found: Vec<String> = lines(svc_chunk)
        .iter()
        .filter_map(|l| l.split_once(':').map(|(_, v)| v.trim().to_uppercase()))
        .collect();
    let services = services
        .iter()
        .map(|(column, name)| {
            let name = name.to_uppercase();
            (column.clone(), found.iter().any(|f| f.contains(&name)))
        })
        .collect();

    Ok(ServiceProbe { os, services })
}

// ── Module ────────────────────────────────────────────────────────

pub struct EnumServices {
    config: EnumServicesConfig,
    exec: Option<Arc<dyn RemoteExec>>,
}

impl EnumServices {
    pub fn new(config: EnumServicesConfig) -> Self {
        Self { config, exec: None }
    }

    /// Use a specific executor instead of spawning the configured program.
    pub fn with_exec(config: EnumServicesConfig, exec: Arc<dyn RemoteExec>) -> Self {
        Self {
            config,
            exec: Some(exec),
        }
    }

    fn is_enumerated(&self, host: &HostRecord) -> bool {
        self.config.services.keys().all(|c| host.is_concluded(c))
    }

    fn write_raw_output(&self, ctx: &ModuleContext, raw: &[(Ipv4Addr, String)]) {
        let path = ctx.artifact_dir.join(format!(
            "raw_exec_output_{}.txt",
            Local::now().format("%Y-%m-%d_%H-%M-%S")
        ));
        let mut body = String::new();
        for (ip, output) in raw {
            body.push_str(&format!("{ip}\n*****\n{output}\n=====\n"));
        }
        match std::fs::write(&path, body) {
            Ok(()) => tracing::info!(path = %path.display(), "Wrote raw command output"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to write raw command output"),
        }
    }
}

#[async_trait]
impl Module for EnumServices {
    fn name(&self) -> &'static str {
        "enum-services"
    }

    fn csv_headers(&self) -> Vec<String> {
        let mut headers = vec![OS.to_string()];
        headers.extend(self.config.services.keys().cloned());
        headers
    }

    fn required_ports(&self) -> Vec<u16> {
        vec![SMB_PORT]
    }

    fn required_programs(&self) -> Vec<String> {
        match self.exec {
            Some(_) => Vec::new(),
            None => vec![self.config.program.clone()],
        }
    }

    async fn run(&self, ctx: &ModuleContext) -> Result<()> {
        let credentials =
            Credentials::from_config(&self.config, std::env::var_os("KRB5CCNAME"))?;

        let mut targets: Vec<(Ipv4Addr, String)> = Vec::new();
        for host in ctx.inventory.hosts_with_port(SMB_PORT) {
            if self.is_enumerated(&host) {
                continue;
            }
            if credentials.needs_hostname() {
                if host.hostname().is_empty() {
                    tracing::warn!(ip = %host.ip, "Ticket authentication needs a hostname, skipping");
                    continue;
                }
                targets.push((host.ip, host.hostname().to_string()));
            } else {
                targets.push((host.ip, host.ip.to_string()));
            }
        }
        if targets.is_empty() {
            tracing::info!(module = self.name(), "No valid targets for service enumeration");
            return Ok(());
        }
        targets.shuffle(&mut rand::rng());

        tracing::info!(
            module = self.name(),
            hosts = targets.len(),
            threads = self.config.threads,
            "Retrieving service information"
        );

        let exec: Arc<dyn RemoteExec> = match &self.exec {
            Some(exec) => exec.clone(),
            None => Arc::new(ProcessExec::new(
                &self.config.program,
                credentials,
                Duration::from_secs(self.config.timeout_secs),
            )),
        };
        let command = Arc::new(build_command(&self.config.services));
        let services = Arc::new(self.config.services.clone());
        let raw: Arc<Mutex<Vec<(Ipv4Addr, String)>>> = Arc::default();
        let inventory = ctx.inventory.clone();

        let pool = WorkerPool::new(
            self.config.threads,
            Duration::from_millis(self.config.submit_delay_ms),
            Arc::new(CircuitBreaker::new(self.config.failed_logon_limit)),
        );
        let raw_sink = raw.clone();
        let summary = pool
            .run(targets, move |(ip, target)| {
                let exec = exec.clone();
                let command = command.clone();
                let services = services.clone();
                let raw = raw_sink.clone();
                let inventory = inventory.clone();
                async move {
                    let output = match exec.exec(&target, &command).await {
                        Ok(output) => output,
                        Err(e) => {
                            tracing::warn!(%ip, error = %e, "Service enumeration failed");
                            return TaskOutcome::Failure;
                        }
                    };
                    raw.lock()
                        .push((ip, format!("{}{}", output.stdout, output.stderr)));

                    match parse_output(&output.stdout, &services) {
                        Ok(probe) => {
                            let present = probe.services.values().filter(|p| **p).count();
                            let mut fields = vec![(OS, probe.os.as_str())];
                            fields.extend(
                                probe
                                    .services
                                    .iter()
                                    .map(|(c, p)| (c.as_str(), if *p { YES } else { NO })),
                            );
                            inventory.merge_fields(&ip, fields);
                            tracing::info!(%ip, services = present, "Enumerated services");
                            TaskOutcome::Success
                        }
                        Err(ProbeFailure::LogonFailure) => {
                            tracing::warn!(%ip, "Logon failure");
                            TaskOutcome::AuthFailure
                        }
                        Err(ProbeFailure::Unparsable) => {
                            tracing::warn!(%ip, "No usable output from service enumeration");
                            TaskOutcome::Failure
                        }
                    }
                }
            })
            .await;

        if summary.halted {
            tracing::warn!(
                limit = self.config.failed_logon_limit,
                skipped = summary.skipped,
                "Logon failure limit reached, remaining hosts not enumerated"
            );
        }
        tracing::info!(
            module = self.name(),
            succeeded = summary.succeeded,
            failed = summary.failed,
            logon_failures = summary.auth_failures,
            "Service enumeration complete"
        );

        let raw = std::mem::take(&mut *raw.lock());
        if !raw.is_empty() {
            self.write_raw_output(ctx, &raw);
        }
        Ok(())
    }

    fn report(&self, inventory: &Inventory) {
        let report = service_report(&inventory.snapshot(), &self.config.services);
        if !report.is_empty() {
            println!("{report}");
        }
    }
}

/// Service prevalence, split by workstation/server, and OS counts across
/// enumerated hosts. Empty when nothing was enumerated.
pub fn service_report(hosts: &[HostRecord], services: &BTreeMap<String, String>) -> String {
    let enumerated: Vec<&HostRecord> = hosts
        .iter()
        .filter(|h| services.keys().any(|c| h.is_concluded(c)))
        .collect();
    if enumerated.is_empty() {
        return String::new();
    }

    let is_server = |h: &HostRecord| h.os().to_lowercase().contains("server");
    let servers: Vec<&HostRecord> = enumerated.iter().copied().filter(|h| is_server(h)).collect();
    let workstations: Vec<&HostRecord> =
        enumerated.iter().copied().filter(|h| !is_server(h)).collect();

    let mut out = String::from("SERVICES:\n");
    for (label, group) in [
        ("Global", &enumerated),
        ("Workstations", &workstations),
        ("Servers", &servers),
    ] {
        out.push_str(&format!("\t{label}:\n"));
        let mut counts: Vec<(&String, usize)> = services
            .keys()
            .map(|c| (c, group.iter().filter(|h| h.is_affirmative(c)).count()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        for (column, count) in counts {
            out.push_str(&format!("\t\t{column}: {}\n", ratio(count, group.len())));
        }
    }

    let mut os_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for host in &enumerated {
        if Informativeness::of(host.os()) == Informativeness::Text {
            *os_counts.entry(host.os()).or_default() += 1;
        }
    }
    let mut os_counts: Vec<(&str, usize)> = os_counts.into_iter().collect();
    os_counts.sort_by(|a, b| b.1.cmp(&a.1));
    out.push_str("\nOPERATING SYSTEMS:\n");
    for (os, count) in os_counts {
        out.push_str(&format!("\t{os}: {}\n", ratio(count, enumerated.len())));
    }
    out
}

fn ratio(count: usize, total: usize) -> String {
    let pct = if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    };
    format!("{count}/{total} ({pct:.1}%)")
}
