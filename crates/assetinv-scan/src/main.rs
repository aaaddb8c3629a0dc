//! CLI entry point for the assetinv network inventory scanner.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ipnet::Ipv4Net;
use tracing_subscriber::{fmt, EnvFilter};

use assetinv_cache::HostCache;
use assetinv_core::HostRecord;

use assetinv_scan::config::{self, InventoryConfig};
use assetinv_scan::deliverable;
use assetinv_scan::delta::{self, Reference};
use assetinv_scan::engine::ZmapEngine;
use assetinv_scan::error::{InventoryError, Result};
use assetinv_scan::modules::ModuleRegistry;
use assetinv_scan::orchestrator::{Orchestrator, RunOptions};
use assetinv_scan::output;
use assetinv_scan::plan::parse_ports;
use assetinv_scan::report;
use assetinv_scan::resolve::{DnsResolver, HostResolver, NoResolver};
use assetinv_scan::targets::{self, DEFAULT_TARGETS};

#[derive(Parser)]
#[command(name = "assetinv")]
#[command(about = "Internal network asset inventory built on zmap")]
struct Cli {
    /// Networks to scan: CIDR or start-end ranges.
    #[arg(short, long, num_args = 1.., default_values_t = DEFAULT_TARGETS.map(String::from))]
    targets: Vec<String>,

    /// Additional TCP ports to scan, e.g. 22,80,5900-5902.
    #[arg(short, long)]
    ports: Option<String>,

    /// Don't resolve hostnames.
    #[arg(long)]
    no_dns: bool,

    /// Resolve hostnames for cached hosts that have none.
    #[arg(long, conflicts_with = "no_dns")]
    force_dns: bool,

    /// Maximum zmap bandwidth, e.g. 500K or 10M.
    #[arg(short = 'B', long)]
    bandwidth: Option<String>,

    /// Network interface for zmap.
    #[arg(short, long)]
    interface: Option<String>,

    /// Gateway MAC address for zmap.
    #[arg(short = 'G', long)]
    gateway_mac: Option<String>,

    /// File of networks never to scan.
    #[arg(long)]
    blacklist: Option<PathBuf>,

    /// File of networks scanning is restricted to.
    #[arg(long)]
    whitelist: Option<PathBuf>,

    /// Back up the cache and start from nothing.
    #[arg(long)]
    start_fresh: bool,

    /// Skip the discovery sweep and port-scan every target address.
    #[arg(long)]
    skip_ping: bool,

    /// Sweep networks that were already swept.
    #[arg(long)]
    force_ping: bool,

    /// Rescan ports on hosts that were already scanned.
    #[arg(long)]
    force_syn: bool,

    /// Enrichment modules to run, or "all".
    #[arg(short = 'M', long, num_args = 1..)]
    modules: Vec<String>,

    /// Directory holding the cache and output (default from config).
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Where to write the inventory CSV.
    #[arg(short = 'f', long)]
    csv_file: Option<PathBuf>,

    /// Earlier inventory CSV or target list to compare against.
    #[arg(short, long)]
    diff: Option<PathBuf>,

    /// CIDR mask for network summaries and deltas (default from config).
    #[arg(short, long)]
    netmask: Option<u8>,

    /// Combine every inventory CSV in the work dir into one deliverable.
    #[arg(long)]
    make_deliverable: bool,

    /// Config file prefix (default: assetinv).
    #[arg(short, long, default_value = "assetinv")]
    config: String,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

/// Validated settings for one run.
struct Plan {
    config: InventoryConfig,
    options: RunOptions,
    registry: ModuleRegistry,
    work_dir: PathBuf,
    netmask: u8,
    reference: Option<(PathBuf, Reference)>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                config = %cli.config,
                error = %format!("{e:#}"),
                "Failed to load config, using defaults"
            );
            InventoryConfig::default()
        }
    };

    let plan = match validate(&cli, config) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("[!] {e}");
            return ExitCode::from(2);
        }
    };

    run(cli, plan).await
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn validate(cli: &Cli, mut config: InventoryConfig) -> Result<Plan> {
    let targets = targets::resolve_targets(&cli.targets)?;
    let ports = match &cli.ports {
        Some(spec) => parse_ports(spec)
            .map_err(|e| InventoryError::Validation(format!("Invalid --ports: {e}")))?,
        None => Vec::new(),
    };

    if cli.skip_ping && cli.force_ping {
        return Err(InventoryError::Validation(
            "--skip-ping and --force-ping cannot be combined".to_string(),
        ));
    }
    if cli.skip_ping && ports.is_empty() {
        return Err(InventoryError::Validation(
            "--skip-ping needs --ports, otherwise there is nothing to do".to_string(),
        ));
    }

    let netmask = cli.netmask.unwrap_or(config.netmask);
    if netmask > 32 {
        return Err(InventoryError::Validation(format!(
            "Invalid netmask /{netmask}, expected 0-32"
        )));
    }

    let blacklist = match &cli.blacklist {
        Some(path) => targets::read_target_file(path)?,
        None => Vec::new(),
    };
    let whitelist = match &cli.whitelist {
        Some(path) => Some(targets::read_target_file(path)?),
        None => None,
    };

    let reference = match &cli.diff {
        Some(path) => Some((path.clone(), Reference::load(path)?)),
        None => None,
    };

    if let Some(bandwidth) = &cli.bandwidth {
        config.bandwidth = bandwidth.clone();
    }
    if let Some(work_dir) = &cli.work_dir {
        config.work_dir = work_dir.clone();
    }

    let mut registry = ModuleRegistry::builtin(&config);
    registry.select(&cli.modules)?;

    let options = RunOptions {
        targets,
        blacklist,
        whitelist,
        ports,
        skip_ping: cli.skip_ping,
        force_ping: cli.force_ping,
        force_syn: cli.force_syn,
        resolve_dns: !cli.no_dns,
        force_dns: cli.force_dns,
        probe: config.discovery_probe,
        syn_port: config.discovery_syn_port,
        dns_concurrency: config.dns_concurrency,
    };

    Ok(Plan {
        work_dir: config.work_dir.clone(),
        config,
        options,
        registry,
        netmask,
        reference,
    })
}

async fn run(cli: Cli, plan: Plan) -> ExitCode {
    let Plan {
        config,
        options,
        registry,
        work_dir,
        netmask,
        reference,
    } = plan;

    if cli.start_fresh {
        match HostCache::new(&work_dir).reset_fresh() {
            Ok(Some(backup)) => println!("[+] Backed up cache to {}", backup.display()),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to back up cache"),
        }
    }

    let cache = HostCache::new(&work_dir);
    let timeout = (config.engine_timeout_secs > 0)
        .then(|| Duration::from_secs(config.engine_timeout_secs));
    let engine = ZmapEngine::new(&config.zmap_path, &config.bandwidth, cache.engine_dir())
        .with_interface(cli.interface.clone())
        .with_gateway_mac(cli.gateway_mac.clone())
        .with_timeout(timeout);
    let resolver: Arc<dyn HostResolver> = if cli.no_dns {
        Arc::new(NoResolver)
    } else {
        Arc::new(DnsResolver)
    };

    let mut orchestrator =
        Orchestrator::new(Arc::new(engine), resolver, &work_dir, registry, options);
    orchestrator.load_cache().await;

    let finished = tokio::select! {
        summary = orchestrator.run() => Some(summary),
        _ = tokio::signal::ctrl_c() => None,
    };

    let Some(summary) = finished else {
        tracing::warn!("Interrupted, saving cache");
        orchestrator.persist();
        return ExitCode::from(1);
    };
    if !summary.cache_saved {
        tracing::warn!("Cache was not saved; the next run will repeat this work");
    }

    let inventory = orchestrator.inventory();
    let hosts = inventory.snapshot();
    let layout = output::inventory_layout(inventory, orchestrator.state(), orchestrator.plan().ports());

    let csv_file = cli
        .csv_file
        .clone()
        .unwrap_or_else(|| output::stamped_path(&work_dir, "asset_inventory"));
    output::write_inventory(&csv_file, &hosts, &layout, orchestrator.state());

    print!(
        "{}",
        report::summary(&hosts, orchestrator.plan().ports(), netmask)
    );
    println!();
    orchestrator.registry().report(inventory);

    if let Some((path, reference)) = reference {
        let delta = delta::compute_delta(&hosts, &reference, netmask, &config.advisory);
        let cwd = Path::new(".");

        let network_csv = output::stamped_path(cwd, "network_diff");
        let network_csv = match output::write_network_delta(&network_csv, &delta.networks) {
            Ok(()) => Some(network_csv),
            Err(e) => {
                tracing::error!(error = %e, "Failed to write network delta");
                None
            }
        };
        let host_csv = output::stamped_path(cwd, "host_diff");
        let host_csv = output::write_inventory(&host_csv, &delta.hosts, &layout, orchestrator.state())
            .then_some(host_csv);

        print!(
            "{}",
            report::delta_listing(&delta, &path, network_csv.as_deref(), host_csv.as_deref())
        );
    }

    if cli.make_deliverable {
        make_deliverable(&work_dir, orchestrator.scope(), &hosts);
    }

    println!();
    println!("[+] CSV file written to {}", csv_file.display());
    ExitCode::SUCCESS
}

fn make_deliverable(work_dir: &Path, scope: &[Ipv4Net], hosts: &[HostRecord]) {
    println!();
    println!("[+] Combining all data gathered to date for specified targets:");
    for net in scope {
        println!("     - {net}");
    }

    let files = match deliverable::find_inventories(work_dir) {
        Ok(files) => files,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list inventory CSVs");
            return;
        }
    };
    for file in &files {
        println!("[+] Found asset inventory CSV: {}", file.display());
    }

    let current: BTreeSet<Ipv4Addr> = hosts
        .iter()
        .map(|h| h.ip)
        .filter(|ip| targets::contains(scope, ip))
        .collect();
    let combined = deliverable::combine(&files, &current);

    let path = output::stamped_path(work_dir, "asset_inventory_deliverable");
    println!("[+] Writing combined list to {}", path.display());
    if let Err(e) = combined.write(&path) {
        tracing::error!(path = %path.display(), error = %e, "Failed to write deliverable");
    }
}
