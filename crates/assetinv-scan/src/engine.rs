//! zmap process wrapper.
//!
//! Executes zmap as a child process via `tokio::process::Command`, once per
//! phase across every eligible address, and parses the output file into
//! `(address, port)` hits.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Local;
use ipnet::Ipv4Net;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::ProbeModule;
use crate::error::{InventoryError, Result};

/// What a single engine invocation is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineMode {
    /// Alive-host sweep. `port` is only used by the SYN probe.
    Discovery { probe: ProbeModule, port: u16 },
    /// SYN scan of a single TCP port.
    PortScan { port: u16 },
}

impl EngineMode {
    /// The port a hit refers to, if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Discovery { .. } => None,
            Self::PortScan { port } => Some(*port),
        }
    }
}

/// One batched engine invocation.
#[derive(Debug, Clone)]
pub struct EngineJob {
    /// Short phase label used in artifact names, e.g. `ping` or `port-445`.
    pub phase: String,
    pub mode: EngineMode,
    pub targets: Vec<Ipv4Net>,
    /// Addresses the engine must not probe.
    pub exclude: Vec<Ipv4Net>,
}

/// Result of a single engine execution.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    /// Unique ID for this invocation.
    pub scan_id: Uuid,
    /// Responding addresses with the port they answered on (port scans only).
    pub hits: Vec<(Ipv4Addr, Option<u16>)>,
    /// Raw output artifact, kept in the cache directory.
    pub artifact: Option<PathBuf>,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// The external scan engine, opaque beyond this contract.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    async fn run(&self, job: &EngineJob) -> Result<EngineOutput>;
}

/// Wrapper around the zmap binary.
pub struct ZmapEngine {
    zmap_path: String,
    bandwidth: String,
    interface: Option<String>,
    gateway_mac: Option<String>,
    output_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ZmapEngine {
    pub fn new(zmap_path: &str, bandwidth: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            zmap_path: zmap_path.to_string(),
            bandwidth: bandwidth.to_string(),
            interface: None,
            gateway_mac: None,
            output_dir: output_dir.into(),
            timeout: None,
        }
    }

    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_gateway_mac(mut self, gateway_mac: Option<String>) -> Self {
        self.gateway_mac = gateway_mac;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the full argument list for a job.
    pub fn build_args(
        &self,
        job: &EngineJob,
        targets_file: &Path,
        exclude_file: Option<&Path>,
        output_file: &Path,
    ) -> Vec<String> {
        let mut args = vec![
            format!("--bandwidth={}", self.bandwidth),
            format!("--output-file={}", output_file.display()),
            "--output-fields=saddr".to_string(),
            format!("--whitelist-file={}", targets_file.display()),
        ];
        if let Some(exclude) = exclude_file {
            args.push(format!("--blacklist-file={}", exclude.display()));
        }
        if let Some(interface) = &self.interface {
            args.push(format!("--interface={interface}"));
        }
        if let Some(mac) = &self.gateway_mac {
            args.push(format!("--gateway-mac={mac}"));
        }
        match &job.mode {
            EngineMode::Discovery { probe, port } => {
                args.push(format!("--probe-module={}", probe.zmap_name()));
                if *probe == ProbeModule::Syn {
                    args.push(format!("--target-port={port}"));
                }
            }
            EngineMode::PortScan { port } => {
                args.push(format!("--probe-module={}", ProbeModule::Syn.zmap_name()));
                args.push(format!("--target-port={port}"));
            }
        }
        args
    }
}

#[async_trait]
impl ScanEngine for ZmapEngine {
    /// Run zmap for one phase. Target and exclusion lists are written next to
    /// the output so every phase leaves a complete record in the cache.
    async fn run(&self, job: &EngineJob) -> Result<EngineOutput> {
        let scan_id = Uuid::new_v4();
        let start = Instant::now();

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let targets_file = self
            .output_dir
            .join(format!("{}_targets_{stamp}.txt", job.phase));
        let exclude_file = self
            .output_dir
            .join(format!("{}_exclude_{stamp}.txt", job.phase));
        let output_file = self.output_dir.join(format!("{}_{stamp}.txt", job.phase));

        tokio::fs::write(&targets_file, net_list(&job.targets)).await?;
        let exclude = if job.exclude.is_empty() {
            None
        } else {
            tokio::fs::write(&exclude_file, net_list(&job.exclude)).await?;
            Some(exclude_file.as_path())
        };

        let args = self.build_args(job, &targets_file, exclude, &output_file);

        tracing::info!(
            scan_id = %scan_id,
            phase = %job.phase,
            targets = job.targets.len(),
            excluded = job.exclude.len(),
            command = %format!("{} {}", self.zmap_path, args.join(" ")),
            "Starting zmap"
        );

        let mut command = Command::new(&self.zmap_path);
        command.args(&args).kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| InventoryError::EngineTimeout {
                    program: self.zmap_path.clone(),
                    seconds: limit.as_secs(),
                })?,
            None => command.output().await,
        }
        .map_err(|e| InventoryError::EngineLaunch {
            program: self.zmap_path.clone(),
            reason: e.to_string(),
        })?;

        let duration = start.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(InventoryError::EngineFailed {
                program: self.zmap_path.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let raw = tokio::fs::read_to_string(&output_file)
            .await
            .map_err(|e| InventoryError::Parse {
                path: output_file.display().to_string(),
                reason: e.to_string(),
            })?;
        let hits = parse_engine_output(&raw, job.mode.port()).map_err(|reason| {
            InventoryError::Parse {
                path: output_file.display().to_string(),
                reason,
            }
        })?;

        tracing::info!(
            scan_id = %scan_id,
            phase = %job.phase,
            responded = hits.len(),
            duration_ms = duration.as_millis(),
            "zmap complete"
        );

        Ok(EngineOutput {
            scan_id,
            hits,
            artifact: Some(output_file),
            duration,
        })
    }
}

fn net_list(nets: &[Ipv4Net]) -> String {
    let mut out = String::new();
    for net in nets {
        out.push_str(&net.to_string());
        out.push('\n');
    }
    out
}

/// Parse zmap `saddr` output: one address per line, optional `saddr` header,
/// extra comma-separated fields ignored. Any other unparsable line makes the
/// whole artifact suspect.
pub fn parse_engine_output(
    raw: &str,
    port: Option<u16>,
) -> std::result::Result<Vec<(Ipv4Addr, Option<u16>)>, String> {
    let mut hits = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let field = line.split(',').next().unwrap_or("").trim();
        if field.eq_ignore_ascii_case("saddr") {
            continue;
        }
        let ip: Ipv4Addr = field
            .parse()
            .map_err(|_| format!("line {}: \"{line}\" is not an IPv4 address", lineno + 1))?;
        if seen.insert(ip) {
            hits.push((ip, port));
        }
    }

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(mode: EngineMode) -> EngineJob {
        EngineJob {
            phase: "ping".to_string(),
            mode,
            targets: vec!["10.0.0.0/30".parse().unwrap()],
            exclude: vec![],
        }
    }

    #[test]
    fn test_parse_engine_output() {
        let raw = "saddr\n10.0.0.1\n\n10.0.0.2\n10.0.0.1\n";
        let hits = parse_engine_output(raw, Some(22)).unwrap();
        assert_eq!(
            hits,
            vec![
                (Ipv4Addr::new(10, 0, 0, 1), Some(22)),
                (Ipv4Addr::new(10, 0, 0, 2), Some(22)),
            ]
        );
    }

    #[test]
    fn test_parse_engine_output_extra_fields() {
        let raw = "saddr,sport\n10.0.0.9,445\n";
        let hits = parse_engine_output(raw, None).unwrap();
        assert_eq!(hits, vec![(Ipv4Addr::new(10, 0, 0, 9), None)]);
    }

    #[test]
    fn test_parse_engine_output_rejects_garbage() {
        assert!(parse_engine_output("10.0.0.1\n\u{0}\u{0}garbage\n", None).is_err());
        assert!(parse_engine_output("", None).unwrap().is_empty());
    }

    #[test]
    fn test_build_args_discovery() {
        let engine = ZmapEngine::new("zmap", "500K", "/tmp/zmap")
            .with_interface(Some("eth0".to_string()))
            .with_gateway_mac(Some("aa:bb:cc:dd:ee:ff".to_string()));
        let args = engine.build_args(
            &job(EngineMode::Discovery {
                probe: ProbeModule::Icmp,
                port: 80,
            }),
            Path::new("/tmp/t.txt"),
            None,
            Path::new("/tmp/o.txt"),
        );
        assert!(args.contains(&"--bandwidth=500K".to_string()));
        assert!(args.contains(&"--probe-module=icmp_echoscan".to_string()));
        assert!(args.contains(&"--interface=eth0".to_string()));
        assert!(args.contains(&"--gateway-mac=aa:bb:cc:dd:ee:ff".to_string()));
        assert!(args.contains(&"--whitelist-file=/tmp/t.txt".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--target-port")));
        assert!(!args.iter().any(|a| a.starts_with("--blacklist-file")));
    }

    #[test]
    fn test_build_args_port_scan() {
        let engine = ZmapEngine::new("zmap", "1M", "/tmp/zmap");
        let args = engine.build_args(
            &job(EngineMode::PortScan { port: 445 }),
            Path::new("/tmp/t.txt"),
            Some(Path::new("/tmp/x.txt")),
            Path::new("/tmp/o.txt"),
        );
        assert!(args.contains(&"--probe-module=tcp_synscan".to_string()));
        assert!(args.contains(&"--target-port=445".to_string()));
        assert!(args.contains(&"--blacklist-file=/tmp/x.txt".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ZmapEngine::new("/nonexistent/zmap-binary", "500K", dir.path());
        let err = engine
            .run(&job(EngineMode::PortScan { port: 22 }))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::EngineLaunch { .. }));
    }
}
