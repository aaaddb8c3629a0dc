//! Batched nmap NSE runs shared by the built-in modules.
//!
//! Executes nmap as a child process via `tokio::process::Command` with
//! `-oA <prefix>` so all three output formats land in the work directory,
//! then parses `<prefix>.xml`. Every run is bounded by the configured
//! nmap timeout; a hung NSE script kills the child and fails that scan only.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::InventoryConfig;
use crate::error::{InventoryError, Result};
use crate::nmap_xml::{self, NmapRun};

/// The nmap binary and how long one script scan may take.
#[derive(Debug, Clone)]
pub struct Nmap {
    pub path: String,
    pub timeout: Duration,
}

impl Nmap {
    pub fn new(path: &str, timeout: Duration) -> Self {
        Self {
            path: path.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &InventoryConfig) -> Self {
        Self::new(
            &config.nmap_path,
            Duration::from_secs(config.nmap_timeout_secs),
        )
    }
}

/// One script scan over a batch of hosts.
pub struct ScriptScan<'a> {
    /// Artifact name prefix, e.g. `eternalblue`.
    pub label: &'a str,
    pub script: &'a str,
    pub ports: &'a [u16],
}

impl ScriptScan<'_> {
    pub fn build_args(&self, output_prefix: &str, targets_file: &str) -> Vec<String> {
        let ports: Vec<String> = self.ports.iter().map(u16::to_string).collect();
        vec![
            format!("-p{}", ports.join(",")),
            "-T4".to_string(),
            "-n".to_string(),
            "-Pn".to_string(),
            "-v".to_string(),
            "-sV".to_string(),
            format!("--script={}", self.script),
            "-oA".to_string(),
            output_prefix.to_string(),
            "-iL".to_string(),
            targets_file.to_string(),
        ]
    }

    /// Run nmap against `targets` and return the parsed XML.
    pub async fn run(
        &self,
        nmap: &Nmap,
        artifact_dir: &std::path::Path,
        targets: &[Ipv4Addr],
    ) -> Result<NmapRun> {
        let scan_id = Uuid::new_v4();
        let start = Instant::now();

        tokio::fs::create_dir_all(artifact_dir).await?;
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let targets_file = artifact_dir.join(format!("{}_targets_{stamp}", self.label));
        let output_prefix: PathBuf = artifact_dir.join(format!("{}_results_{stamp}", self.label));

        let mut list = String::new();
        for ip in targets {
            list.push_str(&ip.to_string());
            list.push('\n');
        }
        tokio::fs::write(&targets_file, list).await?;

        let args = self.build_args(
            &output_prefix.display().to_string(),
            &targets_file.display().to_string(),
        );

        let nmap_path = nmap.path.as_str();
        tracing::info!(
            scan_id = %scan_id,
            script = self.script,
            targets = targets.len(),
            command = %format!("{nmap_path} {}", args.join(" ")),
            "Starting nmap script scan"
        );

        let mut command = Command::new(nmap_path);
        command.args(&args).kill_on_drop(true);

        let output = tokio::time::timeout(nmap.timeout, command.output())
            .await
            .map_err(|_| InventoryError::EngineTimeout {
                program: nmap_path.to_string(),
                seconds: nmap.timeout.as_secs(),
            })?
            .map_err(|e| InventoryError::EngineLaunch {
                program: nmap_path.to_string(),
                reason: e.to_string(),
            })?;

        let duration = start.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(InventoryError::EngineFailed {
                program: nmap_path.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let xml_path = output_prefix.with_extension("xml");
        let run = nmap_xml::parse_nmap_xml_file(&xml_path)?;

        tracing::info!(
            scan_id = %scan_id,
            script = self.script,
            hosts = run.hosts.len(),
            output = %format!("{}.*", output_prefix.display()),
            duration_ms = duration.as_millis(),
            "Nmap script scan complete"
        );

        Ok(run)
    }
}
