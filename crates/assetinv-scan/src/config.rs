//! Configuration for the asset inventory scanner.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

/// Top-level inventory configuration.
///
/// Loaded from `assetinv.toml` `[inventory]` section or
/// `ASSETINV__INVENTORY__` environment variables. CLI flags override both.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    /// Path to the zmap binary (default: "zmap").
    #[serde(default = "default_zmap_path")]
    pub zmap_path: String,

    /// Path to the nmap binary used by modules (default: "nmap").
    #[serde(default = "default_nmap_path")]
    pub nmap_path: String,

    /// Maximum egress bandwidth passed to zmap.
    #[serde(default = "default_bandwidth")]
    pub bandwidth: String,

    /// Working directory holding the cache and CSV output.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// CIDR mask used to summarize networks in reports and deltas.
    #[serde(default = "default_netmask")]
    pub netmask: u8,

    /// How the discovery sweep probes for live hosts.
    #[serde(default)]
    pub discovery_probe: ProbeModule,

    /// Port probed when `discovery_probe` is `syn`.
    #[serde(default = "default_syn_port")]
    pub discovery_syn_port: u16,

    /// Concurrent reverse DNS lookups.
    #[serde(default = "default_dns_concurrency")]
    pub dns_concurrency: usize,

    /// Upper bound for a single zmap phase, in seconds. 0 disables it.
    #[serde(default)]
    pub engine_timeout_secs: u64,

    /// Upper bound for a single nmap script scan, in seconds.
    #[serde(default = "default_nmap_timeout")]
    pub nmap_timeout_secs: u64,

    #[serde(default)]
    pub advisory: AdvisoryConfig,

    #[serde(default)]
    pub enum_services: EnumServicesConfig,

    #[serde(default)]
    pub open_vnc: OpenVncConfig,
}

/// Read the `[inventory]` section from `<file_prefix>.{toml,json,...}` and
/// `ASSETINV__INVENTORY__*` variables.
///
/// A missing file or section yields the defaults. A section that is present
/// but fails to deserialize is an error, never silently replaced.
pub fn load(file_prefix: &str) -> anyhow::Result<InventoryConfig> {
    let cfg = ::config::Config::builder()
        .add_source(::config::File::with_name(file_prefix).required(false))
        .add_source(
            ::config::Environment::with_prefix("ASSETINV")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config {file_prefix}"))?;

    match cfg.get::<InventoryConfig>("inventory") {
        Ok(c) => Ok(c),
        Err(::config::ConfigError::NotFound(_)) => Ok(InventoryConfig::default()),
        Err(e) => Err(e).context("Invalid [inventory] section"),
    }
}

/// zmap probe used for the discovery sweep.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeModule {
    /// ICMP echo: `--probe-module=icmp_echoscan`
    #[default]
    Icmp,
    /// TCP SYN to a single port: `--probe-module=tcp_synscan`
    Syn,
}

impl ProbeModule {
    pub fn zmap_name(&self) -> &'static str {
        match self {
            Self::Icmp => "icmp_echoscan",
            Self::Syn => "tcp_synscan",
        }
    }
}

/// Thresholds for the "poorly inventoried" advisory printed after a delta.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AdvisoryConfig {
    /// Fraction of known hosts that may be strays before the advisory fires.
    #[serde(default = "default_stray_ratio")]
    pub stray_host_ratio: f64,

    /// Number of stray networks tolerated before the advisory fires.
    #[serde(default = "default_stray_networks")]
    pub stray_network_limit: usize,
}

/// Settings for the remote service enumeration module.
#[derive(Debug, Clone, Deserialize)]
pub struct EnumServicesConfig {
    /// Remote execution program (any impacket-style exec script).
    #[serde(default = "default_exec_program")]
    pub program: String,

    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub domain: String,
    /// NT hashes in `LM:NT` form, used when no password is set.
    #[serde(default)]
    pub hashes: String,

    /// Parallel workers.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Per-host timeout in seconds.
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,

    /// Delay between task submissions, in milliseconds.
    #[serde(default = "default_submit_delay")]
    pub submit_delay_ms: u64,

    /// Consecutive logon failures before the module stops. 0 disables the limit.
    #[serde(default = "default_logon_limit")]
    pub failed_logon_limit: usize,

    /// CSV column → service name fragment matched against `sc query` output.
    #[serde(default = "default_services")]
    pub services: BTreeMap<String, String>,
}

/// Settings for the open VNC module.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenVncConfig {
    /// Take screenshots of unauthenticated VNC servers.
    #[serde(default = "default_true")]
    pub screenshots: bool,

    #[serde(default = "default_vncsnapshot_path")]
    pub vncsnapshot_path: String,

    #[serde(default = "default_screenshot_timeout")]
    pub screenshot_timeout_secs: u64,
}

fn default_zmap_path() -> String {
    "zmap".to_string()
}

fn default_nmap_path() -> String {
    "nmap".to_string()
}

fn default_bandwidth() -> String {
    "500K".to_string()
}

fn default_work_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".asset_inventory")
}

fn default_netmask() -> u8 {
    16
}

fn default_syn_port() -> u16 {
    80
}

fn default_dns_concurrency() -> usize {
    16
}

fn default_stray_ratio() -> f64 {
    0.05
}

fn default_stray_networks() -> usize {
    1
}

fn default_nmap_timeout() -> u64 {
    3600
}

fn default_exec_program() -> String {
    "wmiexec.py".to_string()
}

fn default_threads() -> usize {
    5
}

fn default_exec_timeout() -> u64 {
    60
}

fn default_submit_delay() -> u64 {
    750
}

fn default_logon_limit() -> usize {
    3
}

fn default_services() -> BTreeMap<String, String> {
    [
        ("CrowdStrike", "CSFalcon"),
        ("Carbon Black", "CarbonBlack"),
        ("Windows Defender", "WinDefend"),
        ("Symantec", "Symantec"),
        ("McAfee", "McAfee"),
        ("Sysmon", "Sysmon"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_vncsnapshot_path() -> String {
    "vncsnapshot".to_string()
}

fn default_screenshot_timeout() -> u64 {
    15
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            zmap_path: default_zmap_path(),
            nmap_path: default_nmap_path(),
            bandwidth: default_bandwidth(),
            work_dir: default_work_dir(),
            netmask: default_netmask(),
            discovery_probe: ProbeModule::default(),
            discovery_syn_port: default_syn_port(),
            dns_concurrency: default_dns_concurrency(),
            engine_timeout_secs: 0,
            nmap_timeout_secs: default_nmap_timeout(),
            advisory: AdvisoryConfig::default(),
            enum_services: EnumServicesConfig::default(),
            open_vnc: OpenVncConfig::default(),
        }
    }
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            stray_host_ratio: default_stray_ratio(),
            stray_network_limit: default_stray_networks(),
        }
    }
}

impl Default for EnumServicesConfig {
    fn default() -> Self {
        Self {
            program: default_exec_program(),
            username: String::new(),
            password: String::new(),
            domain: String::new(),
            hashes: String::new(),
            threads: default_threads(),
            timeout_secs: default_exec_timeout(),
            submit_delay_ms: default_submit_delay(),
            failed_logon_limit: default_logon_limit(),
            services: default_services(),
        }
    }
}

impl Default for OpenVncConfig {
    fn default() -> Self {
        Self {
            screenshots: true,
            vncsnapshot_path: default_vncsnapshot_path(),
            screenshot_timeout_secs: default_screenshot_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_module_names() {
        assert_eq!(ProbeModule::Icmp.zmap_name(), "icmp_echoscan");
        assert_eq!(ProbeModule::Syn.zmap_name(), "tcp_synscan");
    }

    #[test]
    fn test_default_config() {
        let config = InventoryConfig::default();
        assert_eq!(config.zmap_path, "zmap");
        assert_eq!(config.bandwidth, "500K");
        assert_eq!(config.netmask, 16);
        assert_eq!(config.discovery_probe, ProbeModule::Icmp);
        assert!(config.work_dir.ends_with(".asset_inventory"));
        assert_eq!(config.advisory.stray_host_ratio, 0.05);
        assert_eq!(config.advisory.stray_network_limit, 1);
        assert_eq!(config.enum_services.failed_logon_limit, 3);
        assert_eq!(config.open_vnc.screenshot_timeout_secs, 15);
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let json = serde_json::json!({
            "bandwidth": "10M",
            "discovery_probe": "syn",
            "enum_services": { "username": "auditor", "threads": 2 }
        });
        let config: InventoryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.bandwidth, "10M");
        assert_eq!(config.discovery_probe, ProbeModule::Syn);
        assert_eq!(config.nmap_path, "nmap");
        assert_eq!(config.enum_services.username, "auditor");
        assert_eq!(config.enum_services.threads, 2);
        assert_eq!(config.enum_services.timeout_secs, 60);
        assert_eq!(config.nmap_timeout_secs, 3600);
        assert!(config.enum_services.services.contains_key("Sysmon"));
    }

    fn write_config(dir: &std::path::Path, body: &str) -> String {
        std::fs::write(dir.join("assetinv.toml"), body).unwrap();
        dir.join("assetinv").display().to_string()
    }

    #[test]
    fn test_load_without_file_or_section_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent").display().to_string();
        assert_eq!(load(&missing).unwrap().netmask, 16);

        let prefix = write_config(dir.path(), "[other]\nkey = 1\n");
        assert_eq!(load(&prefix).unwrap().bandwidth, "500K");
    }

    #[test]
    fn test_load_reads_inventory_section() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = write_config(
            dir.path(),
            "[inventory]\nnetmask = 24\n\n[inventory.enum_services]\nfailed_logon_limit = 5\n",
        );
        let config = load(&prefix).unwrap();
        assert_eq!(config.netmask, 24);
        assert_eq!(config.enum_services.failed_logon_limit, 5);
    }

    #[test]
    fn test_load_rejects_malformed_section() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = write_config(
            dir.path(),
            "[inventory.enum_services]\nfailed_logon_limit = \"three\"\n",
        );
        assert!(load(&prefix).is_err());
    }
}
