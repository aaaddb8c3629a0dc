//! Host cache storage under the working directory.
//!
//! ```text
//! {work_dir}/
//!   cache/
//!     hosts.csv      known hosts, inventory table layout
//!     state.json     scanned ports, swept networks, open ports
//!     zmap/          per-phase engine target lists and raw output
//!   cache_2026-01-15_10-00-00.bak/
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use assetinv_core::types::{HostReader, HostRecord};

use crate::state::ScanState;
use crate::table::{self, is_core_column, parse_port_column, TableLayout};

const HOSTS_FILE: &str = "hosts.csv";
const STATE_FILE: &str = "state.json";
const ENGINE_DIR: &str = "zmap";
const STATE_VERSION: u32 = 1;

/// Errors that can occur while reading or writing the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported cache state version {found}")]
    Version { found: u32 },
}

/// On-disk form of `state.json`.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    open_ports: BTreeMap<Ipv4Addr, BTreeSet<u16>>,
    #[serde(default)]
    scan: ScanState,
}

/// Everything restored from a previous run.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    pub hosts: Vec<HostRecord>,
    pub state: ScanState,
}

/// File-system backed host cache.
#[derive(Debug, Clone)]
pub struct HostCache {
    root: PathBuf,
}

impl HostCache {
    /// Cache rooted at `<work_dir>/cache`. Nothing is created until
    /// `prepare` or `dump` is called.
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self {
            root: work_dir.as_ref().join("cache"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for raw scan-engine artifacts.
    pub fn engine_dir(&self) -> PathBuf {
        self.root.join(ENGINE_DIR)
    }

    pub fn prepare(&self) -> Result<(), CacheError> {
        fs::create_dir_all(self.engine_dir())?;
        Ok(())
    }

    /// Move any existing cache aside to a timestamped backup.
    /// Returns the backup path, or `None` if there was nothing to move.
    pub fn reset_fresh(&self) -> Result<Option<PathBuf>, CacheError> {
        if !self.root.exists() {
            return Ok(None);
        }

        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let mut backup = self.backup_path(&stamp.to_string(), 0);
        let mut attempt = 0;
        while backup.exists() {
            attempt += 1;
            backup = self.backup_path(&stamp.to_string(), attempt);
        }

        fs::rename(&self.root, &backup)?;
        tracing::info!(
            from = %self.root.display(),
            to = %backup.display(),
            "Backed up existing cache"
        );
        Ok(Some(backup))
    }

    fn backup_path(&self, stamp: &str, attempt: u32) -> PathBuf {
        let name = self
            .root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("cache");
        let file = if attempt == 0 {
            format!("{name}_{stamp}.bak")
        } else {
            format!("{name}_{stamp}_{attempt}.bak")
        };
        self.root.with_file_name(file)
    }

    /// Restore the previous run. A missing cache yields an empty snapshot;
    /// an unreadable one is logged and also yields an empty snapshot.
    pub fn load(&self, readers: &[&dyn HostReader]) -> CacheSnapshot {
        match self.try_load(readers) {
            Ok(snapshot) => {
                tracing::info!(
                    hosts = snapshot.hosts.len(),
                    scanned_ports = snapshot.state.scanned_ports().len(),
                    "Loaded host cache"
                );
                snapshot
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.root.display(),
                    error = %e,
                    "Failed to load host cache, starting empty"
                );
                CacheSnapshot::default()
            }
        }
    }

    pub fn try_load(&self, readers: &[&dyn HostReader]) -> Result<CacheSnapshot, CacheError> {
        let hosts_path = self.root.join(HOSTS_FILE);
        let state_path = self.root.join(STATE_FILE);

        let state_file = if state_path.is_file() {
            let json = fs::read_to_string(&state_path)?;
            let parsed: StateFile = serde_json::from_str(&json)?;
            if parsed.version != STATE_VERSION {
                return Err(CacheError::Version {
                    found: parsed.version,
                });
            }
            Some(parsed)
        } else {
            None
        };

        let mut hosts = Vec::new();
        if hosts_path.is_file() {
            for row in table::read_rows(&hosts_path)? {
                let mut host = match HostRecord::from_csv_row(&row) {
                    Ok(h) => h,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping unreadable cached host");
                        continue;
                    }
                };

                for reader in readers {
                    reader.read_host(&row, &mut host);
                }
                // Columns no registered module claimed are kept as-is.
                for (column, value) in &row {
                    if is_core_column(column) || parse_port_column(column).is_some() {
                        continue;
                    }
                    host.fields
                        .entry(column.clone())
                        .or_insert_with(|| value.trim().to_string());
                }
                hosts.push(host);
            }
        }

        let (open_ports, state) = match state_file {
            Some(f) => (f.open_ports, f.scan),
            None => (BTreeMap::new(), ScanState::default()),
        };

        for host in &mut hosts {
            if let Some(ports) = open_ports.get(&host.ip) {
                host.open_ports.extend(ports.iter().copied());
            }
        }
        // Hosts seen only through port scans before their row was written.
        for (ip, ports) in &open_ports {
            if !hosts.iter().any(|h| &h.ip == ip) {
                let mut host = HostRecord::new(*ip);
                host.open_ports.extend(ports.iter().copied());
                hosts.push(host);
            }
        }
        hosts.sort_by_key(|h| h.ip);

        Ok(CacheSnapshot { hosts, state })
    }

    /// Persist hosts and bookkeeping. Failures are logged, not returned, so
    /// results that were already reported are never lost to a cache error.
    pub fn dump(&self, hosts: &[HostRecord], columns: &[String], state: &ScanState) -> bool {
        match self.try_dump(hosts, columns, state) {
            Ok(()) => {
                tracing::info!(
                    path = %self.root.display(),
                    hosts = hosts.len(),
                    "Host cache saved"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.root.display(),
                    error = %e,
                    "Failed to save host cache"
                );
                false
            }
        }
    }

    pub fn try_dump(
        &self,
        hosts: &[HostRecord],
        columns: &[String],
        state: &ScanState,
    ) -> Result<(), CacheError> {
        self.prepare()?;

        let layout = TableLayout::covering(columns.to_vec(), hosts, Vec::new());
        table::write_hosts_to(&self.root.join(HOSTS_FILE), hosts, &layout, None)?;

        let state_file = StateFile {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            open_ports: hosts
                .iter()
                .filter(|h| !h.open_ports.is_empty())
                .map(|h| (h.ip, h.open_ports.clone()))
                .collect(),
            scan: state.clone(),
        };
        let json = serde_json::to_string_pretty(&state_file)?;
        let path = self.root.join(STATE_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetinv_core::types::{read_column, CsvRow};

    struct VncReader;

    impl HostReader for VncReader {
        fn read_host(&self, row: &CsvRow, host: &mut HostRecord) {
            host.set_field("Open VNC", &read_column(row, "Open VNC"));
        }
    }

    fn sample_hosts() -> Vec<HostRecord> {
        let mut a = HostRecord::new(Ipv4Addr::new(10, 0, 0, 1)).with_hostname("ws01");
        a.open_ports.extend([445, 5900]);
        a.set_field("Open VNC", "Yes");
        a.set_field("OS", "Windows 10 Pro");

        let mut b = HostRecord::new(Ipv4Addr::new(10, 0, 0, 2));
        b.set_field("Open VNC", "No");
        vec![a, b]
    }

    #[test]
    fn load_missing_cache_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HostCache::new(dir.path());
        let snapshot = cache.try_load(&[]).unwrap();
        assert!(snapshot.hosts.is_empty());
        assert_eq!(snapshot.state, ScanState::default());
    }

    #[test]
    fn dump_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HostCache::new(dir.path());
        let hosts = sample_hosts();

        let mut state = ScanState::default();
        state.mark_scanned(445, hosts.iter().map(|h| h.ip));
        state.record_sweep(&["10.0.0.0/30".parse().unwrap()]);

        let columns = vec!["Open VNC".to_string()];
        assert!(cache.dump(&hosts, &columns, &state));

        let reader = VncReader;
        let snapshot = cache.try_load(&[&reader]).unwrap();
        assert_eq!(snapshot.hosts, hosts);
        assert_eq!(snapshot.state, state);
    }

    #[test]
    fn reader_defaults_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HostCache::new(dir.path());
        cache
            .try_dump(&sample_hosts(), &[], &ScanState::default())
            .unwrap();

        let reader = VncReader;
        let snapshot = cache.try_load(&[&reader]).unwrap();
        assert_eq!(snapshot.hosts[0].field("Open VNC"), Some("N/A"));
    }

    #[test]
    fn unclaimed_columns_survive_dump() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HostCache::new(dir.path());
        let columns = vec!["Open VNC".to_string()];
        cache
            .try_dump(&sample_hosts(), &columns, &ScanState::default())
            .unwrap();

        // Reload and dump again with no module claiming "Open VNC".
        let snapshot = cache.try_load(&[]).unwrap();
        cache
            .try_dump(&snapshot.hosts, &[], &ScanState::default())
            .unwrap();

        let snapshot = cache.try_load(&[]).unwrap();
        assert_eq!(snapshot.hosts[0].field("Open VNC"), Some("Yes"));
        assert_eq!(snapshot.hosts[1].field("Open VNC"), Some("No"));
        assert_eq!(snapshot.hosts[0].os(), "Windows 10 Pro");
    }

    #[test]
    fn corrupt_state_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HostCache::new(dir.path());
        cache.prepare().unwrap();
        fs::write(cache.root().join(STATE_FILE), "{ not json").unwrap();

        assert!(cache.try_load(&[]).is_err());
        let snapshot = cache.load(&[]);
        assert!(snapshot.hosts.is_empty());
    }

    #[test]
    fn reset_fresh_backs_up_existing_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HostCache::new(dir.path());

        assert!(cache.reset_fresh().unwrap().is_none());

        cache
            .try_dump(&sample_hosts(), &[], &ScanState::default())
            .unwrap();
        let backup = cache.reset_fresh().unwrap().unwrap();

        assert!(!cache.root().exists());
        assert!(backup.join(HOSTS_FILE).is_file());
        let name = backup.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("cache_") && name.ends_with(".bak"));
    }

    #[test]
    fn dump_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the cache directory should be makes every write fail.
        fs::write(dir.path().join("cache"), "blocker").unwrap();
        let cache = HostCache::new(dir.path());
        assert!(!cache.dump(&sample_hosts(), &[], &ScanState::default()));
    }
}
