//! CSV files handed to the operator.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use assetinv_cache::table::{self, TableLayout};
use assetinv_cache::ScanState;
use assetinv_core::{HostRecord, Inventory};

use crate::delta::StrayNetwork;
use crate::error::Result;

pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// `<dir>/<prefix>_<timestamp>.csv`
pub fn stamped_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}_{}.csv", timestamp()))
}

/// Registered module columns first, then any other field a host carries
/// (columns restored from older caches), then every port scanned so far or
/// planned for this run.
pub fn inventory_layout(inventory: &Inventory, state: &ScanState, plan: &[u16]) -> TableLayout {
    let mut ports = state.scanned_ports();
    ports.extend_from_slice(plan);
    ports.sort_unstable();
    ports.dedup();

    TableLayout::covering(inventory.columns(), &inventory.snapshot(), ports)
}

/// Write the inventory table. A failure is logged and reported as `false`.
pub fn write_inventory(
    path: &Path,
    hosts: &[HostRecord],
    layout: &TableLayout,
    state: &ScanState,
) -> bool {
    match table::write_hosts_to(path, hosts, layout, Some(state)) {
        Ok(()) => {
            tracing::info!(path = %path.display(), hosts = hosts.len(), "Inventory CSV written");
            true
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to write inventory CSV");
            false
        }
    }
}

pub fn write_network_delta(path: &Path, networks: &[StrayNetwork]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["Network", "Host Count"])?;
    for stray in networks {
        wtr.write_record([stray.network.to_string(), stray.host_count.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}
