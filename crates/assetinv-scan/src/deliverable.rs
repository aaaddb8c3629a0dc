//! Combine every inventory CSV written to a work directory into one table.
//!
//! Per-port columns collapse into a single `Open Ports` list. For every
//! other column the first informative value seen for a host wins; `N/A`,
//! `Unknown`, `Closed` and blanks never overwrite anything and are replaced
//! as soon as a later file has something better.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use assetinv_cache::table::parse_port_column;
use assetinv_core::types::{HOSTNAME, IP_ADDRESS};

use crate::error::{InventoryError, Result};

pub const OPEN_PORTS: &str = "Open Ports";

const INVENTORY_PREFIX: &str = "asset_inventory";
const DELIVERABLE_PREFIX: &str = "asset_inventory_deliverable";

#[derive(Debug, Default)]
struct CombinedHost {
    fields: HashMap<String, String>,
    open_ports: BTreeSet<u16>,
}

#[derive(Debug)]
pub struct Deliverable {
    header: Vec<String>,
    hosts: BTreeMap<Ipv4Addr, CombinedHost>,
}

impl Default for Deliverable {
    fn default() -> Self {
        Self {
            header: vec![
                IP_ADDRESS.to_string(),
                HOSTNAME.to_string(),
                OPEN_PORTS.to_string(),
            ],
            hosts: BTreeMap::new(),
        }
    }
}

fn is_uninformative(value: &str) -> bool {
    let value = value.trim();
    value.is_empty()
        || ["unknown", "n/a", "closed"]
            .iter()
            .any(|v| value.eq_ignore_ascii_case(v))
}

impl Deliverable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn open_ports(&self, ip: &Ipv4Addr) -> Option<&BTreeSet<u16>> {
        self.hosts.get(ip).map(|h| &h.open_ports)
    }

    pub fn field(&self, ip: &Ipv4Addr, name: &str) -> Option<&str> {
        self.hosts
            .get(ip)
            .and_then(|h| h.fields.get(name))
            .map(String::as_str)
    }

    /// Fold one inventory CSV in. Rows whose address fails `keep` are
    /// ignored. Returns the number of rows taken.
    pub fn add_file<F>(&mut self, path: &Path, keep: F) -> Result<usize>
    where
        F: Fn(&Ipv4Addr) -> bool,
    {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers: Vec<String> = rdr.headers()?.iter().map(String::from).collect();
        let Some(ip_index) = headers.iter().position(|h| h == IP_ADDRESS) else {
            return Err(InventoryError::Parse {
                path: path.display().to_string(),
                reason: format!("no \"{IP_ADDRESS}\" column"),
            });
        };

        for name in &headers {
            if parse_port_column(name).is_none() && !self.header.contains(name) {
                self.header.push(name.clone());
            }
        }

        let mut taken = 0;
        for record in rdr.records() {
            let record = record?;
            let Some(raw_ip) = record.get(ip_index) else {
                continue;
            };
            let ip: Ipv4Addr = match raw_ip.trim().parse() {
                Ok(ip) => ip,
                Err(_) => {
                    tracing::warn!(path = %path.display(), value = %raw_ip, "Skipping unparsable address");
                    continue;
                }
            };
            if !keep(&ip) {
                continue;
            }

            let mut ports = BTreeSet::new();
            let mut fields = Vec::new();
            for (name, value) in headers.iter().zip(record.iter()) {
                match parse_port_column(name) {
                    Some(port) => {
                        if value.trim().eq_ignore_ascii_case("open") {
                            ports.insert(port);
                        }
                    }
                    None if name == OPEN_PORTS => {}
                    None => fields.push((name.as_str(), value)),
                }
            }
            self.merge_row(ip, fields, ports);
            taken += 1;
        }
        Ok(taken)
    }

    fn merge_row(&mut self, ip: Ipv4Addr, fields: Vec<(&str, &str)>, ports: BTreeSet<u16>) {
        match self.hosts.get_mut(&ip) {
            Some(host) => {
                for (name, value) in fields {
                    if is_uninformative(value) {
                        continue;
                    }
                    let replace = host
                        .fields
                        .get(name)
                        .map_or(true, |stored| is_uninformative(stored));
                    if replace {
                        host.fields.insert(name.to_string(), value.to_string());
                    }
                }
                host.open_ports.extend(ports);
            }
            None => {
                let host = CombinedHost {
                    fields: fields
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    open_ports: ports,
                };
                self.hosts.insert(ip, host);
            }
        }
    }

    fn row(&self, ip: &Ipv4Addr, host: &CombinedHost) -> Vec<String> {
        self.header
            .iter()
            .map(|name| match name.as_str() {
                IP_ADDRESS => ip.to_string(),
                OPEN_PORTS => host
                    .open_ports
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                other => host.fields.get(other).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// Write the combined table, ascending by address.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(&self.header)?;
        for (ip, host) in &self.hosts {
            wtr.write_record(self.row(ip, host))?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Every `asset_inventory*.csv` directly in `dir`, excluding earlier
/// deliverables, oldest name first.
pub fn find_inventories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file()
            && name.starts_with(INVENTORY_PREFIX)
            && !name.starts_with(DELIVERABLE_PREFIX)
            && name.ends_with(".csv")
        {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Combine `files`, keeping only hosts in `current`. Unreadable files are
/// logged and skipped.
pub fn combine(files: &[PathBuf], current: &BTreeSet<Ipv4Addr>) -> Deliverable {
    let mut deliverable = Deliverable::new();
    for path in files {
        match deliverable.add_file(path, |ip| current.contains(ip)) {
            Ok(rows) => tracing::info!(path = %path.display(), rows, "Combined inventory CSV"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to combine inventory CSV"),
        }
    }
    deliverable
}
