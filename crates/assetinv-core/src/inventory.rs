//! The shared, synchronized host map.
//!
//! The orchestrator mutates the inventory between phases; module workers
//! mutate it concurrently during enrichment. All access goes through the
//! map-level lock, and callers get owned snapshots back so no lock is held
//! across an await point.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use parking_lot::RwLock;

use crate::types::HostRecord;

/// Every host known to this run, keyed by address, plus the registry of
/// module-declared column names that fixes CSV column order.
#[derive(Debug, Default)]
pub struct Inventory {
    hosts: RwLock<BTreeMap<Ipv4Addr, HostRecord>>,
    columns: RwLock<Vec<String>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register field names in declaration order. Duplicates are ignored.
    pub fn register_columns<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut columns = self.columns.write();
        for name in names {
            let name = name.into();
            if !columns.contains(&name) {
                columns.push(name);
            }
        }
    }

    pub fn columns(&self) -> Vec<String> {
        self.columns.read().clone()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        self.hosts.read().contains_key(ip)
    }

    pub fn get(&self, ip: &Ipv4Addr) -> Option<HostRecord> {
        self.hosts.read().get(ip).cloned()
    }

    /// All addresses, ascending.
    pub fn ips(&self) -> Vec<Ipv4Addr> {
        self.hosts.read().keys().copied().collect()
    }

    /// Owned copy of every host, ascending by address.
    pub fn snapshot(&self) -> Vec<HostRecord> {
        self.hosts.read().values().cloned().collect()
    }

    /// Hosts whose open-port set contains `port`.
    pub fn hosts_with_port(&self, port: u16) -> Vec<HostRecord> {
        self.hosts
            .read()
            .values()
            .filter(|h| h.open_ports.contains(&port))
            .cloned()
            .collect()
    }

    /// Insert a host, or merge it into the existing record for that address.
    /// Returns true if the address was not known before.
    pub fn upsert(&self, record: HostRecord) -> bool {
        let mut hosts = self.hosts.write();
        match hosts.get_mut(&record.ip) {
            Some(existing) => {
                existing.merge(&record);
                false
            }
            None => {
                hosts.insert(record.ip, record);
                true
            }
        }
    }

    /// Apply `f` to the host at `ip`. Returns false if the host is unknown.
    pub fn update<F>(&self, ip: &Ipv4Addr, f: F) -> bool
    where
        F: FnOnce(&mut HostRecord),
    {
        match self.hosts.write().get_mut(ip) {
            Some(host) => {
                f(host);
                true
            }
            None => false,
        }
    }

    /// Merge a set of field values into one host using the field merge rule.
    pub fn merge_fields<'a, I>(&self, ip: &Ipv4Addr, fields: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.update(ip, |host| {
            for (name, value) in fields {
                host.merge_field(name, value);
            }
        })
    }

    /// Record an open port, creating the host if needed.
    /// Returns true if the host is new.
    pub fn add_open_port(&self, ip: Ipv4Addr, port: u16) -> bool {
        let mut hosts = self.hosts.write();
        let is_new = !hosts.contains_key(&ip);
        hosts
            .entry(ip)
            .or_insert_with(|| HostRecord::new(ip))
            .open_ports
            .insert(port);
        is_new
    }

    /// Give every host an explicit value for each registered column that it
    /// lacks, so output rows are complete.
    pub fn fill_missing(&self, default: &str) {
        let columns = self.columns();
        let mut hosts = self.hosts.write();
        for host in hosts.values_mut() {
            for column in &columns {
                host.fields
                    .entry(column.clone())
                    .or_insert_with(|| default.to_string());
            }
        }
    }
}
