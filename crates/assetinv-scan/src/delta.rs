//! Change detection against an earlier inventory.
//!
//! The reference is either a previous inventory CSV (its `IP Address`
//! column) or a plain list of addresses and networks. Current hosts absent
//! from it are strays; networks (at a chosen mask) with no reference
//! coverage at all are stray networks.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;

use assetinv_cache::table;
use assetinv_core::types::IP_ADDRESS;
use assetinv_core::HostRecord;

use crate::config::AdvisoryConfig;
use crate::error::{InventoryError, Result};
use crate::targets;

/// What the current inventory is compared against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reference {
    nets: Vec<Ipv4Net>,
}

impl Reference {
    pub fn from_hosts<I: IntoIterator<Item = Ipv4Addr>>(ips: I) -> Self {
        let nets: Vec<Ipv4Net> = ips.into_iter().map(Ipv4Net::from).collect();
        Self::from_networks(&nets)
    }

    pub fn from_networks(nets: &[Ipv4Net]) -> Self {
        Self {
            nets: targets::normalize(nets),
        }
    }

    /// Load a previous inventory CSV, or failing that a target list.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(InventoryError::Validation(format!(
                "Diff reference \"{}\" not found",
                path.display()
            )));
        }

        let header = table::read_header(path).unwrap_or_default();
        if header.iter().any(|h| h.trim() == IP_ADDRESS) {
            let rows = table::read_rows(path)?;
            let ips = rows.iter().filter_map(|row| {
                let raw = row.get(IP_ADDRESS)?;
                match raw.trim().parse::<Ipv4Addr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        tracing::warn!(value = %raw, "Skipping unparsable reference address");
                        None
                    }
                }
            });
            let reference = Self::from_hosts(ips);
            tracing::info!(path = %path.display(), hosts = reference.address_count(), "Loaded reference inventory");
            return Ok(reference);
        }

        let nets = targets::read_target_file(path)?;
        tracing::info!(path = %path.display(), networks = nets.len(), "Loaded reference target list");
        Ok(Self::from_networks(&nets))
    }

    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        targets::contains(&self.nets, ip)
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn address_count(&self) -> u64 {
        targets::address_count(&self.nets)
    }

    /// True if any reference address falls inside `net`.
    fn overlaps(&self, net: &Ipv4Net) -> bool {
        self.nets
            .iter()
            .any(|r| r.contains(net) || net.contains(r))
    }
}

/// A current-side network with no reference coverage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrayNetwork {
    pub network: Ipv4Net,
    pub host_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Advisory {
    pub stray_ratio: f64,
    pub poorly_inventoried: bool,
}

#[derive(Debug, Clone)]
pub struct DeltaReport {
    pub hosts: Vec<HostRecord>,
    pub networks: Vec<StrayNetwork>,
    pub advisory: Advisory,
}

/// The `/mask` network containing `ip`.
pub fn network_of(ip: Ipv4Addr, mask: u8) -> Ipv4Net {
    match Ipv4Net::new(ip, mask.min(32)) {
        Ok(net) => net.trunc(),
        Err(_) => Ipv4Net::from(ip),
    }
}

/// Current hosts absent from the reference, ascending by address.
pub fn host_delta(current: &[HostRecord], reference: &Reference) -> Vec<HostRecord> {
    let mut strays: Vec<HostRecord> = current
        .iter()
        .filter(|h| !reference.contains(&h.ip))
        .cloned()
        .collect();
    strays.sort_by_key(|h| h.ip);
    strays
}

/// Current hosts grouped into `/mask` networks; networks the reference
/// does not touch at all are returned with their live-host count.
pub fn network_delta(current: &[HostRecord], reference: &Reference, mask: u8) -> Vec<StrayNetwork> {
    let mut counts: BTreeMap<Ipv4Net, usize> = BTreeMap::new();
    for host in current {
        *counts.entry(network_of(host.ip, mask)).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(net, _)| !reference.overlaps(net))
        .map(|(network, host_count)| StrayNetwork {
            network,
            host_count,
        })
        .collect()
}

/// Flag the engagement when strays exceed the configured share of known
/// hosts, or there are more stray networks than tolerated.
pub fn assess(
    stray_hosts: usize,
    stray_networks: usize,
    total_hosts: usize,
    config: &AdvisoryConfig,
) -> Advisory {
    let stray_ratio = if total_hosts == 0 {
        0.0
    } else {
        stray_hosts as f64 / total_hosts as f64
    };
    Advisory {
        stray_ratio,
        poorly_inventoried: stray_ratio > config.stray_host_ratio
            || stray_networks > config.stray_network_limit,
    }
}

pub fn compute_delta(
    current: &[HostRecord],
    reference: &Reference,
    mask: u8,
    config: &AdvisoryConfig,
) -> DeltaReport {
    let hosts = host_delta(current, reference);
    let networks = network_delta(current, reference, mask);
    let advisory = assess(hosts.len(), networks.len(), current.len(), config);

    tracing::info!(
        stray_hosts = hosts.len(),
        stray_networks = networks.len(),
        mask,
        poorly_inventoried = advisory.poorly_inventoried,
        "Delta computed"
    );

    DeltaReport {
        hosts,
        networks,
        advisory,
    }
}
