//! Scan bookkeeping that survives between runs.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// What has already been done against which addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanState {
    /// Port → hosts already submitted to the engine for that port.
    #[serde(default)]
    pub scanned: BTreeMap<u16, BTreeSet<Ipv4Addr>>,
    /// Networks already covered by a discovery sweep.
    #[serde(default)]
    pub swept: Vec<Ipv4Net>,
}

impl ScanState {
    pub fn is_scanned(&self, port: u16, ip: &Ipv4Addr) -> bool {
        self.scanned.get(&port).is_some_and(|hosts| hosts.contains(ip))
    }

    pub fn mark_scanned<I>(&mut self, port: u16, ips: I)
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        self.scanned.entry(port).or_default().extend(ips);
    }

    /// Every port that has been scanned at least once, ascending.
    pub fn scanned_ports(&self) -> Vec<u16> {
        self.scanned
            .iter()
            .filter(|(_, hosts)| !hosts.is_empty())
            .map(|(port, _)| *port)
            .collect()
    }

    /// True if `net` lies entirely inside a previously swept network.
    pub fn is_swept(&self, net: &Ipv4Net) -> bool {
        self.swept.iter().any(|s| s.contains(net))
    }

    pub fn record_sweep(&mut self, nets: &[Ipv4Net]) {
        let mut all = self.swept.clone();
        all.extend_from_slice(nets);
        self.swept = Ipv4Net::aggregate(&all);
    }
}
