//! Nmap XML output deserialization.
//!
//! Enrichment modules run nmap NSE scripts with `-oA <prefix>` and read
//! back `<prefix>.xml`. This module provides typed Rust structs that
//! deserialize from that XML using `quick-xml` with serde, including the
//! port-level and host-level `<script>` results the modules key on.

use std::path::Path;

use serde::Deserialize;

use crate::error::{InventoryError, Result};

/// Root element: `<nmaprun>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "nmaprun")]
pub struct NmapRun {
    #[serde(rename = "@scanner")]
    pub scanner: Option<String>,
    #[serde(rename = "@args")]
    pub args: Option<String>,
    #[serde(rename = "host", default)]
    pub hosts: Vec<NmapHost>,
    pub runstats: Option<RunStats>,
}

/// A single host from scan results.
#[derive(Debug, Clone, Deserialize)]
pub struct NmapHost {
    pub status: Option<HostStatus>,
    #[serde(rename = "address", default)]
    pub addresses: Vec<Address>,
    pub ports: Option<Ports>,
    pub hostscript: Option<HostScript>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostStatus {
    #[serde(rename = "@state")]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Address {
    #[serde(rename = "@addr")]
    pub addr: String,
    #[serde(rename = "@addrtype")]
    pub addr_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ports {
    #[serde(rename = "port", default)]
    pub ports: Vec<NmapPort>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NmapPort {
    #[serde(rename = "@protocol")]
    pub protocol: String,
    #[serde(rename = "@portid")]
    pub port_id: u16,
    pub state: PortState,
    #[serde(rename = "script", default)]
    pub scripts: Vec<Script>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortState {
    #[serde(rename = "@state")]
    pub state: String,
}

/// Host-level NSE results: `<hostscript>`.
#[derive(Debug, Clone, Deserialize)]
pub struct HostScript {
    #[serde(rename = "script", default)]
    pub scripts: Vec<Script>,
}

/// One NSE script result.
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@output", default)]
    pub output: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunStats {
    pub hosts: Option<RunStatsHosts>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunStatsHosts {
    #[serde(rename = "@up")]
    pub up: Option<String>,
    #[serde(rename = "@total")]
    pub total: Option<String>,
}

impl NmapHost {
    /// Extract the IPv4 address, if present.
    pub fn ipv4(&self) -> Option<std::net::Ipv4Addr> {
        self.addresses
            .iter()
            .find(|a| a.addr_type == "ipv4")
            .and_then(|a| a.addr.parse().ok())
    }

    /// Check if the host is up.
    pub fn is_up(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.state == "up")
    }

    /// Outputs of every host-level script with the given id.
    pub fn host_script_outputs<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.hostscript
            .iter()
            .flat_map(|hs| hs.scripts.iter())
            .filter(move |s| s.id == id)
            .map(|s| s.output.as_str())
    }

    /// `(port, output)` of every port-level script with the given id.
    pub fn port_script_outputs<'a>(
        &'a self,
        id: &'a str,
    ) -> impl Iterator<Item = (u16, &'a str)> + 'a {
        self.ports
            .iter()
            .flat_map(|p| p.ports.iter())
            .flat_map(move |p| {
                p.scripts
                    .iter()
                    .filter(move |s| s.id == id)
                    .map(move |s| (p.port_id, s.output.as_str()))
            })
    }
}

/// Parse nmap XML bytes into a structured `NmapRun`.
pub fn parse_nmap_xml(xml: &[u8]) -> Result<NmapRun> {
    quick_xml::de::from_reader(xml).map_err(|e| InventoryError::XmlParse(format!("{e}")))
}

/// Read and parse an nmap XML file.
pub fn parse_nmap_xml_file(path: &Path) -> Result<NmapRun> {
    let bytes = std::fs::read(path).map_err(|e| {
        InventoryError::XmlParse(format!("{}: {e}", path.display()))
    })?;
    parse_nmap_xml(&bytes)
}
