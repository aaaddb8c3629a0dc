//! Console summaries. Everything here renders to a `String`; the binary prints it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use ipnet::Ipv4Net;

use assetinv_core::HostRecord;

use crate::delta::{network_of, DeltaReport};

/// Longest list shown on the console; the CSV carries the rest.
pub const MAX_LISTED: usize = 20;
/// Networks shown in the summary.
const TOP_NETWORKS: usize = 10;

const RULE_WIDTH: usize = 60;

/// `/mask` networks by live-host count, largest first, ties by address.
pub fn largest_networks(hosts: &[HostRecord], mask: u8) -> Vec<(Ipv4Net, usize)> {
    let mut counts: BTreeMap<Ipv4Net, usize> = BTreeMap::new();
    for host in hosts {
        *counts.entry(network_of(host.ip, mask)).or_default() += 1;
    }
    let mut ranked: Vec<(Ipv4Net, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
}

/// Host, port and network counts printed after a run.
struct Summary<'a> {
    hosts: &'a [HostRecord],
    ports: &'a [u16],
    mask: u8,
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = self.hosts.iter().filter(|h| !h.hostname().is_empty()).count();

        writeln!(f)?;
        writeln!(f, "[+] {} alive host(s), {} with hostnames", self.hosts.len(), resolved)?;

        for port in self.ports {
            let open = self.hosts.iter().filter(|h| h.open_ports.contains(port)).count();
            writeln!(f, "\t{:<10}{open} open", format!("{port}/tcp"))?;
        }

        let mask = self.mask;
        let networks = largest_networks(self.hosts, mask);
        if !networks.is_empty() {
            writeln!(f)?;
            writeln!(f, "[+] {} active /{mask} network(s)", networks.len())?;
            for (net, count) in networks.iter().take(TOP_NETWORKS) {
                writeln!(f, "\t{:<19}({count})", net.to_string())?;
            }
            if networks.len() > TOP_NETWORKS {
                writeln!(f, "\t...")?;
            }
        }
        Ok(())
    }
}

pub fn summary(hosts: &[HostRecord], ports: &[u16], mask: u8) -> String {
    Summary { hosts, ports, mask }.to_string()
}

struct DeltaListing<'a> {
    delta: &'a DeltaReport,
    reference: &'a Path,
    network_csv: Option<&'a Path>,
    host_csv: Option<&'a Path>,
}

impl fmt::Display for DeltaListing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let delta = self.delta;
        let reference = self.reference.display();
        let rule = "=".repeat(RULE_WIDTH);

        writeln!(f)?;
        writeln!(
            f,
            "[+] {} active network(s) not found in {reference}",
            delta.networks.len()
        )?;
        if let Some(path) = self.network_csv {
            writeln!(f, "[+] Full report written to {}", path.display())?;
        }
        writeln!(f, "{rule}")?;
        for stray in delta.networks.iter().take(MAX_LISTED) {
            writeln!(
                f,
                "\t{:<19}{:<10}",
                stray.network.to_string(),
                format!(" ({})", stray.host_count)
            )?;
        }
        if delta.networks.len() > MAX_LISTED {
            writeln!(f, "\t...")?;
        }

        writeln!(f)?;
        writeln!(
            f,
            "[+] {} alive host(s) not found in {reference}",
            delta.hosts.len()
        )?;
        if let Some(path) = self.host_csv {
            writeln!(f, "[+] Full report written to {}", path.display())?;
        }
        writeln!(f, "{rule}")?;
        for host in delta.hosts.iter().take(MAX_LISTED) {
            writeln!(f, "\t{host}")?;
        }
        if delta.hosts.len() > MAX_LISTED {
            writeln!(f, "\t...")?;
        }

        if delta.advisory.poorly_inventoried {
            writeln!(f)?;
            writeln!(
                f,
                "[!] {:.1}% of alive hosts are missing from {reference}; asset inventory looks incomplete",
                delta.advisory.stray_ratio * 100.0
            )?;
        }
        Ok(())
    }
}

/// Stray networks and hosts, each list capped at [`MAX_LISTED`].
pub fn delta_listing(
    delta: &DeltaReport,
    reference: &Path,
    network_csv: Option<&Path>,
    host_csv: Option<&Path>,
) -> String {
    DeltaListing {
        delta,
        reference,
        network_csv,
        host_csv,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{Advisory, StrayNetwork};
    use std::net::Ipv4Addr;

    fn host(a: u8, b: u8, c: u8, d: u8) -> HostRecord {
        HostRecord::new(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_largest_networks_ordering() {
        let hosts = vec![
            host(10, 1, 0, 1),
            host(10, 2, 0, 1),
            host(10, 2, 0, 2),
            host(10, 0, 0, 1),
        ];
        let ranked = largest_networks(&hosts, 16);
        assert_eq!(ranked[0], ("10.2.0.0/16".parse().unwrap(), 2));
        assert_eq!(ranked[1].0, "10.0.0.0/16".parse::<Ipv4Net>().unwrap());
        assert_eq!(ranked[2].0, "10.1.0.0/16".parse::<Ipv4Net>().unwrap());
    }

    #[test]
    fn test_summary_counts() {
        let mut a = host(10, 0, 0, 1).with_hostname("ws01");
        a.open_ports.insert(445);
        let b = host(10, 0, 0, 2).with_hostname("");
        let text = summary(&[a, b], &[445, 22], 24);
        assert!(text.contains("2 alive host(s), 1 with hostnames"));
        assert!(text.contains("445/tcp   1 open"));
        assert!(text.contains("22/tcp    0 open"));
        assert!(text.contains("10.0.0.0/24        (2)"));
    }

    #[test]
    fn test_delta_listing_caps_entries() {
        let hosts: Vec<HostRecord> = (1..=25).map(|d| host(10, 0, 0, d)).collect();
        let delta = DeltaReport {
            hosts,
            networks: vec![StrayNetwork {
                network: "10.0.0.0/16".parse().unwrap(),
                host_count: 25,
            }],
            advisory: Advisory {
                stray_ratio: 1.0,
                poorly_inventoried: true,
            },
        };
        let text = delta_listing(&delta, Path::new("old.csv"), None, None);
        assert!(text.contains("[+] 1 active network(s) not found in old.csv"));
        assert!(text.contains("[+] 25 alive host(s) not found in old.csv"));
        assert!(text.contains("\t10.0.0.20"));
        assert!(!text.contains("\t10.0.0.21 "));
        assert!(text.contains("\t..."));
        assert!(text.contains("100.0% of alive hosts"));
    }
}
