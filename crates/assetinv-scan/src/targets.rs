//! Target parsing and normalization.
//!
//! Targets arrive as CIDR blocks (`10.0.0.0/24`, host bits allowed), bare
//! addresses, or inclusive ranges (`10.0.0.10-10.0.0.200`). Everything is
//! reduced to a sorted set of non-overlapping `Ipv4Net`s.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use ipnet::{Ipv4Net, Ipv4Subnets};

use crate::error::{InventoryError, Result};

/// RFC1918 ranges scanned when no targets are given.
pub const DEFAULT_TARGETS: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

const ACCEPTED_FORMATS: &str = "192.168.0.0/24, 192.168.0.10, 192.168.0.0-192.168.0.255";

/// Parse one target specification into the networks it covers.
pub fn parse_target(spec: &str) -> std::result::Result<Vec<Ipv4Net>, String> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err("empty target".to_string());
    }

    if spec.contains('-') {
        let mut parts = spec.split('-');
        let (Some(start), Some(end), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format!("range \"{spec}\" has more than one '-'"));
        };
        let start = parse_ipv4(start)?;
        let end = parse_ipv4(end)?;
        if start > end {
            return Err(format!("range \"{spec}\" ends before it starts"));
        }
        return Ok(Ipv4Subnets::new(start, end, 0).collect());
    }

    if spec.contains('/') {
        let net: ipnet::IpNet = spec
            .parse()
            .map_err(|_| format!("\"{spec}\" is not a valid CIDR network"))?;
        return match net {
            ipnet::IpNet::V4(v4) => Ok(vec![v4.trunc()]),
            ipnet::IpNet::V6(_) => Err(format!("\"{spec}\" is IPv6, only IPv4 is supported")),
        };
    }

    let ip = parse_ipv4(spec)?;
    Ok(vec![Ipv4Net::from(ip)])
}

fn parse_ipv4(s: &str) -> std::result::Result<Ipv4Addr, String> {
    let s = s.trim();
    match s.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ok(v4),
        Ok(IpAddr::V6(_)) => Err(format!("\"{s}\" is IPv6, only IPv4 is supported")),
        Err(_) => Err(format!("\"{s}\" is not a valid address")),
    }
}

/// Parse a batch of target specifications. Malformed entries are reported
/// and skipped; the rest of the batch still goes through.
pub fn parse_targets<S: AsRef<str>>(specs: &[S]) -> Vec<Ipv4Net> {
    let mut nets = Vec::new();
    for spec in specs {
        match parse_target(spec.as_ref()) {
            Ok(parsed) => nets.extend(parsed),
            Err(reason) => {
                tracing::warn!(
                    target = %spec.as_ref(),
                    reason = %reason,
                    accepted = ACCEPTED_FORMATS,
                    "Skipping malformed target"
                );
            }
        }
    }
    normalize(&nets)
}

/// Deduplicate, collapse nested/adjacent networks, and sort.
pub fn normalize(nets: &[Ipv4Net]) -> Vec<Ipv4Net> {
    Ipv4Net::aggregate(&nets.to_vec())
}

/// Like `parse_targets`, but an empty result is a validation error.
pub fn resolve_targets<S: AsRef<str>>(specs: &[S]) -> Result<Vec<Ipv4Net>> {
    let nets = parse_targets(specs);
    if nets.is_empty() {
        return Err(InventoryError::Validation("No valid targets".to_string()));
    }
    Ok(nets)
}

/// Read a blacklist/whitelist file: one target per line, `#` comments allowed.
pub fn read_target_file(path: &Path) -> Result<Vec<Ipv4Net>> {
    if !path.is_file() {
        return Err(InventoryError::Validation(format!(
            "Problem reading target file \"{}\"",
            path.display()
        )));
    }
    let contents = fs::read_to_string(path)?;
    let specs: Vec<&str> = contents
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .collect();
    Ok(parse_targets(&specs))
}

/// Remove every address in `hole` from `net`.
fn exclude(net: Ipv4Net, hole: &Ipv4Net) -> Vec<Ipv4Net> {
    if hole.contains(&net) {
        return Vec::new();
    }
    if !net.contains(hole) {
        return vec![net];
    }
    // `net` strictly contains `hole`, so it can be halved.
    let mut out = Vec::new();
    if let Ok(halves) = net.subnets(net.prefix_len() + 1) {
        for half in halves {
            out.extend(exclude(half, hole));
        }
    }
    out
}

/// `targets` minus every address in `blacklist`.
pub fn subtract(targets: &[Ipv4Net], blacklist: &[Ipv4Net]) -> Vec<Ipv4Net> {
    let mut remaining = targets.to_vec();
    for hole in blacklist {
        remaining = remaining
            .into_iter()
            .flat_map(|net| exclude(net, hole))
            .collect();
    }
    normalize(&remaining)
}

/// Addresses present in both `targets` and `whitelist`.
pub fn intersect(targets: &[Ipv4Net], whitelist: &[Ipv4Net]) -> Vec<Ipv4Net> {
    let mut out = Vec::new();
    for t in targets {
        for w in whitelist {
            if t.contains(w) {
                out.push(*w);
            } else if w.contains(t) {
                out.push(*t);
            }
        }
    }
    normalize(&out)
}

/// True if any network in `nets` contains `ip`.
pub fn contains(nets: &[Ipv4Net], ip: &Ipv4Addr) -> bool {
    nets.iter().any(|n| n.contains(ip))
}

/// Total number of addresses covered.
pub fn address_count(nets: &[Ipv4Net]) -> u64 {
    nets.iter().map(|n| 1u64 << (32 - n.prefix_len())).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_cidr_truncates_host_bits() {
        assert_eq!(parse_target("10.0.0.5/24").unwrap(), vec![net("10.0.0.0/24")]);
    }

    #[test]
    fn test_parse_single_address() {
        assert_eq!(parse_target(" 10.1.2.3 ").unwrap(), vec![net("10.1.2.3/32")]);
    }

    #[test]
    fn test_parse_range_summarizes() {
        assert_eq!(
            parse_target("192.168.0.0-192.168.0.255").unwrap(),
            vec![net("192.168.0.0/24")]
        );
        assert_eq!(
            parse_target("10.0.0.1 - 10.0.0.6").unwrap(),
            vec![net("10.0.0.1/32"), net("10.0.0.2/31"), net("10.0.0.4/31"), net("10.0.0.6/32")]
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_target("10.0.0.1-10.0.0.5-10.0.0.9").is_err());
        assert!(parse_target("10.0.0.300").is_err());
        assert!(parse_target("10.0.0.9-10.0.0.1").is_err());
        assert!(parse_target("10.0.0.0/33").is_err());
        assert!(parse_target("fe80::/64").is_err());
        assert!(parse_target("").is_err());
    }

    #[test]
    fn test_parse_targets_skips_bad_entries() {
        let nets = parse_targets(&["10.0.0.0/24", "not-an-ip", "192.168.1.1-192.168.1.2-3"]);
        assert_eq!(nets, vec![net("10.0.0.0/24")]);
    }

    #[test]
    fn test_normalized_output_sorted_without_overlap() {
        let nets = parse_targets(&[
            "192.168.1.0/24",
            "10.0.0.0/8",
            "10.20.0.0/16",
            "192.168.1.77",
            "192.168.1.0/24",
            "172.16.0.0-172.16.0.127",
            "172.16.0.128/25",
        ]);
        assert_eq!(
            nets,
            vec![net("10.0.0.0/8"), net("172.16.0.0/24"), net("192.168.1.0/24")]
        );
        for pair in nets.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(!pair[0].contains(&pair[1]) && !pair[1].contains(&pair[0]));
        }
    }

    #[test]
    fn test_resolve_targets_requires_one() {
        assert!(matches!(
            resolve_targets(&["bogus"]),
            Err(InventoryError::Validation(_))
        ));
    }

    #[test]
    fn test_subtract() {
        let remaining = subtract(&[net("10.0.0.0/30")], &[net("10.0.0.2/32")]);
        assert_eq!(remaining, vec![net("10.0.0.0/31"), net("10.0.0.3/32")]);
        assert!(subtract(&[net("10.0.0.0/24")], &[net("10.0.0.0/8")]).is_empty());
        assert_eq!(
            subtract(&[net("10.0.0.0/24")], &[net("192.168.0.0/16")]),
            vec![net("10.0.0.0/24")]
        );
        assert_eq!(address_count(&subtract(&[net("10.0.0.0/16")], &[net("10.0.5.7/32")])), 65535);
    }

    #[test]
    fn test_intersect() {
        let out = intersect(
            &[net("10.0.0.0/16"), net("192.168.0.0/24")],
            &[net("10.0.5.0/24"), net("192.168.0.0/16"), net("172.16.0.0/12")],
        );
        assert_eq!(out, vec![net("10.0.5.0/24"), net("192.168.0.0/24")]);
    }

    #[test]
    fn test_read_target_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.txt");
        fs::write(&path, "# printers\n10.0.0.5\n\n10.0.1.0/24  # lab\n").unwrap();
        assert_eq!(
            read_target_file(&path).unwrap(),
            vec![net("10.0.0.5/32"), net("10.0.1.0/24")]
        );
        assert!(matches!(
            read_target_file(&dir.path().join("missing.txt")),
            Err(InventoryError::Validation(_))
        ));
    }
}
