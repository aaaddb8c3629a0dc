//! Port work list for a run.

/// Always scanned ahead of every other port when present.
pub const PRIORITY_PORT: u16 = 445;

/// Deduplicated ports to SYN-scan, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPlan {
    ports: Vec<u16>,
}

impl ScanPlan {
    /// Fold explicit `--ports` and module-declared ports into one list:
    /// 445 first if present, the rest ascending.
    pub fn new<I, J>(explicit: I, module_ports: J) -> Self
    where
        I: IntoIterator<Item = u16>,
        J: IntoIterator<Item = u16>,
    {
        let mut ports: Vec<u16> = explicit.into_iter().chain(module_ports).collect();
        ports.sort_unstable();
        ports.dedup();
        if let Some(pos) = ports.iter().position(|p| *p == PRIORITY_PORT) {
            ports.remove(pos);
            ports.insert(0, PRIORITY_PORT);
        }
        Self { ports }
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }
}

/// Parse a `--ports` argument: comma separated ports or `a-b` ranges.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>, String> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = parse_port(start)?;
            let end: u16 = parse_port(end)?;
            if start > end {
                return Err(format!("port range \"{part}\" ends before it starts"));
            }
            ports.extend(start..=end);
        } else {
            ports.push(parse_port(part)?);
        }
    }
    Ok(ports)
}

fn parse_port(s: &str) -> Result<u16, String> {
    match s.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("\"{}\" is not a valid TCP port", s.trim())),
        Ok(p) => Ok(p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_port_first() {
        let plan = ScanPlan::new([22, 3389, 445, 80], [445, 21]);
        assert_eq!(plan.ports(), &[445, 21, 22, 80, 3389]);
    }

    #[test]
    fn test_plan_without_priority_port() {
        let plan = ScanPlan::new([8080, 22, 22], []);
        assert_eq!(plan.ports(), &[22, 8080]);
        assert!(ScanPlan::new([], []).is_empty());
    }

    #[test]
    fn test_parse_ports() {
        assert_eq!(parse_ports("22, 80,443").unwrap(), vec![22, 80, 443]);
        assert_eq!(parse_ports("5900-5902").unwrap(), vec![5900, 5901, 5902]);
        assert!(parse_ports("0").is_err());
        assert!(parse_ports("70000").is_err());
        assert!(parse_ports("90-80").is_err());
        assert!(parse_ports("").unwrap().is_empty());
    }
}
