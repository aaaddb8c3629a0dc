//! CSV table layout shared by the cache and the inventory output.
//!
//! Header: `IP Address, Hostname, OS`, then module columns in registration
//! order, then one `<port>/tcp` column per port.

use std::fs;
use std::io::Write;
use std::path::Path;

use assetinv_core::types::{CsvRow, HostRecord, HOSTNAME, IP_ADDRESS, NOT_APPLICABLE, OS};

use crate::state::ScanState;
use crate::store::CacheError;

pub const PORT_OPEN: &str = "Open";
pub const PORT_CLOSED: &str = "Closed";

/// Which columns a table carries beyond the core three.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableLayout {
    pub columns: Vec<String>,
    pub ports: Vec<u16>,
}

impl TableLayout {
    pub fn new(columns: Vec<String>, ports: Vec<u16>) -> Self {
        let columns = columns
            .into_iter()
            .filter(|c| !is_core_column(c) && parse_port_column(c).is_none())
            .collect();
        Self { columns, ports }
    }

    /// `columns` first, then every other field any of `hosts` carries,
    /// sorted by name. Fields restored from older runs stay in the table
    /// even when no module in this run claims them.
    pub fn covering(columns: Vec<String>, hosts: &[HostRecord], ports: Vec<u16>) -> Self {
        let mut extra: Vec<String> = hosts
            .iter()
            .flat_map(|h| h.fields.keys())
            .filter(|c| !columns.contains(c))
            .cloned()
            .collect();
        extra.sort();
        extra.dedup();

        let mut all = columns;
        all.extend(extra);
        Self::new(all, ports)
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = vec![IP_ADDRESS.to_string(), HOSTNAME.to_string(), OS.to_string()];
        header.extend(self.columns.iter().cloned());
        header.extend(self.ports.iter().map(|p| port_column(*p)));
        header
    }

    pub fn row(&self, host: &HostRecord, state: Option<&ScanState>) -> Vec<String> {
        let mut row = vec![
            host.ip.to_string(),
            host.hostname().to_string(),
            host.os().to_string(),
        ];
        row.extend(self.columns.iter().map(|c| host.field_or_na(c).to_string()));
        row.extend(self.ports.iter().map(|p| port_cell(host, *p, state).to_string()));
        row
    }
}

pub fn is_core_column(name: &str) -> bool {
    name == IP_ADDRESS || name == HOSTNAME || name == OS
}

pub fn port_column(port: u16) -> String {
    format!("{port}/tcp")
}

/// Parse a `<port>/tcp` header back into its port number.
pub fn parse_port_column(name: &str) -> Option<u16> {
    let lower = name.trim().to_ascii_lowercase();
    lower.strip_suffix("/tcp")?.parse().ok()
}

fn port_cell(host: &HostRecord, port: u16, state: Option<&ScanState>) -> &'static str {
    if host.open_ports.contains(&port) {
        PORT_OPEN
    } else if state.is_some_and(|s| s.is_scanned(port, &host.ip)) {
        PORT_CLOSED
    } else {
        NOT_APPLICABLE
    }
}

/// Write hosts as CSV to any writer.
pub fn write_hosts<W: Write>(
    writer: W,
    hosts: &[HostRecord],
    layout: &TableLayout,
    state: Option<&ScanState>,
) -> Result<(), CacheError> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(layout.header())?;
    for host in hosts {
        wtr.write_record(layout.row(host, state))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write hosts to `path`, going through a temporary file so a failed write
/// never leaves a truncated table behind.
pub fn write_hosts_to(
    path: &Path,
    hosts: &[HostRecord],
    layout: &TableLayout,
    state: Option<&ScanState>,
) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("csv.tmp");
    let file = fs::File::create(&tmp)?;
    write_hosts(file, hosts, layout, state)?;
    fs::rename(&tmp, path)?;

    tracing::debug!(path = %path.display(), hosts = hosts.len(), "Host table written");
    Ok(())
}

/// Read every row of a CSV file into header-keyed maps.
pub fn read_rows(path: &Path) -> Result<Vec<CsvRow>, CacheError> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let mut rows = Vec::new();
    for record in rdr.deserialize() {
        let row: CsvRow = record?;
        rows.push(row);
    }
    Ok(rows)
}

/// Header of a CSV file, in file order.
pub fn read_header(path: &Path) -> Result<Vec<String>, CacheError> {
    let mut rdr = csv::Reader::from_path(path)?;
    Ok(rdr.headers()?.iter().map(String::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host(last: u8) -> HostRecord {
        HostRecord::new(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_layout_drops_core_and_port_columns() {
        let layout = TableLayout::new(
            vec!["OS".into(), "Open FTP".into(), "445/tcp".into()],
            vec![445],
        );
        assert_eq!(layout.columns, vec!["Open FTP"]);
        assert_eq!(
            layout.header(),
            vec!["IP Address", "Hostname", "OS", "Open FTP", "445/tcp"]
        );
    }

    #[test]
    fn test_port_column_parsing() {
        assert_eq!(port_column(22), "22/tcp");
        assert_eq!(parse_port_column("22/tcp"), Some(22));
        assert_eq!(parse_port_column(" 3389/TCP "), Some(3389));
        assert_eq!(parse_port_column("Open FTP"), None);
        assert_eq!(parse_port_column("x/tcp"), None);
    }

    #[test]
    fn test_port_cells() {
        let mut open = host(1);
        open.open_ports.insert(22);
        let closed = host(2);
        let unscanned = host(3);

        let mut state = ScanState::default();
        state.mark_scanned(22, [open.ip, closed.ip]);

        let layout = TableLayout::new(vec![], vec![22]);
        assert_eq!(layout.row(&open, Some(&state))[3], "Open");
        assert_eq!(layout.row(&closed, Some(&state))[3], "Closed");
        assert_eq!(layout.row(&unscanned, Some(&state))[3], "N/A");
        assert_eq!(layout.row(&closed, None)[3], "N/A");
    }

    #[test]
    fn test_write_and_read_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/hosts.csv");

        let mut a = host(1).with_hostname("web01");
        a.set_field("Open FTP", "Yes");
        let b = host(2);

        let layout = TableLayout::new(vec!["Open FTP".into()], vec![]);
        write_hosts_to(&path, &[a, b], &layout, None).unwrap();

        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["IP Address"], "10.0.0.1");
        assert_eq!(rows[0]["Hostname"], "web01");
        assert_eq!(rows[0]["Open FTP"], "Yes");
        assert_eq!(rows[1]["Open FTP"], "N/A");
        assert_eq!(rows[1]["OS"], "Unknown");

        assert_eq!(
            read_header(&path).unwrap(),
            vec!["IP Address", "Hostname", "OS", "Open FTP"]
        );
        assert!(!dir.path().join("out/hosts.csv.tmp").exists());
    }
}
