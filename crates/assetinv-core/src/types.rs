//! Core domain types for the asset inventory.
//!
//! A `HostRecord` is created the first time an address is seen (cache load
//! or discovery sweep) and only ever grows during a run: open ports are
//! added, and string fields contributed by modules are merged so that a
//! concrete observation is never replaced by a weaker one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

// ── Column names ──────────────────────────────────────────────────

pub const IP_ADDRESS: &str = "IP Address";
pub const HOSTNAME: &str = "Hostname";
pub const OS: &str = "OS";

pub const NOT_APPLICABLE: &str = "N/A";
pub const UNKNOWN: &str = "Unknown";
pub const YES: &str = "Yes";
pub const NO: &str = "No";

/// A single CSV row keyed by header name.
pub type CsvRow = HashMap<String, String>;

// ── Field values ──────────────────────────────────────────────────

/// How much a field value tells us, weakest first.
///
/// Ordering drives the merge rule: an incoming value replaces the stored one
/// only when it ranks strictly higher. Two free-text values are the one
/// exception, where the newer observation wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Informativeness {
    /// Blank.
    Empty,
    /// "N/A" or "Unknown".
    Placeholder,
    /// "No".
    Negative,
    /// Any other concrete text (an OS name, a share list, ...).
    Text,
    /// "Yes".
    Affirmative,
}

impl Informativeness {
    pub fn of(value: &str) -> Self {
        let v = value.trim();
        if v.is_empty() {
            Self::Empty
        } else if v.eq_ignore_ascii_case(NOT_APPLICABLE) || v.eq_ignore_ascii_case(UNKNOWN) {
            Self::Placeholder
        } else if v.eq_ignore_ascii_case(NO) {
            Self::Negative
        } else if v.eq_ignore_ascii_case(YES) {
            Self::Affirmative
        } else {
            Self::Text
        }
    }

    /// True for "Yes" and "No": a module has reached a verdict for this host.
    pub fn is_conclusive(self) -> bool {
        matches!(self, Self::Affirmative | Self::Negative)
    }
}

/// Decide whether `incoming` should overwrite `stored`.
pub fn should_replace(stored: &str, incoming: &str) -> bool {
    let have = Informativeness::of(stored);
    let new = Informativeness::of(incoming);
    match (have, new) {
        (Informativeness::Text, Informativeness::Text) => stored.trim() != incoming.trim(),
        _ => new > have,
    }
}

// ── Host record ───────────────────────────────────────────────────

/// One known host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub ip: Ipv4Addr,
    /// `None` until resolved; an empty string means resolution was tried and failed.
    pub hostname: Option<String>,
    pub open_ports: BTreeSet<u16>,
    /// Module-contributed fields, plus "OS".
    pub fields: BTreeMap<String, String>,
}

impl HostRecord {
    pub fn new(ip: Ipv4Addr) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(OS.to_string(), UNKNOWN.to_string());
        Self {
            ip,
            hostname: None,
            open_ports: BTreeSet::new(),
            fields,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        let name = hostname.into();
        if !name.trim().is_empty() {
            self.hostname = Some(name.trim().to_string());
        }
        self
    }

    /// Rebuild the core columns (address, hostname, OS) from a CSV row.
    /// Module columns are filled in separately by each `HostReader`.
    pub fn from_csv_row(row: &CsvRow) -> Result<Self> {
        let raw_ip = row
            .get(IP_ADDRESS)
            .ok_or_else(|| CoreError::MissingColumn(IP_ADDRESS.to_string()))?;
        let ip: Ipv4Addr = raw_ip
            .trim()
            .parse()
            .map_err(|_| CoreError::InvalidAddress(raw_ip.clone()))?;

        let mut host = Self::new(ip);
        if let Some(name) = row.get(HOSTNAME) {
            host = host.with_hostname(name.as_str());
        }
        if let Some(os) = row.get(OS) {
            host.merge_field(OS, os);
        }
        Ok(host)
    }

    /// The hostname, or an empty string when unresolved.
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or("")
    }

    pub fn os(&self) -> &str {
        self.field(OS).unwrap_or(UNKNOWN)
    }

    /// True when no resolution has been attempted for this host.
    pub fn needs_resolution(&self) -> bool {
        self.hostname.is_none()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Field value with the "N/A" sentinel for fields never set.
    pub fn field_or_na(&self, name: &str) -> &str {
        self.field(name).unwrap_or(NOT_APPLICABLE)
    }

    /// Merge a single field value. Returns true if the stored value changed.
    pub fn merge_field(&mut self, name: &str, value: &str) -> bool {
        match self.fields.get_mut(name) {
            Some(stored) => {
                if should_replace(stored, value) {
                    *stored = value.trim().to_string();
                    true
                } else {
                    false
                }
            }
            None => {
                self.fields.insert(name.to_string(), value.trim().to_string());
                true
            }
        }
    }

    /// Overwrite a field unconditionally. Used when restoring from CSV, where
    /// the stored row is authoritative for the fresh record.
    pub fn set_field(&mut self, name: &str, value: &str) {
        self.fields.insert(name.to_string(), value.trim().to_string());
    }

    /// Whether the field holds a "Yes"/"No" verdict already.
    pub fn is_concluded(&self, name: &str) -> bool {
        self.field(name)
            .is_some_and(|v| Informativeness::of(v).is_conclusive())
    }

    pub fn is_affirmative(&self, name: &str) -> bool {
        self.field(name)
            .is_some_and(|v| Informativeness::of(v) == Informativeness::Affirmative)
    }

    /// Fold another record for the same address into this one.
    pub fn merge(&mut self, other: &HostRecord) {
        if self.hostname().is_empty() && !other.hostname().is_empty() {
            self.hostname = other.hostname.clone();
        } else if self.hostname.is_none() {
            self.hostname = other.hostname.clone();
        }
        self.open_ports.extend(other.open_ports.iter().copied());
        for (name, value) in &other.fields {
            self.merge_field(name, value);
        }
    }
}

impl fmt::Display for HostRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<16}{}", self.ip.to_string(), self.hostname())
    }
}

// ── Readers ───────────────────────────────────────────────────────

/// Anything that can restore its own columns from a previously written row.
///
/// Implementations must never fail: a missing or blank column becomes "N/A".
pub trait HostReader: Send + Sync {
    fn read_host(&self, row: &CsvRow, host: &mut HostRecord);
}

/// Read a column from a row, defaulting to "N/A" when absent or blank.
pub fn read_column(row: &CsvRow, name: &str) -> String {
    match row.get(name).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => NOT_APPLICABLE.to_string(),
    }
}
