//! Enrichment modules and the registry that drives them.
//!
//! A module declares the columns it owns, the TCP ports it needs open, and
//! the external programs it shells out to. The registry folds the ports
//! into the scan plan, checks programs before running anything, and runs
//! the selected modules in registration order after baseline scanning.

pub mod breaker;
pub mod enum_services;
pub mod eternalblue;
pub mod nmap_script;
pub mod open_shares;
pub mod open_vnc;
pub mod pool;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use assetinv_cache::table::is_core_column;
use assetinv_core::types::{read_column, CsvRow, NO, YES};
use assetinv_core::{HostReader, HostRecord, Inventory};

use crate::config::InventoryConfig;
use crate::error::{InventoryError, Result};

/// Everything a module may touch while it runs.
#[derive(Clone)]
pub struct ModuleContext {
    pub inventory: Arc<Inventory>,
    /// Where module artifacts (target lists, raw tool output) are written.
    pub artifact_dir: PathBuf,
}

#[async_trait]
pub trait Module: Send + Sync {
    /// Unique, already-normalized name used by `--modules`.
    fn name(&self) -> &'static str;

    /// Columns this module contributes, in output order.
    fn csv_headers(&self) -> Vec<String>;

    fn required_ports(&self) -> Vec<u16>;

    fn required_programs(&self) -> Vec<String>;

    /// Enrich the inventory. A failure on one host must not abort the batch.
    async fn run(&self, ctx: &ModuleContext) -> Result<()>;

    /// Print aggregate findings to stdout.
    fn report(&self, inventory: &Inventory);

    /// Restore this module's columns from a cached row. Never fails; missing
    /// values become "N/A".
    fn read_host(&self, row: &CsvRow, host: &mut HostRecord) {
        for header in self.csv_headers() {
            if !is_core_column(&header) {
                host.set_field(&header, &read_column(row, &header));
            }
        }
    }
}

/// How one module's run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleStatus {
    Completed,
    MissingPrograms(Vec<String>),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ModuleRun {
    pub name: &'static str,
    pub status: ModuleStatus,
}

/// Registration-ordered list of modules plus the user's selection.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn Module>>,
    active: Vec<bool>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in module, none selected.
    pub fn builtin(config: &InventoryConfig) -> Self {
        let mut registry = Self::new();
        let nmap = nmap_script::Nmap::from_config(config);
        registry.register(Box::new(eternalblue::EternalBlue::new(nmap.clone())));
        registry.register(Box::new(open_vnc::OpenVnc::new(
            nmap.clone(),
            config.open_vnc.clone(),
        )));
        registry.register(Box::new(open_shares::OpenShares::new(nmap)));
        registry.register(Box::new(enum_services::EnumServices::new(
            config.enum_services.clone(),
        )));
        registry
    }

    pub fn register(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
        self.active.push(false);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Activate the named modules. `all` or `*` selects everything. An
    /// unknown name is a validation error.
    pub fn select<S: AsRef<str>>(&mut self, requested: &[S]) -> Result<()> {
        for name in requested {
            let raw = name.as_ref().trim();
            if raw == "*" || raw.eq_ignore_ascii_case("all") {
                self.active.iter_mut().for_each(|a| *a = true);
                continue;
            }
            let wanted = normalize_name(raw);
            let Some(index) = self.modules.iter().position(|m| m.name() == wanted) else {
                return Err(InventoryError::Validation(format!(
                    "Invalid module \"{raw}\". Available modules: {}",
                    self.names().join(", ")
                )));
            };
            self.active[index] = true;
        }
        Ok(())
    }

    pub fn active(&self) -> impl Iterator<Item = &dyn Module> + '_ {
        self.modules
            .iter()
            .zip(&self.active)
            .filter(|(_, active)| **active)
            .map(|(m, _)| m.as_ref())
    }

    pub fn has_active(&self) -> bool {
        self.active.iter().any(|a| *a)
    }

    /// Union of the selected modules' ports.
    pub fn required_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.active().flat_map(|m| m.required_ports()).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Columns of the selected modules, in registration order.
    pub fn csv_headers(&self) -> Vec<String> {
        let mut headers: Vec<String> = Vec::new();
        for header in self.active().flat_map(|m| m.csv_headers()) {
            if !headers.contains(&header) {
                headers.push(header);
            }
        }
        headers
    }

    /// Run each selected module in order. A module with missing programs or
    /// a failing run is reported and skipped; the rest still run.
    pub async fn run_active(&self, ctx: &ModuleContext) -> Vec<ModuleRun> {
        let mut runs = Vec::new();
        for module in self.active() {
            let missing: Vec<String> = module
                .required_programs()
                .into_iter()
                .filter(|p| find_program(p).is_none())
                .collect();

            let status = if !missing.is_empty() {
                tracing::warn!(
                    module = module.name(),
                    missing = %missing.join(", "),
                    "Required programs not found, skipping module"
                );
                ModuleStatus::MissingPrograms(missing)
            } else {
                tracing::info!(module = module.name(), "Running module");
                match module.run(ctx).await {
                    Ok(()) => ModuleStatus::Completed,
                    Err(e) => {
                        tracing::warn!(module = module.name(), error = %e, "Module failed");
                        ModuleStatus::Failed(e.to_string())
                    }
                }
            };
            runs.push(ModuleRun {
                name: module.name(),
                status,
            });
        }
        runs
    }

    pub fn report(&self, inventory: &Inventory) {
        for module in self.active() {
            module.report(inventory);
        }
    }
}

impl HostReader for ModuleRegistry {
    fn read_host(&self, row: &CsvRow, host: &mut HostRecord) {
        for module in self.active() {
            module.read_host(row, host);
        }
    }
}

/// Lowercase, `_` → `-`, anything outside `[a-z-]` dropped.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || *c == '-')
        .collect()
}

/// Locate a program the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}

/// Hosts passing `filter` whose `field` holds no Yes/No verdict yet.
pub fn pending_hosts<F>(inventory: &Inventory, field: &str, filter: F) -> Vec<Ipv4Addr>
where
    F: Fn(&HostRecord) -> bool,
{
    inventory
        .snapshot()
        .into_iter()
        .filter(|h| !h.is_concluded(field) && filter(h))
        .map(|h| h.ip)
        .collect()
}

/// Record a verdict for every scanned host.
pub fn record_verdicts<I>(inventory: &Inventory, field: &str, verdicts: I) -> usize
where
    I: IntoIterator<Item = (Ipv4Addr, bool)>,
{
    let mut positive = 0;
    for (ip, hit) in verdicts {
        if hit {
            positive += 1;
        }
        inventory.merge_fields(&ip, [(field, if hit { YES } else { NO })]);
    }
    positive
}

/// Print the hosts whose `field` is "Yes".
pub fn print_affected(inventory: &Inventory, field: &str, label: &str) {
    let affected: Vec<HostRecord> = inventory
        .snapshot()
        .into_iter()
        .filter(|h| h.is_affirmative(field))
        .collect();

    if affected.is_empty() {
        println!("[+] No systems found with {label}");
    } else {
        println!("[+] {} system(s) with {label}:", affected.len());
        for host in &affected {
            println!("\t{host}");
        }
    }
    println!();
}
