//! assetinv-cache: persistent host state across engagements.
//!
//! The cache lives under `<work-dir>/cache/` and holds the known hosts
//! (as a CSV table in the same layout as the inventory output), the
//! per-port "already scanned" bookkeeping, and the raw output of every
//! scan-engine phase. Re-runs load it to skip work already done.

pub mod state;
pub mod store;
pub mod table;

pub use state::ScanState;
pub use store::{CacheError, CacheSnapshot, HostCache};
pub use table::TableLayout;
