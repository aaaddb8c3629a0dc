//! assetinv-core: Shared types for the asset inventory engine.
//!
//! This crate provides the foundational types used across all assetinv crates:
//! - `HostRecord`, the per-host attribute bag keyed by IPv4 address
//! - Field-value merge rules that keep informative values from regressing
//! - `Inventory`, the synchronized host map shared by the orchestrator and modules
//! - The `HostReader` capability used to rebuild hosts from CSV rows

pub mod error;
pub mod inventory;
pub mod types;

pub use error::CoreError;
pub use inventory::Inventory;
pub use types::{CsvRow, HostReader, HostRecord, Informativeness};
