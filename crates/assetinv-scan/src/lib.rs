//! assetinv-scan: Internal network asset inventory.
//!
//! Wraps zmap to sweep address ranges and scan ports on live hosts, keeps a
//! host cache so repeated engagements only do new work, runs pluggable
//! enrichment modules, and computes deltas against earlier inventories.

pub mod config;
pub mod deliverable;
pub mod delta;
pub mod engine;
pub mod error;
pub mod modules;
pub mod nmap_xml;
pub mod orchestrator;
pub mod output;
pub mod plan;
pub mod report;
pub mod resolve;
pub mod targets;
