//! Error types for the assetinv-scan crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InventoryError {
    /// Bad user input. The only fatal error kind.
    #[error("{0}")]
    Validation(String),

    #[error("Failed to launch {program}: {reason}")]
    EngineLaunch { program: String, reason: String },

    #[error("{program} exited with code {code}: {stderr}")]
    EngineFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program} timed out after {seconds}s")]
    EngineTimeout { program: String, seconds: u64 },

    #[error("Failed to parse scan output {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Failed to parse nmap XML output: {0}")]
    XmlParse(String),

    #[error("Authentication failed against {target}")]
    AuthenticationFailure { target: String },

    #[error("Required program not found: {0}")]
    MissingProgram(String),

    #[error("Module error: {0}")]
    Module(String),

    #[error("Cache error: {0}")]
    Cache(#[from] assetinv_cache::CacheError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InventoryError {
    /// Only validation failures stop a run; everything else degrades.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, InventoryError>;
