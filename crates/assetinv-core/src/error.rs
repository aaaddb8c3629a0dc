use thiserror::Error;

/// Errors raised while building host records.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("Row is missing column: {0}")]
    MissingColumn(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
