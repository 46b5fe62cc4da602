//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Options could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// Options are inconsistent
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
