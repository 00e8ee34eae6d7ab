//! Error types for HRM

use thiserror::Error;

/// Result type alias for HRM operations
pub type Result<T> = std::result::Result<T, HrmError>;

/// Main error type shared by the HRM crates
#[derive(Error, Debug)]
pub enum HrmError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Malformed payload for {table}: {message}")]
    MalformedPayload { table: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
