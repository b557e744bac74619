//! Error types for the Palisade admission subsystem.

use thiserror::Error;

/// Main error type for Palisade operations.
#[derive(Error, Debug)]
pub enum PalisadeError {
    /// Configuration-related errors: malformed IP patterns or regexes,
    /// duplicate quota names, sync messages with the wrong shape.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Usage-storage backend errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Palisade operations.
pub type Result<T> = std::result::Result<T, PalisadeError>;
