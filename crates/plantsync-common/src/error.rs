//! Error types shared across plantsync crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by shared helpers
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),
}
