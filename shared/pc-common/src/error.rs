//! Common Errors

use thiserror::Error;

/// Errors raised while handling shared wire types.
#[derive(Debug, Error)]
pub enum Error {
    /// A frame could not be encoded or decoded.
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    /// An identifier was empty or otherwise unusable.
    #[error("Invalid identifier: {0:?}")]
    InvalidId(String),
}

/// Result alias for common operations.
pub type Result<T> = std::result::Result<T, Error>;
