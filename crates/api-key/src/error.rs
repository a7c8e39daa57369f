//! Error types for API key operations.

use thiserror::Error;

/// Errors raised while reading a presented key or a stored digest.
#[derive(Debug, Error)]
pub enum ApiKeyError {
    /// Token does not have the `{prefix}_v{version}_{payload}` shape.
    #[error("invalid token format")]
    InvalidFormat,

    /// Token prefix doesn't match the deployment's prefix.
    #[error("invalid prefix: expected '{expected}', got '{got}'")]
    InvalidPrefix { expected: String, got: String },

    #[error("unsupported version: {0}")]
    UnsupportedVersion(i16),

    /// Payload is not valid base32.
    #[error("invalid base32 encoding")]
    InvalidEncoding,

    /// A stored digest could not be decoded from hex.
    #[error("invalid stored digest")]
    InvalidDigest,
}

pub type Result<T> = std::result::Result<T, ApiKeyError>;
