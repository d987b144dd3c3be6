//! Error types for bundlenet core.

use thiserror::Error;

/// Errors raised by the pure codecs in this crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A container entry's bytes do not match the digest in the manifest.
    #[error("integrity check failed for entry {entry:?}")]
    Integrity { entry: String },

    /// The container structure could not be parsed.
    #[error("malformed container: {0}")]
    MalformedContainer(String),

    /// Two entries with the same name were supplied to the packer.
    #[error("duplicate container entry: {0:?}")]
    DuplicateEntry(String),

    /// A required entry is missing.
    #[error("missing container entry: {0:?}")]
    MissingEntry(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("malformed bundle id: {0}")]
    MalformedBundleId(String),

    /// Compared two bundle ids that do not travel in the requested direction.
    #[error("bundle id direction mismatch: expected {expected:?}")]
    DirectionMismatch { expected: crate::types::Direction },

    #[error("invalid application id: {0:?}")]
    InvalidAppId(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Recency blob timestamp is older than the accepted window.
    #[error("recency blob is stale: age {age_ms} ms exceeds {max_age_ms} ms")]
    StaleRecencyBlob { age_ms: i64, max_age_ms: i64 },

    /// Recency blob timestamp is further in the future than the allowed skew.
    #[error("recency blob is {ahead_ms} ms in the future")]
    FutureRecencyBlob { ahead_ms: i64 },

    /// Recency blob was issued by someone other than the expected backend.
    #[error("recency blob issuer mismatch")]
    RecencyIssuerMismatch,

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// True for failures that mean the bytes themselves are bad.
    ///
    /// Such a bundle must be dropped and never retried as-is.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            CoreError::Integrity { .. }
                | CoreError::MalformedContainer(_)
                | CoreError::MissingEntry(_)
                | CoreError::InvalidSignature
                | CoreError::MalformedPayload(_)
        )
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
