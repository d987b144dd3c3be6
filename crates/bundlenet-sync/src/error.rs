//! Error types for the sync module.

use std::time::Duration;

use thiserror::Error;

use bundlenet_core::CoreError;
use bundlenet_session::SessionError;
use bundlenet_store::StoreError;

/// Errors that can occur during bundle exchange.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Container, payload, id or signature failure.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Untrusted peer, decryption or bundle id mismatch.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A transfer did not finish in time.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A transfer was abandoned before completion.
    #[error("transfer cancelled")]
    Cancelled,

    /// A bundle larger than the configured maximum was offered.
    #[error("bundle of {len} bytes exceeds limit of {max}")]
    BundleTooLarge { len: u64, max: u64 },

    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No pre-key bundle or session is known for this peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the failure is contained to a single received bundle.
    ///
    /// Integrity and cryptographic failures drop the bundle and the exchange
    /// goes on. Transport and storage failures end the attempt.
    pub fn is_bundle_local(&self) -> bool {
        match self {
            SyncError::Core(e) => !matches!(e, CoreError::Io(_)),
            SyncError::Session(_) | SyncError::BundleTooLarge { .. } | SyncError::UnknownPeer(_) => {
                true
            }
            SyncError::Store(_)
            | SyncError::Transport(_)
            | SyncError::Timeout(_)
            | SyncError::Cancelled
            | SyncError::InvalidMessage(_)
            | SyncError::Config(_) => false,
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_local_classification() {
        assert!(SyncError::Core(CoreError::Integrity { entry: "payload".into() }).is_bundle_local());
        assert!(SyncError::Session(SessionError::BundleIdDecrypt).is_bundle_local());
        assert!(SyncError::BundleTooLarge { len: 2, max: 1 }.is_bundle_local());
        assert!(!SyncError::Transport("reset".into()).is_bundle_local());
        assert!(!SyncError::Timeout(Duration::from_secs(1)).is_bundle_local());
        assert!(!SyncError::Cancelled.is_bundle_local());
    }
}
