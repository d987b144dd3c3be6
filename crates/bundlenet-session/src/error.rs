//! Error types for session cryptography.

use thiserror::Error;

/// Errors raised by handshake, ratchet and bundle-id cipher operations.
///
/// None of these advance session state: a failed operation leaves the
/// session exactly as it was.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Signature or identity mismatch.
    #[error("untrusted peer: {0}")]
    UntrustedPeer(String),

    /// Ciphertext corrupt or session desynchronized.
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The bundle id was not encrypted under our pairwise key.
    #[error("bundle id does not decrypt under this pairing")]
    BundleIdDecrypt,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("core error: {0}")]
    Core(#[from] bundlenet_core::CoreError),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
