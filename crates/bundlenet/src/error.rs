//! Error types for a bundlenet node.

use bundlenet_core::CoreError;
use bundlenet_session::SessionError;
use bundlenet_store::StoreError;
use bundlenet_sync::SyncError;
use thiserror::Error;

use crate::config::NodeRole;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Codec, identifier or signature error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Session cryptography error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Exchange error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error("config read error: {0}")]
    ConfigRead(#[from] std::io::Error),

    /// Configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The operation is not available to this node's role.
    #[error("{operation} is not available to a {role} node")]
    WrongRole {
        operation: &'static str,
        role: NodeRole,
    },
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
