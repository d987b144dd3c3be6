//! Exchange configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Tunables for one exchange attempt and for bundle construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Upper bound on a single upload, download or RPC.
    pub transfer_timeout: Duration,
    /// Chunk size for streamed transfers. Carries no protocol meaning.
    pub chunk_size: usize,
    /// Budget for ADU bytes in one bundle.
    pub max_payload_bytes: usize,
    /// Downloads declaring more than this are refused.
    pub max_bundle_bytes: u64,
    /// How many expected downstream bundle ids an endpoint probes for.
    pub download_probe_window: u64,
    /// Oldest acceptable recency blob.
    pub recency_max_age: Duration,
    /// How far in the future a recency blob may be stamped.
    pub recency_future_skew: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(30),
            chunk_size: 4 * 1024 * 1024,
            max_payload_bytes: 16 * 1024 * 1024,
            max_bundle_bytes: 64 * 1024 * 1024,
            download_probe_window: 10,
            recency_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            recency_future_skew: Duration::from_secs(60),
        }
    }
}

impl ExchangeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transfer_timeout.is_zero() {
            return Err(SyncError::Config("transfer_timeout must be non-zero".into()));
        }
        if self.chunk_size == 0 {
            return Err(SyncError::Config("chunk_size must be non-zero".into()));
        }
        if self.max_payload_bytes == 0 {
            return Err(SyncError::Config("max_payload_bytes must be non-zero".into()));
        }
        if (self.max_payload_bytes as u64) > self.max_bundle_bytes {
            return Err(SyncError::Config(format!(
                "max_payload_bytes {} exceeds max_bundle_bytes {}",
                self.max_payload_bytes, self.max_bundle_bytes
            )));
        }
        if self.download_probe_window == 0 {
            return Err(SyncError::Config("download_probe_window must be non-zero".into()));
        }
        Ok(())
    }
}
