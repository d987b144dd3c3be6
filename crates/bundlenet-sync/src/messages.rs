//! Exchange RPC message types.
//!
//! Bundle bytes travel as streams (see [`crate::transport`]); these are the
//! small control messages around them. All of them are CBOR on the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use bundlenet_core::{EncryptedBundleId, PeerId, SignedRecencyBlob};

use crate::error::{Result, SyncError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message size limits.
pub mod limits {
    /// Max ids in each held set of an inventory request.
    pub const MAX_INVENTORY_IDS: usize = 100_000;
    /// Max encoded size of a control message.
    pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
}

/// Metadata sent ahead of an uploaded bundle stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadHeader {
    pub bundle_id: EncryptedBundleId,
    /// Identity of the node performing the upload (an endpoint or a relay).
    pub sender: PeerId,
}

/// What the receiving side did with an uploaded bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    /// Held opaquely for later forwarding.
    Stored,
    /// Opened and absorbed.
    Accepted,
    /// Already absorbed earlier.
    Duplicate,
    /// Dropped: integrity or cryptographic failure.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    pub bundle_id: EncryptedBundleId,
    pub status: UploadStatus,
}

impl UploadAck {
    /// Whether the receiver now holds the bundle, so the sender may drop it.
    pub fn is_held(&self) -> bool {
        !matches!(self.status, UploadStatus::Rejected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub bundle_id: EncryptedBundleId,
    pub requester: PeerId,
}

/// A relay's held bundle ids, sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRequest {
    pub relay: PeerId,
    /// Bundles collected from endpoints, on their way to the backend.
    pub held_upstream: Vec<EncryptedBundleId>,
    /// Bundles fetched from the backend, on their way to endpoints.
    pub held_downstream: Vec<EncryptedBundleId>,
}

/// The backend's verdict on a relay inventory. The three sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryResponse {
    /// Stale: the backend absorbed or no longer needs these.
    pub to_delete: Vec<EncryptedBundleId>,
    /// Relay-held endpoint bundles the backend has not seen; the relay sends them.
    pub to_download: Vec<EncryptedBundleId>,
    /// Backend bundles for routed endpoints the relay lacks; the relay fetches them.
    pub to_upload: Vec<EncryptedBundleId>,
}

impl InventoryResponse {
    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_download.is_empty() && self.to_upload.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyRequest {
    pub requester: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyResponse {
    pub responder: PeerId,
    /// `None` when a relay has not reached the backend yet.
    pub blob: Option<SignedRecencyBlob>,
}

impl InventoryRequest {
    /// An inventory from `relay` holding nothing.
    pub fn empty(relay: PeerId) -> Self {
        Self {
            relay,
            held_upstream: Vec::new(),
            held_downstream: Vec::new(),
        }
    }

    /// Check this message respects size limits.
    pub fn validate_limits(&self) -> Result<()> {
        if self.held_upstream.len() > limits::MAX_INVENTORY_IDS
            || self.held_downstream.len() > limits::MAX_INVENTORY_IDS
        {
            return Err(SyncError::InvalidMessage("too many inventory ids".into()));
        }
        Ok(())
    }
}

/// Encode a control message as CBOR.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| SyncError::InvalidMessage(format!("encode: {e}")))?;
    Ok(buf)
}

/// Decode a CBOR control message.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() > limits::MAX_MESSAGE_BYTES {
        return Err(SyncError::InvalidMessage(format!(
            "message of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    ciborium::from_reader(bytes).map_err(|e| SyncError::InvalidMessage(format!("decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(s: &str) -> EncryptedBundleId {
        EncryptedBundleId::parse(s).unwrap()
    }

    #[test]
    fn test_inventory_limits() {
        let ok = InventoryRequest {
            relay: PeerId::from_bytes([1; 32]),
            held_upstream: vec![eid("a")],
            held_downstream: vec![],
        };
        assert!(ok.validate_limits().is_ok());

        let too_many = InventoryRequest {
            held_upstream: vec![eid("a"); limits::MAX_INVENTORY_IDS + 1],
            ..ok
        };
        assert!(too_many.validate_limits().is_err());
    }

    #[test]
    fn test_empty_inventory_names_its_relay() {
        let relay = PeerId::from_bytes([3; 32]);
        let request = InventoryRequest::empty(relay);
        assert_eq!(request.relay, relay);
        assert!(request.held_upstream.is_empty() && request.held_downstream.is_empty());
        assert!(request.validate_limits().is_ok());
        assert!(InventoryResponse::default().is_empty());
    }

    #[test]
    fn test_upload_ack_held() {
        let ack = |status| UploadAck {
            bundle_id: eid("x"),
            status,
        };
        assert!(ack(UploadStatus::Stored).is_held());
        assert!(ack(UploadStatus::Duplicate).is_held());
        assert!(!ack(UploadStatus::Rejected("bad".into())).is_held());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_message::<InventoryResponse>(&[0xff, 0x00]).is_err());
    }

    #[test]
    fn test_inventory_response_survives_cbor() {
        let response = InventoryResponse {
            to_delete: vec![eid("x")],
            to_download: vec![eid("y")],
            to_upload: vec![],
        };
        let bytes = encode_message(&response).unwrap();
        assert_eq!(decode_message::<InventoryResponse>(&bytes).unwrap(), response);
    }
}
