//! Strong type definitions for bundlenet.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::Ed25519PublicKey;
use crate::error::{CoreError, Result};

/// A 32-byte peer identifier, derived from the peer's identity signing key.
///
/// Both ends of a pairing compute the same id from the same public key, so
/// the id never has to be transmitted separately from the key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Derive the peer id for an identity key.
    pub fn from_public_key(key: &Ed25519PublicKey) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key("bundlenet v1 peer id");
        hasher.update(key.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Create a new PeerId from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> std::result::Result<Self, Self::Error> {
        let arr: [u8; 32] = slice.try_into()?;
        Ok(Self(arr))
    }
}

/// Maximum length of an application id.
pub const MAX_APP_ID_LEN: usize = 100;

/// Application identifier, e.g. `"mail"` or `"net.example.chat"`.
///
/// Restricted to `[A-Za-z0-9._+-]` so it can be embedded in container entry
/// names and storage keys without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppId(String);

impl AppId {
    /// Validate and wrap an application id.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_APP_ID_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'+' | b'-'));
        if valid {
            Ok(Self(id))
        } else {
            Err(CoreError::InvalidAppId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AppId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AppId> for String {
    fn from(id: AppId) -> Self {
        id.0
    }
}

/// Direction of travel for a bundle.
///
/// Upstream bundles go from an endpoint to the backend, downstream bundles
/// from the backend to an endpoint. Counters are independent per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    Upstream = 1,
    Downstream = 2,
}

impl Direction {
    /// Parse from the wire tag.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Direction::Upstream),
            2 => Some(Direction::Downstream),
            _ => None,
        }
    }

    /// The opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            Direction::Upstream => Direction::Downstream,
            Direction::Downstream => Direction::Upstream,
        }
    }
}

/// An encrypted, opaque bundle identifier as seen by relays and transports.
///
/// Unpadded base64url text, safe to use as a file or key name. Only the two
/// ends of a pairing can recover the plain [`crate::BundleId`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EncryptedBundleId(String);

impl EncryptedBundleId {
    /// Maximum accepted text length.
    pub const MAX_LEN: usize = 128;

    /// Wrap raw ciphertext bytes.
    pub fn from_ciphertext(bytes: &[u8]) -> Self {
        use base64::Engine as _;
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse an id received over the wire, checking its alphabet and length.
    pub fn parse(s: &str) -> Result<Self> {
        let clean = !s.is_empty()
            && s.len() <= Self::MAX_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if clean {
            Ok(Self(s.to_string()))
        } else {
            Err(CoreError::MalformedBundleId(format!("not base64url: {s:?}")))
        }
    }

    /// Decode to ciphertext bytes.
    pub fn to_ciphertext(&self) -> Result<Vec<u8>> {
        use base64::Engine as _;
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&self.0)
            .map_err(|e| CoreError::MalformedBundleId(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EncryptedBundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.get(..12).unwrap_or(&self.0);
        write!(f, "EncryptedBundleId({shown}..)")
    }
}

impl fmt::Display for EncryptedBundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PeerId::from_bytes([0x42; 32]);
        let recovered = PeerId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, recovered);
    }

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::from_bytes([0xab; 32]);
        assert_eq!(format!("{}", id), "abababababababab");
    }

    #[test]
    fn test_peer_id_derivation_is_stable() {
        let key = Ed25519PublicKey::from_bytes([7; 32]);
        assert_eq!(PeerId::from_public_key(&key), PeerId::from_public_key(&key));
        let other = Ed25519PublicKey::from_bytes([8; 32]);
        assert_ne!(PeerId::from_public_key(&key), PeerId::from_public_key(&other));
    }

    #[test]
    fn test_app_id_validation() {
        assert!(AppId::new("mail").is_ok());
        assert!(AppId::new("net.example.k9-mail_v2+beta").is_ok());
        assert!(AppId::new("").is_err());
        assert!(AppId::new("has space").is_err());
        assert!(AppId::new("a/b").is_err());
        assert!(AppId::new("x".repeat(MAX_APP_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_app_id_serde_validates() {
        let ok: AppId = serde_json::from_str("\"mail\"").unwrap();
        assert_eq!(ok.as_str(), "mail");
        assert!(serde_json::from_str::<AppId>("\"../etc\"").is_err());
    }

    #[test]
    fn test_direction_tags() {
        assert_eq!(Direction::from_u8(1), Some(Direction::Upstream));
        assert_eq!(Direction::from_u8(2), Some(Direction::Downstream));
        assert_eq!(Direction::from_u8(0), None);
        assert_eq!(Direction::Upstream.reverse(), Direction::Downstream);
    }

    #[test]
    fn test_encrypted_bundle_id_parse() {
        let id = EncryptedBundleId::from_ciphertext(&[0xff, 0x00, 0x10]);
        assert_eq!(id.as_str(), "_wAQ");
        assert_eq!(id.to_ciphertext().unwrap(), vec![0xff, 0x00, 0x10]);
        assert!(EncryptedBundleId::parse("abc/def").is_err());
        assert!(EncryptedBundleId::parse("").is_err());
        assert!(EncryptedBundleId::parse("abc-_DEF").is_ok());
    }
}
