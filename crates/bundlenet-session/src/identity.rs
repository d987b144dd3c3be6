//! Long-term identities and signed pre-keys.

use serde::{Deserialize, Serialize};

use bundlenet_core::{Ed25519PublicKey, Ed25519Signature, Keypair, PeerId};

use crate::error::{Result, SessionError};
use crate::keys::{X25519PublicKey, X25519StaticSecret};

const PRE_KEY_DOMAIN: &[u8] = b"bundlenet/signed-pre-key/v1";

/// A node's long-term identity.
///
/// Holds the Ed25519 signing key, an X25519 identity key for key agreement
/// and the X25519 signed pre-key advertised in [`PreKeyBundle`].
#[derive(Clone)]
pub struct Identity {
    signing: Keypair,
    dh: X25519StaticSecret,
    signed_pre_key: X25519StaticSecret,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing: Keypair::generate(),
            dh: X25519StaticSecret::generate(),
            signed_pre_key: X25519StaticSecret::generate(),
        }
    }

    /// Derive a full identity from one 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let derive = |context: &str| blake3::derive_key(context, seed);
        Self {
            signing: Keypair::from_seed(&derive("bundlenet v1 identity signing")),
            dh: X25519StaticSecret::from_bytes(derive("bundlenet v1 identity dh")),
            signed_pre_key: X25519StaticSecret::from_bytes(derive("bundlenet v1 signed pre-key")),
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.signing
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        self.signing.public_key()
    }

    pub fn peer_id(&self) -> PeerId {
        self.signing.peer_id()
    }

    pub fn dh_public(&self) -> X25519PublicKey {
        self.dh.public_key()
    }

    pub(crate) fn dh_secret(&self) -> &X25519StaticSecret {
        &self.dh
    }

    pub(crate) fn signed_pre_key(&self) -> &X25519StaticSecret {
        &self.signed_pre_key
    }

    /// Sign bytes with the identity key.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        self.signing.sign(message)
    }

    /// The public material a peer needs to open a session with us.
    pub fn pre_key_bundle(&self) -> PreKeyBundle {
        let identity_dh = self.dh.public_key();
        let signed_pre_key = self.signed_pre_key.public_key();
        let signature = self
            .signing
            .sign(&pre_key_signing_bytes(&identity_dh, &signed_pre_key));
        PreKeyBundle {
            identity: self.public_key(),
            identity_dh,
            signed_pre_key,
            signature,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.peer_id())
    }
}

/// Verify a signature made by an identity key.
pub fn verify(public_key: &Ed25519PublicKey, message: &[u8], signature: &Ed25519Signature) -> bool {
    public_key.verify(message, signature).is_ok()
}

fn pre_key_signing_bytes(identity_dh: &X25519PublicKey, signed_pre_key: &X25519PublicKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(PRE_KEY_DOMAIN.len() + 64);
    out.extend_from_slice(PRE_KEY_DOMAIN);
    out.extend_from_slice(identity_dh.as_bytes());
    out.extend_from_slice(signed_pre_key.as_bytes());
    out
}

/// Published keys for session establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub identity: Ed25519PublicKey,
    pub identity_dh: X25519PublicKey,
    pub signed_pre_key: X25519PublicKey,
    /// Identity signature over both X25519 keys.
    pub signature: Ed25519Signature,
}

impl PreKeyBundle {
    /// Check that the identity key vouches for both X25519 keys.
    pub fn verify(&self) -> Result<()> {
        self.identity
            .verify(
                &pre_key_signing_bytes(&self.identity_dh, &self.signed_pre_key),
                &self.signature,
            )
            .map_err(|_| SessionError::UntrustedPeer("pre-key signature does not verify".into()))
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.identity)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| SessionError::Serialization(e.to_string()))
    }
}
