//! X3DH-style session establishment.
//!
//! The initiator combines its identity key and a fresh base key with the
//! responder's identity key and signed pre-key:
//!
//! ```text
//! DH1 = DH(IK_a, SPK_b)
//! DH2 = DH(EK_a, IK_b)
//! DH3 = DH(EK_a, SPK_b)
//! SK  = KDF(DH1 || DH2 || DH3 || ID_a || ID_b)
//! ```
//!
//! There are no one-time pre-keys: a session is established once per
//! pairing and then ratcheted forever.

use serde::{Deserialize, Serialize};

use bundlenet_core::Ed25519PublicKey;

use crate::error::{Result, SessionError};
use crate::identity::{Identity, PreKeyBundle};
use crate::keys::{SharedKey, X25519PublicKey, X25519StaticSecret};
use crate::ratchet::SessionState;

/// Handshake data the initiator attaches to its bundles until answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialMessage {
    pub initiator: Ed25519PublicKey,
    pub initiator_dh: X25519PublicKey,
    pub base_key: X25519PublicKey,
    /// Which of the responder's pre-keys was used.
    pub signed_pre_key: X25519PublicKey,
}

impl InitialMessage {
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

fn derive_shared_secret(
    dh1: &SharedKey,
    dh2: &SharedKey,
    dh3: &SharedKey,
    initiator: &Ed25519PublicKey,
    responder: &Ed25519PublicKey,
) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key("bundlenet v1 x3dh");
    hasher.update(dh1.as_bytes());
    hasher.update(dh2.as_bytes());
    hasher.update(dh3.as_bytes());
    hasher.update(initiator.as_bytes());
    hasher.update(responder.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Open a session towards the owner of `remote`.
///
/// Fails with [`SessionError::UntrustedPeer`] if the pre-key bundle is not
/// signed by its identity key.
pub fn initiate(local: &Identity, remote: &PreKeyBundle) -> Result<SessionState> {
    remote.verify()?;

    let base = X25519StaticSecret::generate();
    let dh1 = local.dh_secret().diffie_hellman(&remote.signed_pre_key);
    let dh2 = base.diffie_hellman(&remote.identity_dh);
    let dh3 = base.diffie_hellman(&remote.signed_pre_key);
    let shared = derive_shared_secret(&dh1, &dh2, &dh3, &local.public_key(), &remote.identity);

    let handshake = InitialMessage {
        initiator: local.public_key(),
        initiator_dh: local.dh_public(),
        base_key: base.public_key(),
        signed_pre_key: remote.signed_pre_key,
    };

    Ok(SessionState::initiator(
        local.public_key(),
        remote.identity,
        remote.identity_dh,
        shared,
        remote.signed_pre_key,
        handshake,
    ))
}

/// Accept a session opened by `handshake.initiator`.
///
/// The caller must authenticate the handshake (the bundle signature covers
/// it) before trusting the resulting session.
pub fn respond(local: &Identity, handshake: &InitialMessage) -> Result<SessionState> {
    let spk = local.signed_pre_key();
    if handshake.signed_pre_key != spk.public_key() {
        return Err(SessionError::UntrustedPeer(
            "handshake uses an unknown signed pre-key".into(),
        ));
    }

    let dh1 = spk.diffie_hellman(&handshake.initiator_dh);
    let dh2 = local.dh_secret().diffie_hellman(&handshake.base_key);
    let dh3 = spk.diffie_hellman(&handshake.base_key);
    let shared = derive_shared_secret(
        &dh1,
        &dh2,
        &dh3,
        &handshake.initiator,
        &local.public_key(),
    );

    Ok(SessionState::responder(
        local.public_key(),
        handshake.initiator,
        handshake.initiator_dh,
        shared,
        spk,
        handshake.base_key,
    ))
}
