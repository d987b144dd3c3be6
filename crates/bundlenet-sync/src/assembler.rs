//! Bundle assembly and disassembly.
//!
//! A bundle on the wire is a container with these entries:
//!
//! | entry                | content                                          |
//! |----------------------|--------------------------------------------------|
//! | `payload`            | session ciphertext of the encoded payload        |
//! | `bundle.id`          | encrypted bundle id, as text                     |
//! | `sender.identity`    | sender's Ed25519 identity key                    |
//! | `recipient.identity` | recipient's Ed25519 identity key                 |
//! | `handshake`          | CBOR handshake, while the session is unanswered  |
//! | `signature`          | sender signature over the manifest digest        |
//!
//! The signature covers the digest of every other manifest entry, which in
//! turn pins every entry's bytes.

use bytes::Bytes;

use bundlenet_core::{
    BundleId, BundlePayload, Container, ContainerBuilder, ContainerReader, CoreError, Ed25519PublicKey,
    Ed25519Signature, EncryptedBundleId, PeerId,
};
use bundlenet_session::{verify, BundleIdCipher, Identity, InitialMessage, SessionError, SessionState};

use crate::error::Result;

/// Container entry names.
pub mod entries {
    pub const PAYLOAD: &str = "payload";
    pub const BUNDLE_ID: &str = "bundle.id";
    pub const SENDER: &str = "sender.identity";
    pub const RECIPIENT: &str = "recipient.identity";
    pub const HANDSHAKE: &str = "handshake";
    pub const SIGNATURE: &str = "signature";
}

/// An assembled bundle ready for the spool.
#[derive(Debug, Clone)]
pub struct SealedBundle {
    pub id: EncryptedBundleId,
    pub bytes: Bytes,
}

/// Seal `payload` for the owner of `session`.
///
/// Advances the sending chain of `session`; callers persist it only once the
/// bundle is spooled.
pub fn assemble(
    local: &Identity,
    session: &mut SessionState,
    cipher: &BundleIdCipher,
    payload: &BundlePayload,
) -> Result<SealedBundle> {
    let id = cipher.encrypt(&payload.bundle_id)?;
    let handshake = session.pending_handshake().map(InitialMessage::to_cbor).transpose()?;
    let recipient = *session.remote_identity();
    let ciphertext = session.encrypt(&payload.encode()?)?;

    let mut builder = ContainerBuilder::new();
    builder
        .add(entries::PAYLOAD, ciphertext)?
        .add(entries::BUNDLE_ID, id.as_str().as_bytes().to_vec())?
        .add(entries::SENDER, local.public_key().as_bytes().to_vec())?
        .add(entries::RECIPIENT, recipient.as_bytes().to_vec())?;
    if let Some(handshake) = handshake {
        builder.add(entries::HANDSHAKE, handshake)?;
    }
    let digest = builder.manifest().digest_excluding(entries::SIGNATURE);
    let signature = local.sign(digest.as_bytes());
    builder.add(entries::SIGNATURE, signature.as_bytes().to_vec())?;

    Ok(SealedBundle {
        id,
        bytes: Bytes::from(builder.to_bytes()),
    })
}

/// A bundle whose container, addressing and signature checked out, but whose
/// payload is still sealed.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Ed25519PublicKey,
    pub encrypted_id: EncryptedBundleId,
    pub handshake: Option<InitialMessage>,
    ciphertext: Bytes,
}

/// Unpack and authenticate a bundle addressed to `local`.
pub fn open_envelope(bytes: &[u8], local: &Ed25519PublicKey) -> Result<Envelope> {
    open_container(&ContainerReader::new(bytes)?.read_all()?, local)
}

/// Authenticate an already verified container addressed to `local`.
pub fn open_container(container: &Container, local: &Ed25519PublicKey) -> Result<Envelope> {
    let recipient = Ed25519PublicKey::from_slice(container.require(entries::RECIPIENT)?)?;
    if recipient != *local {
        return Err(SessionError::UntrustedPeer("bundle is addressed to another identity".into()).into());
    }

    let sender = Ed25519PublicKey::from_slice(container.require(entries::SENDER)?)?;
    let signature = Ed25519Signature::from_slice(container.require(entries::SIGNATURE)?)?;
    let digest = container.manifest().digest_excluding(entries::SIGNATURE);
    if !verify(&sender, digest.as_bytes(), &signature) {
        return Err(CoreError::InvalidSignature.into());
    }

    let id_text = std::str::from_utf8(container.require(entries::BUNDLE_ID)?)
        .map_err(|_| CoreError::MalformedBundleId("bundle id entry is not utf-8".into()))?;
    let encrypted_id = EncryptedBundleId::parse(id_text)?;

    let handshake = container
        .get(entries::HANDSHAKE)
        .map(|raw| InitialMessage::from_cbor(raw))
        .transpose()?;
    if let Some(handshake) = &handshake {
        if handshake.initiator != sender {
            return Err(
                SessionError::UntrustedPeer("handshake initiator is not the sender".into()).into(),
            );
        }
    }

    Ok(Envelope {
        sender,
        encrypted_id,
        handshake,
        ciphertext: container.require(entries::PAYLOAD)?.clone(),
    })
}

impl Envelope {
    pub fn sender_peer(&self) -> PeerId {
        PeerId::from_public_key(&self.sender)
    }

    pub fn decrypt_id(&self, cipher: &BundleIdCipher) -> Result<BundleId> {
        Ok(cipher.decrypt(&self.encrypted_id)?)
    }

    /// Decrypt the payload and check it names `expected`.
    ///
    /// Advances the receiving chain of `session` on success only.
    pub fn open_payload(&self, session: &mut SessionState, expected: &BundleId) -> Result<BundlePayload> {
        let mut candidate = session.clone();
        let plaintext = candidate.decrypt(&self.ciphertext)?;
        let payload = BundlePayload::decode(&plaintext, self.sender_peer())?;
        if payload.bundle_id != *expected {
            return Err(CoreError::MalformedPayload("payload bundle id differs from envelope".into()).into());
        }
        *session = candidate;
        Ok(payload)
    }
}

/// Open a bundle end to end with an established session.
pub fn disassemble(
    bytes: &[u8],
    local: &Identity,
    session: &mut SessionState,
    cipher: &BundleIdCipher,
) -> Result<BundlePayload> {
    let envelope = open_envelope(bytes, &local.public_key())?;
    let id = envelope.decrypt_id(cipher)?;
    envelope.open_payload(session, &id)
}
