//! Double ratchet session state.
//!
//! One [`SessionState`] exists per remote peer. It is created once by the
//! X3DH handshake and then ratcheted forward on every encrypt and decrypt,
//! for as long as the pairing lives. Bundles can be separated by arbitrary
//! real time; nothing here expires.
//!
//! Decryption is transactional: work happens on a copy of the state that
//! replaces the stored state only when the message authenticates.

use serde::{Deserialize, Serialize};
use std::fmt;

use bundlenet_core::{Ed25519PublicKey, PeerId};

use crate::aead;
use crate::error::{Result, SessionError};
use crate::keys::{EncryptionKey, X25519PublicKey, X25519StaticSecret};
use crate::x3dh::InitialMessage;

/// Max message keys derived ahead for one receiving chain.
pub const MAX_SKIP: u32 = 256;

/// Encoded header length.
pub const HEADER_LEN: usize = 32 + 4 + 4;

/// Ratchet header sent in the clear with each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sender's current ratchet public key.
    pub dh: X25519PublicKey,
    /// Length of the sender's previous sending chain.
    pub prev_chain_len: u32,
    /// Index in the current sending chain.
    pub n: u32,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..32].copy_from_slice(self.dh.as_bytes());
        out[32..36].copy_from_slice(&self.prev_chain_len.to_be_bytes());
        out[36..].copy_from_slice(&self.n.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SessionError::Decryption("message shorter than header".into()));
        }
        let mut dh = [0u8; 32];
        dh.copy_from_slice(&bytes[..32]);
        let mut pn = [0u8; 4];
        pn.copy_from_slice(&bytes[32..36]);
        let mut n = [0u8; 4];
        n.copy_from_slice(&bytes[36..40]);
        Ok(Self {
            dh: X25519PublicKey::from_bytes(dh),
            prev_chain_len: u32::from_be_bytes(pn),
            n: u32::from_be_bytes(n),
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh: X25519PublicKey,
    n: u32,
    key: [u8; 32],
}

fn kdf_root(root_key: &[u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut hasher = blake3::Hasher::new_keyed(root_key);
    hasher.update(b"bundlenet ratchet root");
    hasher.update(dh_out);
    let mut out = [0u8; 64];
    hasher.finalize_xof().fill(&mut out);
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&out[..32]);
    chain.copy_from_slice(&out[32..]);
    (root, chain)
}

/// Returns `(next_chain_key, message_key)`.
fn kdf_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let message = blake3::keyed_hash(chain_key, &[0x01]);
    let next = blake3::keyed_hash(chain_key, &[0x02]);
    (*next.as_bytes(), *message.as_bytes())
}

/// Persistent per-peer session.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    local_identity: Ed25519PublicKey,
    remote_identity: Ed25519PublicKey,
    remote_identity_dh: X25519PublicKey,
    root_key: [u8; 32],
    dh_self: [u8; 32],
    dh_remote: Option<X25519PublicKey>,
    send_chain: Option<[u8; 32]>,
    recv_chain: Option<[u8; 32]>,
    send_n: u32,
    recv_n: u32,
    prev_send_n: u32,
    skipped: Vec<SkippedKey>,
    /// Set on the initiator until the responder's first message arrives.
    pending_handshake: Option<InitialMessage>,
    /// Set on the responder: the handshake this session was built from.
    handshake_base_key: Option<X25519PublicKey>,
    messages_encrypted: u64,
    messages_decrypted: u64,
}

impl SessionState {
    pub(crate) fn initiator(
        local_identity: Ed25519PublicKey,
        remote_identity: Ed25519PublicKey,
        remote_identity_dh: X25519PublicKey,
        shared_secret: [u8; 32],
        remote_ratchet_key: X25519PublicKey,
        handshake: InitialMessage,
    ) -> Self {
        let dh_self = X25519StaticSecret::generate();
        let dh_out = dh_self.diffie_hellman(&remote_ratchet_key);
        let (root_key, send_chain) = kdf_root(&shared_secret, dh_out.as_bytes());
        Self {
            local_identity,
            remote_identity,
            remote_identity_dh,
            root_key,
            dh_self: dh_self.to_bytes(),
            dh_remote: Some(remote_ratchet_key),
            send_chain: Some(send_chain),
            recv_chain: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            skipped: Vec::new(),
            pending_handshake: Some(handshake),
            handshake_base_key: None,
            messages_encrypted: 0,
            messages_decrypted: 0,
        }
    }

    pub(crate) fn responder(
        local_identity: Ed25519PublicKey,
        remote_identity: Ed25519PublicKey,
        remote_identity_dh: X25519PublicKey,
        shared_secret: [u8; 32],
        signed_pre_key: &X25519StaticSecret,
        base_key: X25519PublicKey,
    ) -> Self {
        Self {
            local_identity,
            remote_identity,
            remote_identity_dh,
            root_key: shared_secret,
            dh_self: signed_pre_key.to_bytes(),
            dh_remote: None,
            send_chain: None,
            recv_chain: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            skipped: Vec::new(),
            pending_handshake: None,
            handshake_base_key: Some(base_key),
            messages_encrypted: 0,
            messages_decrypted: 0,
        }
    }

    pub fn local_identity(&self) -> &Ed25519PublicKey {
        &self.local_identity
    }

    pub fn remote_identity(&self) -> &Ed25519PublicKey {
        &self.remote_identity
    }

    pub fn remote_peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.remote_identity)
    }

    pub fn remote_identity_dh(&self) -> &X25519PublicKey {
        &self.remote_identity_dh
    }

    /// The handshake to attach to outgoing bundles, until it is confirmed.
    pub fn pending_handshake(&self) -> Option<&InitialMessage> {
        self.pending_handshake.as_ref()
    }

    /// Base key of the handshake a responder session was built from.
    pub fn handshake_base_key(&self) -> Option<&X25519PublicKey> {
        self.handshake_base_key.as_ref()
    }

    /// A responder cannot send until it has received.
    pub fn can_send(&self) -> bool {
        self.send_chain.is_some()
    }

    /// Total messages encrypted and decrypted under this session.
    pub fn message_counts(&self) -> (u64, u64) {
        (self.messages_encrypted, self.messages_decrypted)
    }

    fn dh_self_secret(&self) -> X25519StaticSecret {
        X25519StaticSecret::from_bytes(self.dh_self)
    }

    /// Encrypt one message, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let chain = self
            .send_chain
            .ok_or_else(|| SessionError::Encryption("session has no sending chain yet".into()))?;
        let (next_chain, message_key) = kdf_chain(&chain);
        let header = MessageHeader {
            dh: self.dh_self_secret().public_key(),
            prev_chain_len: self.prev_send_n,
            n: self.send_n,
        };
        let header_bytes = header.to_bytes();
        let ciphertext = aead::seal(
            &EncryptionKey::from_bytes(message_key),
            &header_bytes,
            plaintext,
        )?;

        self.send_chain = Some(next_chain);
        self.send_n += 1;
        self.messages_encrypted += 1;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt one message.
    ///
    /// On failure the session is left unchanged.
    pub fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let header = MessageHeader::from_bytes(message)?;
        let ciphertext = &message[HEADER_LEN..];
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(&header, ciphertext)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place(&mut self, header: &MessageHeader, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let aad = header.to_bytes();

        if let Some(pos) = self
            .skipped
            .iter()
            .position(|k| k.dh == header.dh && k.n == header.n)
        {
            let key = self.skipped.remove(pos).key;
            let plaintext = aead::open(&EncryptionKey::from_bytes(key), &aad, ciphertext)?;
            self.confirm();
            return Ok(plaintext);
        }

        if self.dh_remote != Some(header.dh) {
            self.skip_message_keys(header.prev_chain_len)?;
            self.dh_ratchet(header.dh);
        }
        self.skip_message_keys(header.n)?;

        let chain = self
            .recv_chain
            .ok_or_else(|| SessionError::Decryption("no receiving chain".into()))?;
        let (next_chain, message_key) = kdf_chain(&chain);
        self.recv_chain = Some(next_chain);
        self.recv_n += 1;

        let plaintext = aead::open(&EncryptionKey::from_bytes(message_key), &aad, ciphertext)?;
        self.confirm();
        Ok(plaintext)
    }

    fn confirm(&mut self) {
        self.pending_handshake = None;
        self.messages_decrypted += 1;
    }

    fn skip_message_keys(&mut self, until: u32) -> Result<()> {
        let (Some(mut chain), Some(dh)) = (self.recv_chain, self.dh_remote) else {
            return Ok(());
        };
        if until > self.recv_n.saturating_add(MAX_SKIP) {
            return Err(SessionError::Decryption(format!(
                "message index {until} too far ahead of {}",
                self.recv_n
            )));
        }
        while self.recv_n < until {
            let (next_chain, key) = kdf_chain(&chain);
            self.skipped.push(SkippedKey {
                dh,
                n: self.recv_n,
                key,
            });
            chain = next_chain;
            self.recv_n += 1;
        }
        self.recv_chain = Some(chain);

        let excess = self.skipped.len().saturating_sub(MAX_SKIP as usize);
        self.skipped.drain(..excess);
        Ok(())
    }

    fn dh_ratchet(&mut self, remote: X25519PublicKey) {
        self.prev_send_n = self.send_n;
        self.send_n = 0;
        self.recv_n = 0;
        self.dh_remote = Some(remote);

        let dh_out = self.dh_self_secret().diffie_hellman(&remote);
        let (root_key, recv_chain) = kdf_root(&self.root_key, dh_out.as_bytes());
        self.recv_chain = Some(recv_chain);

        let fresh = X25519StaticSecret::generate();
        let dh_out = fresh.diffie_hellman(&remote);
        let (root_key, send_chain) = kdf_root(&root_key, dh_out.as_bytes());
        self.root_key = root_key;
        self.send_chain = Some(send_chain);
        self.dh_self = fresh.to_bytes();
    }

    /// Serialize for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| SessionError::Serialization(e.to_string()))
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("remote", &self.remote_peer_id())
            .field("send_n", &self.send_n)
            .field("recv_n", &self.recv_n)
            .field("skipped", &self.skipped.len())
            .field("pending_handshake", &self.pending_handshake.is_some())
            .finish_non_exhaustive()
    }
}
