//! Encryption of bundle identifiers.
//!
//! Relays and transports only ever see [`EncryptedBundleId`]s. The key is
//! derived from the static identity DH between the two ends of a pairing,
//! so it is available before any ratchet message has been decrypted.
//!
//! Encryption is deterministic: the nonce is a keyed hash of the plain id.
//! An endpoint can therefore compute the encrypted ids of the bundles it
//! expects and ask a transport for them by name.

use bundlenet_core::{BundleId, EncryptedBundleId};

use crate::error::{Result, SessionError};
use crate::identity::Identity;
use crate::keys::{EncryptionKey, EncryptionNonce, X25519PublicKey};

const KEY_CONTEXT: &str = "bundlenet v1 bundle id key";
const NONCE_LEN: usize = 12;

/// Pairwise bundle id cipher.
#[derive(Clone, Debug)]
pub struct BundleIdCipher {
    key: EncryptionKey,
}

impl BundleIdCipher {
    /// Derive the cipher shared by `local` and the peer owning `remote_dh`.
    pub fn new(local: &Identity, remote_dh: &X25519PublicKey) -> Self {
        let shared = local.dh_secret().diffie_hellman(remote_dh);
        Self {
            key: shared.derive_encryption_key(KEY_CONTEXT),
        }
    }

    fn nonce_for(&self, plain: &[u8]) -> EncryptionNonce {
        let digest = blake3::keyed_hash(self.key.as_bytes(), plain);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest.as_bytes()[..NONCE_LEN]);
        EncryptionNonce::from_bytes(nonce)
    }

    pub fn encrypt(&self, id: &BundleId) -> Result<EncryptedBundleId> {
        let plain = id.encode();
        let nonce = self.nonce_for(&plain);
        let ciphertext = self.key.encrypt(&plain, b"", &nonce)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(EncryptedBundleId::from_ciphertext(&out))
    }

    /// Recover the plain id.
    ///
    /// Fails with [`SessionError::BundleIdDecrypt`] when the id belongs to a
    /// different pairing; callers treat that as "not mine".
    pub fn decrypt(&self, id: &EncryptedBundleId) -> Result<BundleId> {
        let raw = id
            .to_ciphertext()
            .map_err(|_| SessionError::BundleIdDecrypt)?;
        if raw.len() <= NONCE_LEN {
            return Err(SessionError::BundleIdDecrypt);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&raw[..NONCE_LEN]);
        let plain = self
            .key
            .decrypt(&raw[NONCE_LEN..], b"", &EncryptionNonce::from_bytes(nonce))
            .map_err(|_| SessionError::BundleIdDecrypt)?;
        BundleId::decode(&plain).map_err(|_| SessionError::BundleIdDecrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlenet_core::{Direction, PeerId};

    #[test]
    fn test_both_ends_share_the_cipher() {
        let endpoint = Identity::generate();
        let backend = Identity::generate();
        let at_endpoint = BundleIdCipher::new(&endpoint, &backend.dh_public());
        let at_backend = BundleIdCipher::new(&backend, &endpoint.dh_public());

        let id = BundleId::new(endpoint.peer_id(), 7, Direction::Upstream);
        let encrypted = at_endpoint.encrypt(&id).unwrap();
        assert_eq!(at_backend.decrypt(&encrypted).unwrap(), id);
    }

    #[test]
    fn test_deterministic_and_distinct() {
        let a = Identity::generate();
        let b = Identity::generate();
        let cipher = BundleIdCipher::new(&a, &b.dh_public());
        let peer = PeerId::from_bytes([1; 32]);

        let up = BundleId::new(peer, 1, Direction::Upstream);
        let down = BundleId::new(peer, 1, Direction::Downstream);
        assert_eq!(cipher.encrypt(&up).unwrap(), cipher.encrypt(&up).unwrap());
        assert_ne!(cipher.encrypt(&up).unwrap(), cipher.encrypt(&down).unwrap());
        assert!(cipher.encrypt(&up).unwrap().as_str().len() <= EncryptedBundleId::MAX_LEN);
    }

    #[test]
    fn test_foreign_id_is_not_mine() {
        let a = Identity::generate();
        let b = Identity::generate();
        let c = Identity::generate();
        let ours = BundleIdCipher::new(&a, &b.dh_public());
        let theirs = BundleIdCipher::new(&a, &c.dh_public());

        let id = BundleId::new(a.peer_id(), 1, Direction::Upstream);
        let encrypted = theirs.encrypt(&id).unwrap();
        assert!(matches!(
            ours.decrypt(&encrypted),
            Err(SessionError::BundleIdDecrypt)
        ));
        let garbage = EncryptedBundleId::parse("AAAA").unwrap();
        assert!(matches!(
            ours.decrypt(&garbage),
            Err(SessionError::BundleIdDecrypt)
        ));
    }
}
