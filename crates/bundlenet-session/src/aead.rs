//! Chunked authenticated encryption.
//!
//! Large payloads are sealed as a sequence of fixed-size ChaCha20-Poly1305
//! chunks under one message key. Each chunk nonce is
//! `chunk index (u64 BE) || 0 0 0 || final flag`, so chunks cannot be
//! reordered, dropped or truncated without detection. Every chunk
//! authenticates the same associated data.

use crate::error::{Result, SessionError};
use crate::keys::{EncryptionKey, EncryptionNonce};

/// Plaintext bytes per chunk.
pub const AEAD_CHUNK_SIZE: usize = 64 * 1024;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

fn chunk_nonce(index: u64, last: bool) -> EncryptionNonce {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&index.to_be_bytes());
    nonce[11] = u8::from(last);
    EncryptionNonce::from_bytes(nonce)
}

/// Ciphertext length for a plaintext of `len` bytes.
pub fn sealed_len(len: usize) -> usize {
    let chunks = len.div_ceil(AEAD_CHUNK_SIZE).max(1);
    len + chunks * TAG_LEN
}

/// Seal `plaintext` under `key`. An empty plaintext yields one empty chunk.
pub fn seal(key: &EncryptionKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(sealed_len(plaintext.len()));
    let mut chunks = plaintext.chunks(AEAD_CHUNK_SIZE).peekable();
    if chunks.peek().is_none() {
        out.extend(key.encrypt(&[], aad, &chunk_nonce(0, true))?);
        return Ok(out);
    }
    let mut index = 0u64;
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        out.extend(key.encrypt(chunk, aad, &chunk_nonce(index, last))?);
        index += 1;
    }
    Ok(out)
}

/// Open a sealed payload. Fails on any tampering, reordering or truncation.
pub fn open(key: &EncryptionKey, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(SessionError::Decryption("ciphertext shorter than a tag".into()));
    }
    let mut out = Vec::with_capacity(ciphertext.len());
    let mut chunks = ciphertext.chunks(AEAD_CHUNK_SIZE + TAG_LEN).peekable();
    let mut index = 0u64;
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        out.extend(key.decrypt(chunk, aad, &chunk_nonce(index, last))?);
        index += 1;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_chunk_roundtrip() {
        let key = EncryptionKey::generate();
        let plaintext: Vec<u8> = (0..(AEAD_CHUNK_SIZE * 2 + 17)).map(|i| i as u8).collect();
        let sealed = seal(&key, b"aad", &plaintext).unwrap();
        assert_eq!(sealed.len(), sealed_len(plaintext.len()));
        assert_eq!(open(&key, b"aad", &sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = EncryptionKey::generate();
        let sealed = seal(&key, b"", b"").unwrap();
        assert_eq!(sealed.len(), TAG_LEN);
        assert!(open(&key, b"", &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_truncation_detected() {
        let key = EncryptionKey::generate();
        let plaintext = vec![7u8; AEAD_CHUNK_SIZE * 2];
        let sealed = seal(&key, b"", &plaintext).unwrap();
        // Drop the final chunk: the new last chunk lacks the final flag.
        let truncated = &sealed[..AEAD_CHUNK_SIZE + TAG_LEN];
        assert!(matches!(
            open(&key, b"", truncated),
            Err(SessionError::Decryption(_))
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_any_flip_fails_open(
            plaintext in proptest::collection::vec(proptest::num::u8::ANY, 0..256),
            pick in proptest::num::usize::ANY,
        ) {
            let key = EncryptionKey::from_bytes([9; 32]);
            let mut sealed = seal(&key, b"h", &plaintext).unwrap();
            let idx = pick % sealed.len();
            sealed[idx] ^= 0x01;
            proptest::prop_assert!(open(&key, b"h", &sealed).is_err());
        }
    }

    #[test]
    fn test_aad_mismatch_detected() {
        let key = EncryptionKey::generate();
        let sealed = seal(&key, b"header-a", b"data").unwrap();
        assert!(open(&key, b"header-b", &sealed).is_err());
    }
}
