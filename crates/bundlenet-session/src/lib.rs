//! # bundlenet Session
//!
//! End-to-end session cryptography between the two ends of a pairing.
//!
//! ## Overview
//!
//! A session is opened once with an X3DH-style handshake and then ratcheted
//! on every bundle for the lifetime of the pairing. Exchanges separated by
//! days or weeks stay forward secret without renegotiation.
//!
//! ## Key Concepts
//!
//! - **Identity**: Ed25519 signing key plus X25519 identity and signed pre-keys
//! - **PreKeyBundle**: The signed public keys a peer needs to open a session
//! - **SessionState**: Persisted double ratchet state, one per remote peer
//! - **BundleIdCipher**: Deterministic encryption of bundle identifiers
//!
//! Session state must be used by one writer at a time: encrypt and decrypt
//! take `&mut self` and messages must be processed in encryption order.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bundlenet_session::{x3dh, Identity};
//!
//! let endpoint = Identity::generate();
//! let backend = Identity::generate();
//!
//! let mut outbound = x3dh::initiate(&endpoint, &backend.pre_key_bundle()).unwrap();
//! let handshake = *outbound.pending_handshake().unwrap();
//! let mut inbound = x3dh::respond(&backend, &handshake).unwrap();
//!
//! let ciphertext = outbound.encrypt(b"payload").unwrap();
//! assert_eq!(inbound.decrypt(&ciphertext).unwrap(), b"payload");
//! ```

pub mod aead;
pub mod bundle_id_cipher;
pub mod error;
pub mod identity;
pub mod keys;
pub mod ratchet;
pub mod x3dh;

pub use bundle_id_cipher::BundleIdCipher;
pub use error::{Result, SessionError};
pub use identity::{verify, Identity, PreKeyBundle};
pub use keys::{EncryptionKey, EncryptionNonce, SharedKey, X25519PublicKey, X25519StaticSecret};
pub use ratchet::{MessageHeader, SessionState, MAX_SKIP};
pub use x3dh::InitialMessage;
