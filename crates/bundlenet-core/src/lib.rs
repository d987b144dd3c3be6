//! # bundlenet Core
//!
//! Pure primitives for bundlenet: the bundle container, bundle identifiers,
//! the payload codec and recency attestations.
//!
//! This crate contains no storage, no networking and no session state. It is
//! pure computation over byte layouts and signatures.
//!
//! ## Key Types
//!
//! - [`Container`] / [`ContainerReader`] - Manifest-first archive with per-entry SHA-256 digests
//! - [`BundleId`] - Plain `(direction, peer, counter)` identifier
//! - [`EncryptedBundleId`] - Opaque id as seen by relays
//! - [`BundlePayload`] - Decrypted bundle contents: id, ack and ADUs
//! - [`SignedRecencyBlob`] - Backend freshness attestation
//!
//! ## Byte layouts
//!
//! Containers, plain bundle ids and the recency signing input use fixed
//! big-endian layouts. Structured values travel as CBOR.

pub mod bundle_id;
pub mod container;
pub mod crypto;
pub mod error;
pub mod payload;
pub mod recency;
pub mod types;

pub use bundle_id::{compare, decode_bundle_id, encode_bundle_id, BundleId, BUNDLE_ID_LEN};
pub use container::{pack, unpack, Container, ContainerBuilder, ContainerReader, Entry, Manifest};
pub use crypto::{Ed25519PublicKey, Ed25519Signature, Keypair, Sha256Digest};
pub use error::{CoreError, Result};
pub use payload::{Adu, BundlePayload, HEARTBEAT_ACK};
pub use recency::{
    now_millis, select_freshest, sign_recency_blob, verify_recency_blob, RecencyBlob,
    RecencyPolicy, SignedRecencyBlob,
};
pub use types::{AppId, Direction, EncryptedBundleId, PeerId};
