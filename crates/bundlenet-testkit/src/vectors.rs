//! Golden test vectors for deterministic verification.
//!
//! These vectors pin the byte layouts that cross node boundaries: the
//! container format and the plain bundle id. Any change to either breaks
//! interoperability with deployed nodes and must fail here first.

use serde::Serialize;

use bundlenet_core::{encode_bundle_id, pack, Direction, PeerId, Sha256Digest};

/// What a vector encodes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VectorInput {
    Sha256 {
        data: &'static [u8],
    },
    Container {
        entries: Vec<(&'static str, &'static [u8])>,
    },
    BundleId {
        peer_byte: u8,
        counter: u64,
        direction: Direction,
    },
}

/// A golden test vector.
#[derive(Debug, Clone, Serialize)]
pub struct GoldenVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    pub input: VectorInput,
    /// Expected encoding (hex).
    pub expected_hex: &'static str,
}

impl GoldenVector {
    /// Encode the input with the current implementation.
    pub fn encode(&self) -> Vec<u8> {
        match &self.input {
            VectorInput::Sha256 { data } => Sha256Digest::hash(data).as_bytes().to_vec(),
            VectorInput::Container { entries } => {
                pack(entries.iter().map(|(name, data)| (*name, *data)))
                    .expect("vector entries are valid")
            }
            VectorInput::BundleId {
                peer_byte,
                counter,
                direction,
            } => encode_bundle_id(&PeerId::from_bytes([*peer_byte; 32]), *counter, *direction).to_vec(),
        }
    }
}

/// Get all golden test vectors.
pub fn all_vectors() -> Vec<GoldenVector> {
    vec![
        GoldenVector {
            name: "sha256 of abc",
            input: VectorInput::Sha256 { data: b"abc" },
            expected_hex: "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        },
        GoldenVector {
            name: "empty container",
            input: VectorInput::Container { entries: vec![] },
            expected_hex: "424e444c010000",
        },
        GoldenVector {
            name: "single entry container",
            input: VectorInput::Container {
                entries: vec![("a", &b"hello"[..])],
            },
            expected_hex: concat!(
                "424e444c01", // magic, version
                "0001",       // count
                "0001", "61", // name
                "0000000000000005",
                "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
                "68656c6c6f",
            ),
        },
        GoldenVector {
            name: "container keeps insertion order and empty entries",
            input: VectorInput::Container {
                entries: vec![("payload", &b""[..]), ("bundle.id", &b"xyz"[..])],
            },
            expected_hex: concat!(
                "424e444c01",
                "0002",
                "0007", "7061796c6f6164",
                "0000000000000000",
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                "0009", "62756e646c652e6964",
                "0000000000000003",
                "3608bca1e44ea6c4d268eb6db02260269892c0b42b86bbf1e77a6fa16c3c9282",
                "78797a",
            ),
        },
        GoldenVector {
            name: "upstream bundle id",
            input: VectorInput::BundleId {
                peer_byte: 0x11,
                counter: 258,
                direction: Direction::Upstream,
            },
            expected_hex: concat!(
                "01",
                "1111111111111111111111111111111111111111111111111111111111111111",
                "0000000000000102",
            ),
        },
        GoldenVector {
            name: "first downstream bundle id",
            input: VectorInput::BundleId {
                peer_byte: 0xab,
                counter: 1,
                direction: Direction::Downstream,
            },
            expected_hex: concat!(
                "02",
                "abababababababababababababababababababababababababababababababab",
                "0000000000000001",
            ),
        },
    ]
}

/// Encode every vector and compare with its expected bytes.
///
/// Returns `(name, matches, actual_hex)` per vector.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    all_vectors()
        .iter()
        .map(|v| {
            let hex = hex::encode(v.encode());
            (v.name.to_string(), hex == v.expected_hex, hex)
        })
        .collect()
}

/// All vectors with their expected output, for other implementations.
pub fn vectors_json() -> serde_json::Result<String> {
    serde_json::to_string_pretty(&all_vectors())
}
