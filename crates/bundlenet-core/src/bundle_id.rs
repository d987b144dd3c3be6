//! Plain bundle identifiers.
//!
//! A bundle id binds the endpoint's peer id, a per-direction counter and the
//! direction of travel. The byte layout is fixed:
//!
//! ```text
//! tag      u8        direction (1 = upstream, 2 = downstream)
//! peer     [u8; 32]  endpoint peer id
//! counter  u64 BE    per (peer, direction) counter, starting at 1
//! ```
//!
//! Plain ids never leave a node; on the wire they are wrapped by the
//! session crate's bundle-id cipher.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{CoreError, Result};
use crate::types::{Direction, PeerId};

/// Encoded length of a plain bundle id.
pub const BUNDLE_ID_LEN: usize = 1 + 32 + 8;

/// A decoded bundle identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleId {
    /// The endpoint of the pairing, in both directions.
    pub peer: PeerId,
    pub counter: u64,
    pub direction: Direction,
}

impl BundleId {
    pub const fn new(peer: PeerId, counter: u64, direction: Direction) -> Self {
        Self {
            peer,
            counter,
            direction,
        }
    }

    pub fn encode(&self) -> [u8; BUNDLE_ID_LEN] {
        encode_bundle_id(&self.peer, self.counter, self.direction)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_bundle_id(bytes)
    }
}

impl fmt::Debug for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BundleId({:?}, {}, #{})",
            self.direction, self.peer, self.counter
        )
    }
}

/// Encode a bundle id into its fixed layout.
pub fn encode_bundle_id(peer: &PeerId, counter: u64, direction: Direction) -> [u8; BUNDLE_ID_LEN] {
    let mut out = [0u8; BUNDLE_ID_LEN];
    out[0] = direction as u8;
    out[1..33].copy_from_slice(peer.as_bytes());
    out[33..].copy_from_slice(&counter.to_be_bytes());
    out
}

/// Decode a bundle id from its fixed layout.
pub fn decode_bundle_id(bytes: &[u8]) -> Result<BundleId> {
    if bytes.len() != BUNDLE_ID_LEN {
        return Err(CoreError::MalformedBundleId(format!(
            "expected {BUNDLE_ID_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let direction = Direction::from_u8(bytes[0])
        .ok_or_else(|| CoreError::MalformedBundleId(format!("unknown tag {}", bytes[0])))?;
    let mut peer = [0u8; 32];
    peer.copy_from_slice(&bytes[1..33]);
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&bytes[33..]);
    Ok(BundleId {
        peer: PeerId::from_bytes(peer),
        counter: u64::from_be_bytes(counter),
        direction,
    })
}

/// Order two ids travelling in `direction` by counter.
///
/// Both ids must carry `direction`; ids from the two directions live in
/// separate counter spaces and are not comparable.
pub fn compare(a: &BundleId, b: &BundleId, direction: Direction) -> Result<Ordering> {
    for id in [a, b] {
        if id.direction != direction {
            return Err(CoreError::DirectionMismatch {
                expected: direction,
            });
        }
    }
    Ok(a.counter.cmp(&b.counter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_bytes([9; 32])
    }

    #[test]
    fn test_layout() {
        let bytes = encode_bundle_id(&peer(), 0x0102, Direction::Downstream);
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..33], &[9; 32]);
        assert_eq!(&bytes[33..], &[0, 0, 0, 0, 0, 0, 1, 2]);
        let id = decode_bundle_id(&bytes).unwrap();
        assert_eq!(id, BundleId::new(peer(), 0x0102, Direction::Downstream));
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(decode_bundle_id(&[1; 10]).is_err());
        let mut bytes = encode_bundle_id(&peer(), 1, Direction::Upstream);
        bytes[0] = 7;
        assert!(matches!(
            decode_bundle_id(&bytes),
            Err(CoreError::MalformedBundleId(_))
        ));
    }

    #[test]
    fn test_compare_is_unsigned() {
        // A high bit in the counter must not flip the order.
        let low = BundleId::new(peer(), 0x7f, Direction::Upstream);
        let high = BundleId::new(peer(), 0x80, Direction::Upstream);
        let huge = BundleId::new(peer(), u64::MAX, Direction::Upstream);
        assert_eq!(compare(&low, &high, Direction::Upstream).unwrap(), Ordering::Less);
        assert_eq!(compare(&huge, &high, Direction::Upstream).unwrap(), Ordering::Greater);
        assert_eq!(compare(&low, &low, Direction::Upstream).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_compare_requires_direction() {
        let up = BundleId::new(peer(), 1, Direction::Upstream);
        let down = BundleId::new(peer(), 1, Direction::Downstream);
        assert!(compare(&up, &down, Direction::Upstream).is_err());
        assert!(compare(&up, &up, Direction::Downstream).is_err());
    }
}
