//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use proptest::prelude::*;

use bundlenet_core::{Adu, AppId, BundleId, BundlePayload, Direction, PeerId};

/// Generate a random PeerId.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 32]>().prop_map(PeerId::from_bytes)
}

pub fn direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Upstream), Just(Direction::Downstream)]
}

/// Generate a valid application id.
pub fn app_id() -> impl Strategy<Value = AppId> {
    "[a-z][a-z0-9._+-]{0,15}".prop_map(|s| AppId::new(s).expect("pattern yields valid ids"))
}

/// Generate a bundle counter (1-indexed).
pub fn counter() -> impl Strategy<Value = u64> {
    1u64..=u64::MAX
}

pub fn bundle_id() -> impl Strategy<Value = BundleId> {
    (peer_id(), counter(), direction()).prop_map(|(peer, counter, direction)| {
        BundleId::new(peer, counter, direction)
    })
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// ADUs for `peer` over a few apps, each app's sequence numbers contiguous
/// from a random start.
pub fn adu_batch(peer: PeerId, max_per_app: usize) -> impl Strategy<Value = Vec<Adu>> {
    prop::collection::btree_map(
        app_id(),
        (1u64..1_000, prop::collection::vec(payload(64), 1..=max_per_app)),
        0..4,
    )
    .prop_map(move |apps| {
        apps.into_iter()
            .flat_map(|(app, (start, bodies))| {
                bodies
                    .into_iter()
                    .enumerate()
                    .map(move |(i, body)| Adu::new(peer, app.clone(), start + i as u64, body))
            })
            .collect()
    })
}

/// A decrypted bundle payload as an endpoint would build it.
pub fn bundle_payload() -> impl Strategy<Value = BundlePayload> {
    (peer_id(), 1u64..10_000, 0u64..10_000)
        .prop_flat_map(|(peer, counter, ack)| {
            adu_batch(peer, 8).prop_map(move |adus| {
                BundlePayload::new(BundleId::new(peer, counter, Direction::Upstream), ack, adus)
            })
        })
}

/// Named container entries with unique names.
pub fn container_entries() -> impl Strategy<Value = Vec<(String, Vec<u8>)>> {
    prop::collection::btree_map("[a-z][a-z0-9./_-]{0,23}", payload(256), 0..8)
        .prop_map(|entries: BTreeMap<String, Vec<u8>>| entries.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlenet_core::{compare, pack, unpack, BUNDLE_ID_LEN};
    use std::cmp::Ordering;

    proptest! {
        #[test]
        fn test_bundle_id_layout(id in bundle_id()) {
            let bytes = id.encode();
            prop_assert_eq!(bytes.len(), BUNDLE_ID_LEN);
            prop_assert_eq!(bytes[0], id.direction as u8);
            prop_assert_eq!(&bytes[33..], &id.counter.to_be_bytes()[..]);
        }

        #[test]
        fn test_compare_follows_counter(peer in peer_id(), a in counter(), b in counter()) {
            let x = BundleId::new(peer, a, Direction::Downstream);
            let y = BundleId::new(peer, b, Direction::Downstream);
            prop_assert_eq!(compare(&x, &y, Direction::Downstream).unwrap(), a.cmp(&b));
            prop_assert!(compare(&x, &y, Direction::Upstream).is_err());
        }

        #[test]
        fn test_payload_ranges_cover_every_adu(payload in bundle_payload()) {
            let ranges = payload.ranges();
            for adu in &payload.adus {
                let (from, to) = ranges[&adu.app];
                prop_assert!(from <= adu.seq && adu.seq <= to);
            }
            let sorted = payload
                .adus
                .windows(2)
                .all(|w| (&w[0].app, w[0].seq).cmp(&(&w[1].app, w[1].seq)) == Ordering::Less);
            prop_assert!(sorted);
        }

        #[test]
        fn test_any_flipped_byte_is_caught(entries in container_entries(), pick in any::<prop::sample::Index>()) {
            let mut bytes = pack(entries.iter().map(|(n, d)| (n.clone(), d.clone()))).unwrap();
            let i = pick.index(bytes.len());
            bytes[i] ^= 0x80;
            prop_assert!(unpack(&bytes).is_err());
        }
    }
}
