//! Relay inventory reconciliation.

use std::collections::{BTreeSet, HashSet};

use bundlenet_core::EncryptedBundleId;

use crate::messages::{InventoryRequest, InventoryResponse};

/// Decide what a relay should do with the bundles it holds.
///
/// `absorbed` is the subset of the relay's upstream ids the backend has
/// already processed. `wanted_downstream` is every downstream bundle the
/// backend still wants delivered to endpoints routed through this relay.
///
/// Each output list is sorted and free of duplicates.
pub fn reconcile(
    request: &InventoryRequest,
    absorbed: &HashSet<EncryptedBundleId>,
    wanted_downstream: &BTreeSet<EncryptedBundleId>,
) -> InventoryResponse {
    let held_up: BTreeSet<&EncryptedBundleId> = request.held_upstream.iter().collect();
    let held_down: BTreeSet<&EncryptedBundleId> = request.held_downstream.iter().collect();

    let mut to_delete = BTreeSet::new();
    let mut to_download = BTreeSet::new();
    for id in &held_up {
        if absorbed.contains(*id) {
            to_delete.insert((*id).clone());
        } else {
            to_download.insert((*id).clone());
        }
    }
    for id in &held_down {
        if !wanted_downstream.contains(*id) {
            to_delete.insert((*id).clone());
        }
    }
    let to_upload = wanted_downstream
        .iter()
        .filter(|id| !held_down.contains(id))
        .cloned()
        .collect::<Vec<_>>();

    InventoryResponse {
        to_delete: to_delete.into_iter().collect(),
        to_download: to_download.into_iter().collect(),
        to_upload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlenet_core::PeerId;

    fn eid(s: &str) -> EncryptedBundleId {
        EncryptedBundleId::parse(s).unwrap()
    }

    fn request(up: &[&str], down: &[&str]) -> InventoryRequest {
        InventoryRequest {
            relay: PeerId::from_bytes([7; 32]),
            held_upstream: up.iter().map(|s| eid(s)).collect(),
            held_downstream: down.iter().map(|s| eid(s)).collect(),
        }
    }

    #[test]
    fn test_absorbed_deleted_and_unseen_forwarded() {
        let absorbed = HashSet::from([eid("X")]);
        let wanted = BTreeSet::from([eid("Z")]);
        let plan = reconcile(&request(&["X", "Y"], &["Z"]), &absorbed, &wanted);
        assert_eq!(plan.to_delete, vec![eid("X")]);
        assert_eq!(plan.to_download, vec![eid("Y")]);
        assert!(plan.to_upload.is_empty());
    }

    #[test]
    fn test_stale_downstream_deleted_and_missing_fetched() {
        let wanted = BTreeSet::from([eid("B"), eid("C")]);
        let plan = reconcile(&request(&[], &["A", "B"]), &HashSet::new(), &wanted);
        assert_eq!(plan.to_delete, vec![eid("A")]);
        assert!(plan.to_download.is_empty());
        assert_eq!(plan.to_upload, vec![eid("C")]);
    }

    #[test]
    fn test_empty_inventory() {
        let plan = reconcile(&request(&[], &[]), &HashSet::new(), &BTreeSet::new());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_repeated_ids_collapse() {
        let plan = reconcile(&request(&["Y", "Y"], &[]), &HashSet::new(), &BTreeSet::new());
        assert_eq!(plan.to_download, vec![eid("Y")]);
    }
}
