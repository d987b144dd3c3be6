//! Acknowledgement and window engine.
//!
//! The window is the set of bundles sent to a peer in one direction and not
//! yet acknowledged. Acks are cumulative bundle counters. When one arrives,
//! every window entry at or below it is dropped. The ADU ranges of the
//! acknowledged bundle itself are then marked sent and reclaimed.

use std::sync::Arc;

use tracing::debug;

use bundlenet_core::{Direction, EncryptedBundleId, PeerId, HEARTBEAT_ACK};
use bundlenet_store::{Ledger, LedgerSide, SentBundle, Store};

use crate::error::Result;

/// What an incoming ack released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Window entries removed.
    pub released: Vec<SentBundle>,
    /// ADUs physically reclaimed from the send ledger.
    pub reclaimed_adus: u64,
}

/// Window bookkeeping over a store.
pub struct WindowEngine<S: Store> {
    store: Arc<S>,
    ledger: Ledger<S>,
}

impl<S: Store> WindowEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            ledger: Ledger::new(store.clone()),
            store,
        }
    }

    /// Counter for the next bundle to `peer` in `direction`.
    pub async fn next_send_counter(&self, peer: &PeerId, direction: Direction) -> Result<u64> {
        let counters = self.store.get_counters(peer, direction).await?;
        Ok(counters.last_sent_counter + 1)
    }

    /// Put a freshly built bundle in the window.
    pub async fn record_sent(&self, bundle: &SentBundle) -> Result<()> {
        self.store.record_sent_bundle(bundle).await?;
        Ok(())
    }

    /// Unacknowledged bundles in counter order.
    pub async fn outstanding(&self, peer: &PeerId, direction: Direction) -> Result<Vec<SentBundle>> {
        Ok(self.store.outstanding_bundles(peer, direction).await?)
    }

    /// Whether a bundle at `counter` from `peer` was already processed.
    pub async fn is_duplicate(&self, peer: &PeerId, direction: Direction, counter: u64) -> Result<bool> {
        let counters = self.store.get_counters(peer, direction).await?;
        Ok(counter <= counters.last_received_counter)
    }

    /// Remember a received bundle. Returns whether it raised the counter.
    pub async fn record_received(
        &self,
        peer: &PeerId,
        direction: Direction,
        counter: u64,
        id: &EncryptedBundleId,
        carried_adus: bool,
    ) -> Result<bool> {
        Ok(self
            .store
            .record_received_bundle(peer, direction, counter, id, carried_adus)
            .await?)
    }

    /// Whether `peer` has sent data we have not yet acknowledged.
    ///
    /// Acks for ack-only bundles are never owed, so two idle sides do not
    /// keep acknowledging each other's acks.
    pub async fn owes_ack(&self, peer: &PeerId, inbound: Direction, last_sent_ack: u64) -> Result<bool> {
        let counters = self.store.get_counters(peer, inbound).await?;
        Ok(counters.last_received_data_counter > last_sent_ack)
    }

    /// The ack to piggy-back on the next bundle to `peer`.
    pub async fn ack_to_send(&self, peer: &PeerId, inbound: Direction) -> Result<u64> {
        Ok(self
            .store
            .get_counters(peer, inbound)
            .await?
            .last_received_counter)
    }

    /// Apply an ack for bundles we sent in `direction`.
    ///
    /// Only the bundle whose counter equals the ack is known to have been
    /// received; earlier window entries are dropped but their ranges are not
    /// marked sent, since the next bundle carries them again anyway.
    pub async fn on_ack_received(
        &self,
        peer: &PeerId,
        direction: Direction,
        ack: u64,
    ) -> Result<AckOutcome> {
        if ack == HEARTBEAT_ACK {
            return Ok(AckOutcome::default());
        }
        let released = self.store.remove_acknowledged(peer, direction, ack).await?;
        let mut reclaimed_adus = 0;

        if let Some(confirmed) = released.iter().find(|b| b.counter == ack) {
            for range in &confirmed.ranges {
                self.ledger.advance_sent(peer, &range.app, range.to).await?;
                reclaimed_adus += self
                    .ledger
                    .delete_up_to(LedgerSide::Send, peer, &range.app, range.to)
                    .await?;
            }
        }
        for bundle in &released {
            self.store.spool_delete(direction, &bundle.encrypted_id).await?;
        }

        if !released.is_empty() {
            debug!(
                peer = %peer,
                ?direction,
                ack,
                released = released.len(),
                reclaimed_adus,
                "window advanced"
            );
        }
        Ok(AckOutcome {
            released,
            reclaimed_adus,
        })
    }
}
