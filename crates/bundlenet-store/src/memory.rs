//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use bundlenet_core::{Adu, AppId, Direction, EncryptedBundleId, PeerId, SignedRecencyBlob};

use crate::error::{Result, StoreError};
use crate::traits::{
    AbsorbedBundle, BundleCounters, CursorKind, InsertResult, LedgerCursor, LedgerSide, SentBundle,
    Store,
};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Ledger cursors by (peer, app).
    cursors: BTreeMap<(PeerId, AppId), LedgerCursor>,

    /// ADU bytes by (side, peer, app) then seq.
    adus: HashMap<(LedgerSide, PeerId, AppId), BTreeMap<u64, Bytes>>,

    counters: HashMap<(PeerId, Direction), BundleCounters>,

    /// Window entries by (peer, direction) then counter.
    sent: HashMap<(PeerId, Direction), BTreeMap<u64, SentBundle>>,

    received_ids: HashSet<EncryptedBundleId>,

    sessions: HashMap<PeerId, Vec<u8>>,

    spool: HashMap<Direction, BTreeMap<EncryptedBundleId, Bytes>>,

    routes: HashMap<PeerId, BTreeSet<PeerId>>,

    recency_blob: Option<SignedRecencyBlob>,

    relay_recency: BTreeMap<PeerId, i64>,
}

impl MemoryStoreInner {
    fn insert_received(&mut self, adu: &Adu) -> InsertResult {
        let cursor = self.cursors.entry((adu.peer, adu.app.clone())).or_default();
        if adu.seq <= cursor.last_received {
            return InsertResult::AlreadyExists;
        }
        if adu.seq > cursor.last_received + 1 {
            warn!(
                peer = %adu.peer,
                app = %adu.app,
                expected = cursor.last_received + 1,
                got = adu.seq,
                "gap in received ADU sequence"
            );
        }
        cursor.last_received = adu.seq;
        self.adus
            .entry((LedgerSide::Receive, adu.peer, adu.app.clone()))
            .or_default()
            .insert(adu.seq, adu.data.clone());
        InsertResult::Inserted
    }

    fn record_received(
        &mut self,
        peer: &PeerId,
        direction: Direction,
        counter: u64,
        id: &EncryptedBundleId,
        carried_adus: bool,
    ) -> bool {
        self.received_ids.insert(id.clone());
        let counters = self.counters.entry((*peer, direction)).or_default();
        if carried_adus {
            counters.last_received_data_counter = counters.last_received_data_counter.max(counter);
        }
        if counter <= counters.last_received_counter {
            return false;
        }
        counters.last_received_counter = counter;
        counters.last_received_id = Some(id.clone());
        true
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner.write().map_err(|_| StoreError::LockPoisoned)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_adu(&self, peer: &PeerId, app: &AppId, data: Bytes) -> Result<Adu> {
        let mut inner = self.write()?;
        let cursor = inner.cursors.entry((*peer, app.clone())).or_default();
        cursor.last_added += 1;
        let seq = cursor.last_added;
        inner
            .adus
            .entry((LedgerSide::Send, *peer, app.clone()))
            .or_default()
            .insert(seq, data.clone());
        Ok(Adu::new(*peer, app.clone(), seq, data))
    }

    async fn insert_received_adu(&self, adu: &Adu) -> Result<InsertResult> {
        Ok(self.write()?.insert_received(adu))
    }

    async fn read_adus(
        &self,
        side: LedgerSide,
        peer: &PeerId,
        app: &AppId,
        from: u64,
        to: u64,
        limit: usize,
    ) -> Result<Vec<Adu>> {
        if from > to {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let Some(log) = inner.adus.get(&(side, *peer, app.clone())) else {
            return Ok(Vec::new());
        };
        Ok(log
            .range(from..=to)
            .take(limit)
            .map(|(seq, data)| Adu::new(*peer, app.clone(), *seq, data.clone()))
            .collect())
    }

    async fn get_cursor(&self, peer: &PeerId, app: &AppId) -> Result<Option<LedgerCursor>> {
        Ok(self.read()?.cursors.get(&(*peer, app.clone())).copied())
    }

    async fn advance_cursor(
        &self,
        peer: &PeerId,
        app: &AppId,
        kind: CursorKind,
        up_to: u64,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        let cursor = inner.cursors.entry((*peer, app.clone())).or_default();
        let (slot, bound) = match kind {
            CursorKind::Sent => (&mut cursor.last_sent, cursor.last_added),
            CursorKind::Received => (&mut cursor.last_received, u64::MAX),
            CursorKind::Processed => (&mut cursor.last_processed, cursor.last_received),
        };
        let target = up_to.min(bound);
        if target <= *slot {
            return Ok(false);
        }
        *slot = target;
        Ok(true)
    }

    async fn delete_adus_up_to(
        &self,
        side: LedgerSide,
        peer: &PeerId,
        app: &AppId,
        up_to: u64,
    ) -> Result<u64> {
        let mut inner = self.write()?;
        let Some(cursor) = inner.cursors.get(&(*peer, app.clone())).copied() else {
            return Ok(0);
        };
        let bound = match side {
            LedgerSide::Send => cursor.last_sent,
            LedgerSide::Receive => cursor.last_processed,
        };
        let limit = up_to.min(bound);
        let Some(log) = inner.adus.get_mut(&(side, *peer, app.clone())) else {
            return Ok(0);
        };
        let keep = log.split_off(&limit.saturating_add(1));
        let removed = log.len() as u64;
        *log = keep;
        Ok(removed)
    }

    async fn list_peer_apps(&self) -> Result<Vec<(PeerId, AppId)>> {
        Ok(self.read()?.cursors.keys().cloned().collect())
    }

    async fn get_counters(&self, peer: &PeerId, direction: Direction) -> Result<BundleCounters> {
        Ok(self
            .read()?
            .counters
            .get(&(*peer, direction))
            .cloned()
            .unwrap_or_default())
    }

    async fn record_sent_bundle(&self, bundle: &SentBundle) -> Result<()> {
        let mut inner = self.write()?;
        let key = (bundle.peer, bundle.direction);
        let counters = inner.counters.entry(key).or_default();
        counters.last_sent_counter = counters.last_sent_counter.max(bundle.counter);
        counters.last_sent_id = Some(bundle.encrypted_id.clone());
        counters.last_sent_ack = bundle.ack;
        inner
            .sent
            .entry(key)
            .or_default()
            .insert(bundle.counter, bundle.clone());
        Ok(())
    }

    async fn record_received_bundle(
        &self,
        peer: &PeerId,
        direction: Direction,
        counter: u64,
        id: &EncryptedBundleId,
        carried_adus: bool,
    ) -> Result<bool> {
        Ok(self
            .write()?
            .record_received(peer, direction, counter, id, carried_adus))
    }

    async fn absorb_bundle(&self, bundle: &AbsorbedBundle) -> Result<usize> {
        // One write guard covers every change below and nothing in it can fail.
        let mut inner = self.write()?;
        inner.sessions.insert(bundle.peer, bundle.session.clone());
        let mut inserted = 0;
        for adu in &bundle.adus {
            if inner.insert_received(adu) == InsertResult::Inserted {
                inserted += 1;
            }
        }
        inner.record_received(
            &bundle.peer,
            bundle.direction,
            bundle.counter,
            &bundle.encrypted_id,
            !bundle.adus.is_empty(),
        );
        Ok(inserted)
    }

    async fn outstanding_bundles(
        &self,
        peer: &PeerId,
        direction: Direction,
    ) -> Result<Vec<SentBundle>> {
        Ok(self
            .read()?
            .sent
            .get(&(*peer, direction))
            .map(|w| w.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_acknowledged(
        &self,
        peer: &PeerId,
        direction: Direction,
        up_to: u64,
    ) -> Result<Vec<SentBundle>> {
        let mut inner = self.write()?;
        let Some(window) = inner.sent.get_mut(&(*peer, direction)) else {
            return Ok(Vec::new());
        };
        let keep = window.split_off(&(up_to.saturating_add(1)));
        let acked = std::mem::replace(window, keep);
        Ok(acked.into_values().collect())
    }

    async fn has_received_bundle(&self, id: &EncryptedBundleId) -> Result<bool> {
        Ok(self.read()?.received_ids.contains(id))
    }

    async fn load_session(&self, peer: &PeerId) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.sessions.get(peer).cloned())
    }

    async fn save_session(&self, peer: &PeerId, state: &[u8]) -> Result<()> {
        self.write()?.sessions.insert(*peer, state.to_vec());
        Ok(())
    }

    async fn spool_put(
        &self,
        direction: Direction,
        id: &EncryptedBundleId,
        data: Bytes,
    ) -> Result<()> {
        self.write()?
            .spool
            .entry(direction)
            .or_default()
            .insert(id.clone(), data);
        Ok(())
    }

    async fn spool_get(
        &self,
        direction: Direction,
        id: &EncryptedBundleId,
    ) -> Result<Option<Bytes>> {
        Ok(self
            .read()?
            .spool
            .get(&direction)
            .and_then(|s| s.get(id).cloned()))
    }

    async fn spool_delete(&self, direction: Direction, id: &EncryptedBundleId) -> Result<bool> {
        Ok(self
            .write()?
            .spool
            .get_mut(&direction)
            .map_or(false, |s| s.remove(id).is_some()))
    }

    async fn spool_list(&self, direction: Direction) -> Result<Vec<EncryptedBundleId>> {
        Ok(self
            .read()?
            .spool
            .get(&direction)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_route(&self, relay: &PeerId, peer: &PeerId) -> Result<()> {
        self.write()?.routes.entry(*relay).or_default().insert(*peer);
        Ok(())
    }

    async fn routes_for(&self, relay: &PeerId) -> Result<Vec<PeerId>> {
        Ok(self
            .read()?
            .routes
            .get(relay)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn put_recency_blob(&self, blob: &SignedRecencyBlob) -> Result<()> {
        let mut inner = self.write()?;
        let newer = inner
            .recency_blob
            .as_ref()
            .map_or(true, |cur| blob.blob.timestamp_ms > cur.blob.timestamp_ms);
        if newer {
            inner.recency_blob = Some(blob.clone());
        }
        Ok(())
    }

    async fn get_recency_blob(&self) -> Result<Option<SignedRecencyBlob>> {
        Ok(self.read()?.recency_blob.clone())
    }

    async fn record_relay_recency(&self, relay: &PeerId, timestamp_ms: i64) -> Result<()> {
        let mut inner = self.write()?;
        let slot = inner.relay_recency.entry(*relay).or_insert(timestamp_ms);
        *slot = (*slot).max(timestamp_ms);
        Ok(())
    }

    async fn list_relay_recency(&self) -> Result<Vec<(PeerId, i64)>> {
        Ok(self
            .read()?
            .relay_recency
            .iter()
            .map(|(relay, ts)| (*relay, *ts))
            .collect())
    }
}

/// Shared contract tests, run against both stores.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use bundlenet_core::{sign_recency_blob, Keypair};

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 32])
    }

    fn mail() -> AppId {
        AppId::new("mail").unwrap()
    }

    fn eid(s: &str) -> EncryptedBundleId {
        EncryptedBundleId::parse(s).unwrap()
    }

    pub async fn append_is_dense<S: Store>(store: &S) {
        for expected in 1..=5u64 {
            let adu = store
                .append_adu(&peer(1), &mail(), Bytes::from(vec![expected as u8]))
                .await
                .unwrap();
            assert_eq!(adu.seq, expected);
        }
        // Independent per (peer, app).
        let other = store
            .append_adu(&peer(2), &mail(), Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(other.seq, 1);

        let adus = store
            .read_adus(LedgerSide::Send, &peer(1), &mail(), 2, 4, 100)
            .await
            .unwrap();
        assert_eq!(adus.iter().map(|a| a.seq).collect::<Vec<_>>(), vec![2, 3, 4]);
        let limited = store
            .read_adus(LedgerSide::Send, &peer(1), &mail(), 1, 5, 2)
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        let cursor = store.get_cursor(&peer(1), &mail()).await.unwrap().unwrap();
        assert_eq!(cursor.last_added, 5);

        let mut pairs = store.list_peer_apps().await.unwrap();
        pairs.sort();
        assert_eq!(pairs, vec![(peer(1), mail()), (peer(2), mail())]);
    }

    pub async fn cursors_are_monotonic<S: Store>(store: &S) {
        for _ in 0..3 {
            store.append_adu(&peer(1), &mail(), Bytes::new()).await.unwrap();
        }
        assert!(store.advance_cursor(&peer(1), &mail(), CursorKind::Sent, 2).await.unwrap());
        assert!(!store.advance_cursor(&peer(1), &mail(), CursorKind::Sent, 2).await.unwrap());
        assert!(!store.advance_cursor(&peer(1), &mail(), CursorKind::Sent, 1).await.unwrap());
        // Clamped to last_added.
        assert!(store.advance_cursor(&peer(1), &mail(), CursorKind::Sent, 99).await.unwrap());
        let cursor = store.get_cursor(&peer(1), &mail()).await.unwrap().unwrap();
        assert_eq!(cursor.last_sent, 3);

        // Processed cannot pass received.
        assert!(!store
            .advance_cursor(&peer(1), &mail(), CursorKind::Processed, 5)
            .await
            .unwrap());
    }

    pub async fn received_adus_dedup<S: Store>(store: &S) {
        let adu = Adu::new(peer(3), mail(), 1, Bytes::from_static(b"hello"));
        assert_eq!(store.insert_received_adu(&adu).await.unwrap(), InsertResult::Inserted);
        assert_eq!(
            store.insert_received_adu(&adu).await.unwrap(),
            InsertResult::AlreadyExists
        );
        let cursor = store.get_cursor(&peer(3), &mail()).await.unwrap().unwrap();
        assert_eq!(cursor.last_received, 1);
        assert_eq!(cursor.last_added, 0);
    }

    pub async fn delete_is_bounded_and_idempotent<S: Store>(store: &S) {
        for _ in 0..4 {
            store.append_adu(&peer(1), &mail(), Bytes::new()).await.unwrap();
        }
        // Nothing acknowledged yet: nothing can go.
        assert_eq!(
            store.delete_adus_up_to(LedgerSide::Send, &peer(1), &mail(), 4).await.unwrap(),
            0
        );
        store.advance_cursor(&peer(1), &mail(), CursorKind::Sent, 3).await.unwrap();
        assert_eq!(
            store.delete_adus_up_to(LedgerSide::Send, &peer(1), &mail(), 4).await.unwrap(),
            3
        );
        assert_eq!(
            store.delete_adus_up_to(LedgerSide::Send, &peer(1), &mail(), 4).await.unwrap(),
            0
        );
        let left = store
            .read_adus(LedgerSide::Send, &peer(1), &mail(), 1, u64::MAX, 10)
            .await
            .unwrap();
        assert_eq!(left.iter().map(|a| a.seq).collect::<Vec<_>>(), vec![4]);
    }

    pub async fn window_and_counters<S: Store>(store: &S) {
        for counter in 1..=3u64 {
            store
                .record_sent_bundle(&SentBundle {
                    peer: peer(1),
                    direction: Direction::Upstream,
                    counter,
                    encrypted_id: eid(&format!("id{counter}")),
                    ack: counter * 10,
                    ranges: Vec::new(),
                    created_at: 0,
                })
                .await
                .unwrap();
        }
        let counters = store.get_counters(&peer(1), Direction::Upstream).await.unwrap();
        assert_eq!(counters.last_sent_counter, 3);
        assert_eq!(counters.last_sent_id, Some(eid("id3")));
        assert_eq!(counters.last_sent_ack, 30);

        let acked = store
            .remove_acknowledged(&peer(1), Direction::Upstream, 2)
            .await
            .unwrap();
        assert_eq!(acked.iter().map(|b| b.counter).collect::<Vec<_>>(), vec![1, 2]);
        let left = store.outstanding_bundles(&peer(1), Direction::Upstream).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].counter, 3);

        assert!(store
            .record_received_bundle(&peer(1), Direction::Downstream, 4, &eid("in4"), false)
            .await
            .unwrap());
        assert!(!store
            .record_received_bundle(&peer(1), Direction::Downstream, 2, &eid("in2"), true)
            .await
            .unwrap());
        assert!(store.has_received_bundle(&eid("in2")).await.unwrap());
        assert!(!store.has_received_bundle(&eid("in9")).await.unwrap());
        let counters = store.get_counters(&peer(1), Direction::Downstream).await.unwrap();
        assert_eq!(counters.last_received_counter, 4);
        assert_eq!(counters.last_received_id, Some(eid("in4")));
        assert_eq!(counters.last_received_data_counter, 2);
    }

    pub fn absorbed(counter: u64, seqs: std::ops::RangeInclusive<u64>) -> AbsorbedBundle {
        AbsorbedBundle {
            peer: peer(7),
            direction: Direction::Upstream,
            counter,
            encrypted_id: eid(&format!("up{counter}")),
            session: format!("session-{counter}").into_bytes(),
            adus: seqs
                .map(|seq| Adu::new(peer(7), mail(), seq, Bytes::from(vec![seq as u8])))
                .collect(),
        }
    }

    pub async fn absorb_applies_everything<S: Store>(store: &S) {
        assert_eq!(store.absorb_bundle(&absorbed(1, 1..=3)).await.unwrap(), 3);
        let cursor = store.get_cursor(&peer(7), &mail()).await.unwrap().unwrap();
        assert_eq!(cursor.last_received, 3);
        let counters = store.get_counters(&peer(7), Direction::Upstream).await.unwrap();
        assert_eq!(counters.last_received_counter, 1);
        assert_eq!(counters.last_received_data_counter, 1);
        assert!(store.has_received_bundle(&eid("up1")).await.unwrap());
        assert_eq!(
            store.load_session(&peer(7)).await.unwrap(),
            Some(b"session-1".to_vec())
        );

        // A later bundle repeating ADUs only adds the new ones.
        assert_eq!(store.absorb_bundle(&absorbed(2, 2..=5)).await.unwrap(), 2);
        let adus = store
            .read_adus(LedgerSide::Receive, &peer(7), &mail(), 1, u64::MAX, 10)
            .await
            .unwrap();
        assert_eq!(adus.iter().map(|a| a.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        // Ack-only bundles move the counter but not the data counter.
        assert_eq!(store.absorb_bundle(&absorbed(3, 1..=0)).await.unwrap(), 0);
        let counters = store.get_counters(&peer(7), Direction::Upstream).await.unwrap();
        assert_eq!(counters.last_received_counter, 3);
        assert_eq!(counters.last_received_data_counter, 2);
    }

    pub async fn spool_routes_sessions<S: Store>(store: &S) {
        store
            .spool_put(Direction::Upstream, &eid("a"), Bytes::from_static(b"1"))
            .await
            .unwrap();
        store
            .spool_put(Direction::Downstream, &eid("b"), Bytes::from_static(b"2"))
            .await
            .unwrap();
        assert_eq!(store.spool_list(Direction::Upstream).await.unwrap(), vec![eid("a")]);
        assert_eq!(
            store.spool_get(Direction::Downstream, &eid("b")).await.unwrap(),
            Some(Bytes::from_static(b"2"))
        );
        assert!(store.spool_get(Direction::Upstream, &eid("b")).await.unwrap().is_none());
        assert!(store.spool_delete(Direction::Upstream, &eid("a")).await.unwrap());
        assert!(!store.spool_delete(Direction::Upstream, &eid("a")).await.unwrap());

        store.add_route(&peer(9), &peer(1)).await.unwrap();
        store.add_route(&peer(9), &peer(1)).await.unwrap();
        store.add_route(&peer(9), &peer(2)).await.unwrap();
        let mut routed = store.routes_for(&peer(9)).await.unwrap();
        routed.sort();
        assert_eq!(routed, vec![peer(1), peer(2)]);

        assert!(store.load_session(&peer(1)).await.unwrap().is_none());
        store.save_session(&peer(1), b"state-1").await.unwrap();
        store.save_session(&peer(1), b"state-2").await.unwrap();
        assert_eq!(store.load_session(&peer(1)).await.unwrap(), Some(b"state-2".to_vec()));
    }

    pub async fn recency_records<S: Store>(store: &S) {
        let backend = Keypair::from_seed(&[1; 32]);
        let newer = sign_recency_blob(&backend, 2, 2_000);
        let older = sign_recency_blob(&backend, 1, 1_000);
        store.put_recency_blob(&newer).await.unwrap();
        store.put_recency_blob(&older).await.unwrap();
        assert_eq!(store.get_recency_blob().await.unwrap(), Some(newer));

        store.record_relay_recency(&peer(5), 10).await.unwrap();
        store.record_relay_recency(&peer(5), 5).await.unwrap();
        assert_eq!(store.list_relay_recency().await.unwrap(), vec![(peer(5), 10)]);
    }
}
