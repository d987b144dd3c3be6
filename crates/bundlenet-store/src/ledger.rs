//! ADU ledger: the per-(peer, app) log view over a [`Store`].
//!
//! The ledger owns sequence assignment and cursor discipline. Readers get a
//! lazy, paged [`AduRangeIter`] that can be restarted to re-read the same
//! range, e.g. when a transfer is retried.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use bundlenet_core::{Adu, AppId, PeerId};

use crate::error::Result;
use crate::traits::{CursorKind, LedgerCursor, LedgerSide, Store};

/// Rows fetched per page by [`AduRangeIter`].
pub const DEFAULT_PAGE_SIZE: usize = 64;

/// Ledger handle over a shared store.
pub struct Ledger<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> Ledger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Append outbound data for `peer`, assigning the next sequence number.
    pub async fn append(&self, peer: &PeerId, app: &AppId, data: impl Into<Bytes>) -> Result<Adu> {
        let adu = self.store.append_adu(peer, app, data.into()).await?;
        debug!(peer = %peer, app = %app, seq = adu.seq, len = adu.len(), "appended ADU");
        Ok(adu)
    }

    /// Lazily read `from..=to` on one side of the ledger.
    pub fn read_range(
        &self,
        side: LedgerSide,
        peer: &PeerId,
        app: &AppId,
        from: u64,
        to: u64,
    ) -> AduRangeIter<S> {
        AduRangeIter {
            store: self.store.clone(),
            side,
            peer: *peer,
            app: app.clone(),
            from,
            to,
            page_size: DEFAULT_PAGE_SIZE,
            next_seq: from,
            buffer: std::collections::VecDeque::new(),
            exhausted: from > to,
        }
    }

    /// Cursor for a pair, zeroed if the pair is unknown.
    pub async fn cursor(&self, peer: &PeerId, app: &AppId) -> Result<LedgerCursor> {
        Ok(self.store.get_cursor(peer, app).await?.unwrap_or_default())
    }

    pub async fn advance_sent(&self, peer: &PeerId, app: &AppId, up_to: u64) -> Result<bool> {
        self.store
            .advance_cursor(peer, app, CursorKind::Sent, up_to)
            .await
    }

    pub async fn advance_received(&self, peer: &PeerId, app: &AppId, up_to: u64) -> Result<bool> {
        self.store
            .advance_cursor(peer, app, CursorKind::Received, up_to)
            .await
    }

    pub async fn advance_processed(&self, peer: &PeerId, app: &AppId, up_to: u64) -> Result<bool> {
        self.store
            .advance_cursor(peer, app, CursorKind::Processed, up_to)
            .await
    }

    /// Reclaim ADU storage up to `up_to`, never past the side's safe cursor.
    pub async fn delete_up_to(
        &self,
        side: LedgerSide,
        peer: &PeerId,
        app: &AppId,
        up_to: u64,
    ) -> Result<u64> {
        let removed = self.store.delete_adus_up_to(side, peer, app, up_to).await?;
        if removed > 0 {
            debug!(peer = %peer, app = %app, ?side, up_to, removed, "reclaimed ADUs");
        }
        Ok(removed)
    }

    pub async fn list_peer_apps(&self) -> Result<Vec<(PeerId, AppId)>> {
        self.store.list_peer_apps().await
    }

    /// Apps with a cursor for one peer.
    pub async fn apps_for(&self, peer: &PeerId) -> Result<Vec<AppId>> {
        Ok(self
            .store
            .list_peer_apps()
            .await?
            .into_iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, app)| app)
            .collect())
    }
}

/// Lazy, finite iterator over a ledger range, fetched a page at a time.
pub struct AduRangeIter<S: Store> {
    store: Arc<S>,
    side: LedgerSide,
    peer: PeerId,
    app: AppId,
    from: u64,
    to: u64,
    page_size: usize,
    next_seq: u64,
    buffer: std::collections::VecDeque<Adu>,
    exhausted: bool,
}

impl<S: Store> AduRangeIter<S> {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Next ADU in sequence order, or `None` at the end of the range.
    pub async fn next(&mut self) -> Result<Option<Adu>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .read_adus(
                    self.side,
                    &self.peer,
                    &self.app,
                    self.next_seq,
                    self.to,
                    self.page_size,
                )
                .await?;
            match page.last() {
                Some(last) if page.len() == self.page_size && last.seq < self.to => {
                    self.next_seq = last.seq + 1;
                }
                _ => self.exhausted = true,
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    /// Rewind to the start of the range.
    pub fn restart(&mut self) {
        self.next_seq = self.from;
        self.buffer.clear();
        self.exhausted = self.from > self.to;
    }

    /// Drain the rest of the range.
    pub async fn collect_all(&mut self) -> Result<Vec<Adu>> {
        let mut out = Vec::new();
        while let Some(adu) = self.next().await? {
            out.push(adu);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use proptest::prelude::*;

    fn pair() -> (PeerId, AppId) {
        (PeerId::from_bytes([7; 32]), AppId::new("mail").unwrap())
    }

    #[tokio::test]
    async fn test_read_range_pages_and_restarts() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()));
        let (peer, app) = pair();
        for i in 0..10u8 {
            ledger.append(&peer, &app, vec![i]).await.unwrap();
        }

        let mut iter = ledger
            .read_range(LedgerSide::Send, &peer, &app, 2, 8)
            .with_page_size(3);
        let first = iter.collect_all().await.unwrap();
        assert_eq!(first.iter().map(|a| a.seq).collect::<Vec<_>>(), (2..=8).collect::<Vec<_>>());
        assert!(iter.next().await.unwrap().is_none());

        iter.restart();
        let again = iter.collect_all().await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_empty_and_inverted_ranges() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()));
        let (peer, app) = pair();
        let mut iter = ledger.read_range(LedgerSide::Send, &peer, &app, 1, 5);
        assert!(iter.next().await.unwrap().is_none());
        let mut inverted = ledger.read_range(LedgerSide::Send, &peer, &app, 5, 1);
        assert!(inverted.collect_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_advance_is_noop() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()));
        let (peer, app) = pair();
        for _ in 0..3 {
            ledger.append(&peer, &app, Bytes::new()).await.unwrap();
        }
        ledger.advance_sent(&peer, &app, 3).await.unwrap();
        let before = ledger.cursor(&peer, &app).await.unwrap();
        assert!(!ledger.advance_sent(&peer, &app, 1).await.unwrap());
        assert!(!ledger.advance_received(&peer, &app, 0).await.unwrap());
        assert!(!ledger.advance_processed(&peer, &app, 0).await.unwrap());
        assert_eq!(ledger.cursor(&peer, &app).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_apps_for_filters_by_peer() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()));
        let (peer, app) = pair();
        let chat = AppId::new("chat").unwrap();
        ledger.append(&peer, &app, Bytes::new()).await.unwrap();
        ledger.append(&peer, &chat, Bytes::new()).await.unwrap();
        ledger
            .append(&PeerId::from_bytes([8; 32]), &app, Bytes::new())
            .await
            .unwrap();
        let mut apps = ledger.apps_for(&peer).await.unwrap();
        apps.sort();
        assert_eq!(apps, vec![chat, app]);
    }

    proptest! {
        #[test]
        fn prop_append_is_gapless(count in 1usize..40) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let ledger = Ledger::new(Arc::new(MemoryStore::new()));
                let (peer, app) = pair();
                let mut last = 0;
                for _ in 0..count {
                    let adu = ledger.append(&peer, &app, Bytes::new()).await.unwrap();
                    prop_assert_eq!(adu.seq, last + 1);
                    last = adu.seq;
                }
                Ok(())
            })?;
        }
    }
}
