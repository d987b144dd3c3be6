//! Store trait: the abstract interface for node persistence.
//!
//! Everything a node persists goes through this trait: the ADU ledger, the
//! per-direction bundle counters and window, session blobs, the bundle spool,
//! relay routes and recency records. Implementations include SQLite
//! (primary) and in-memory (for tests).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use bundlenet_core::{Adu, AppId, Direction, EncryptedBundleId, PeerId, SignedRecencyBlob};

use crate::error::Result;

/// Result of inserting a received ADU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// Already received earlier (idempotent - not an error).
    AlreadyExists,
}

/// Which half of the ledger an ADU lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LedgerSide {
    /// Outbound ADUs enqueued locally for the peer.
    Send = 1,
    /// Inbound ADUs received from the peer.
    Receive = 2,
}

impl LedgerSide {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Send),
            2 => Some(Self::Receive),
            _ => None,
        }
    }
}

/// One of the monotonic cursors that can be advanced explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    /// Highest outbound seq the peer has acknowledged.
    Sent,
    /// Highest inbound seq stored.
    Received,
    /// Highest inbound seq handed to the application.
    Processed,
}

/// Ledger cursors for one (peer, app) pair.
///
/// `last_sent <= last_added` and `last_processed <= last_received` always
/// hold; no counter ever decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCursor {
    pub last_added: u64,
    pub last_sent: u64,
    pub last_received: u64,
    pub last_processed: u64,
}

/// Inclusive ADU sequence range for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AduRange {
    pub app: AppId,
    pub from: u64,
    pub to: u64,
}

/// A bundle we built and are waiting to see acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentBundle {
    pub peer: PeerId,
    pub direction: Direction,
    pub counter: u64,
    pub encrypted_id: EncryptedBundleId,
    /// Ack counter carried by this bundle.
    pub ack: u64,
    pub ranges: Vec<AduRange>,
    pub created_at: i64,
}

/// Everything one accepted inbound bundle changes.
///
/// Applied by [`Store::absorb_bundle`] as a unit: either the session, every
/// ADU and the bundle record are all persisted, or none of them are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbsorbedBundle {
    pub peer: PeerId,
    pub direction: Direction,
    pub counter: u64,
    pub encrypted_id: EncryptedBundleId,
    /// Serialized session state after decrypting the bundle.
    pub session: Vec<u8>,
    pub adus: Vec<Adu>,
}

/// Persisted bundle counters for one (peer, direction).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleCounters {
    pub last_sent_counter: u64,
    pub last_sent_id: Option<EncryptedBundleId>,
    /// Ack carried by the last bundle built.
    pub last_sent_ack: u64,
    pub last_received_counter: u64,
    pub last_received_id: Option<EncryptedBundleId>,
    /// Highest received counter whose bundle carried ADUs.
    pub last_received_data_counter: u64,
}

/// The Store trait: async interface for node persistence.
///
/// Each method is atomic on its own; `absorb_bundle` is the one method that
/// spans the ledger, the counters and the session together. Cursor advances are single
/// read-modify-write steps under the store's lock, so advances for one
/// (peer, app) pair are linearizable without extra coordination.
///
/// For SQLite, `spawn_blocking` is used internally to avoid blocking the
/// runtime.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ─────────────────────────────────────────────────────────────────────────
    // ADU Ledger
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an outbound ADU, assigning `last_added + 1`.
    async fn append_adu(&self, peer: &PeerId, app: &AppId, data: Bytes) -> Result<Adu>;

    /// Store an inbound ADU at its sender-assigned sequence number.
    ///
    /// Returns `AlreadyExists` for `seq <= last_received`. Advances
    /// `last_received` to `seq`.
    async fn insert_received_adu(&self, adu: &Adu) -> Result<InsertResult>;

    /// Read stored ADUs with `from <= seq <= to`, ordered by seq, at most `limit`.
    async fn read_adus(
        &self,
        side: LedgerSide,
        peer: &PeerId,
        app: &AppId,
        from: u64,
        to: u64,
        limit: usize,
    ) -> Result<Vec<Adu>>;

    async fn get_cursor(&self, peer: &PeerId, app: &AppId) -> Result<Option<LedgerCursor>>;

    /// Advance a cursor to `up_to`.
    ///
    /// Values at or below the current cursor are a no-op. `Sent` is clamped
    /// to `last_added` and `Processed` to `last_received`. Returns whether
    /// the cursor moved.
    async fn advance_cursor(
        &self,
        peer: &PeerId,
        app: &AppId,
        kind: CursorKind,
        up_to: u64,
    ) -> Result<bool>;

    /// Delete ADUs with `seq <= up_to`, bounded by `last_sent` (send side)
    /// or `last_processed` (receive side). Returns the number removed.
    async fn delete_adus_up_to(
        &self,
        side: LedgerSide,
        peer: &PeerId,
        app: &AppId,
        up_to: u64,
    ) -> Result<u64>;

    /// Every (peer, app) pair with a cursor.
    async fn list_peer_apps(&self) -> Result<Vec<(PeerId, AppId)>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Bundle Counters & Window
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_counters(&self, peer: &PeerId, direction: Direction) -> Result<BundleCounters>;

    /// Record a freshly built bundle and make it the last sent for its
    /// (peer, direction).
    async fn record_sent_bundle(&self, bundle: &SentBundle) -> Result<()>;

    /// Record a received bundle id. Raises `last_received_counter` when
    /// `counter` is higher, and `last_received_data_counter` too when the
    /// bundle `carried_adus`. Returns whether `last_received_counter` moved.
    async fn record_received_bundle(
        &self,
        peer: &PeerId,
        direction: Direction,
        counter: u64,
        id: &EncryptedBundleId,
        carried_adus: bool,
    ) -> Result<bool>;

    /// Persist an accepted inbound bundle in one atomic step.
    ///
    /// Saves the session, inserts each ADU with the rules of
    /// [`Store::insert_received_adu`] and records the bundle id as
    /// [`Store::record_received_bundle`] would. If anything fails, nothing
    /// is written, so a retry of the same bundle is not mistaken for a
    /// duplicate. Returns the number of ADUs newly inserted.
    async fn absorb_bundle(&self, bundle: &AbsorbedBundle) -> Result<usize>;

    /// Sent-but-unacknowledged bundles, ordered by counter.
    async fn outstanding_bundles(&self, peer: &PeerId, direction: Direction)
        -> Result<Vec<SentBundle>>;

    /// Remove and return window entries with `counter <= up_to`.
    async fn remove_acknowledged(
        &self,
        peer: &PeerId,
        direction: Direction,
        up_to: u64,
    ) -> Result<Vec<SentBundle>>;

    /// Whether this bundle id was ever recorded as received.
    async fn has_received_bundle(&self, id: &EncryptedBundleId) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    async fn load_session(&self, peer: &PeerId) -> Result<Option<Vec<u8>>>;

    async fn save_session(&self, peer: &PeerId, state: &[u8]) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Bundle Spool
    // ─────────────────────────────────────────────────────────────────────────

    /// Store bundle bytes. Re-putting an id overwrites it.
    async fn spool_put(&self, direction: Direction, id: &EncryptedBundleId, data: Bytes)
        -> Result<()>;

    async fn spool_get(&self, direction: Direction, id: &EncryptedBundleId)
        -> Result<Option<Bytes>>;

    /// Returns whether an entry was removed.
    async fn spool_delete(&self, direction: Direction, id: &EncryptedBundleId) -> Result<bool>;

    async fn spool_list(&self, direction: Direction) -> Result<Vec<EncryptedBundleId>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Routes & Recency
    // ─────────────────────────────────────────────────────────────────────────

    /// Remember that `peer` was reached through `relay`.
    async fn add_route(&self, relay: &PeerId, peer: &PeerId) -> Result<()>;

    async fn routes_for(&self, relay: &PeerId) -> Result<Vec<PeerId>>;

    /// Cache a recency blob unless a newer one is already cached.
    async fn put_recency_blob(&self, blob: &SignedRecencyBlob) -> Result<()>;

    async fn get_recency_blob(&self) -> Result<Option<SignedRecencyBlob>>;

    /// Remember the newest accepted recency timestamp for a relay.
    async fn record_relay_recency(&self, relay: &PeerId, timestamp_ms: i64) -> Result<()>;

    async fn list_relay_recency(&self) -> Result<Vec<(PeerId, i64)>>;
}
