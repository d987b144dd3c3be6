//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for bundlenet nodes. It uses
//! rusqlite with bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use bundlenet_core::{
    now_millis, Adu, AppId, Direction, EncryptedBundleId, PeerId, SignedRecencyBlob,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    AbsorbedBundle, AduRange, BundleCounters, CursorKind, InsertResult, LedgerCursor, LedgerSide, SentBundle,
    Store,
};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut conn)
        })
        .await?
    }
}

fn peer_from_blob(bytes: Vec<u8>) -> Result<PeerId> {
    PeerId::try_from(bytes.as_slice())
        .map_err(|_| StoreError::InvalidData(format!("peer id of {} bytes", bytes.len())))
}

fn direction_from_sql(v: u8) -> Result<Direction> {
    Direction::from_u8(v).ok_or_else(|| StoreError::InvalidData(format!("direction tag {v}")))
}

fn ensure_cursor(conn: &Connection, peer: &PeerId, app: &AppId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO ledger_cursors (peer, app, updated_at) VALUES (?1, ?2, ?3)",
        params![peer.as_bytes().as_slice(), app.as_str(), now_millis()],
    )?;
    Ok(())
}

fn load_cursor(conn: &Connection, peer: &PeerId, app: &AppId) -> Result<Option<LedgerCursor>> {
    conn.query_row(
        "SELECT last_added, last_sent, last_received, last_processed
         FROM ledger_cursors WHERE peer = ?1 AND app = ?2",
        params![peer.as_bytes().as_slice(), app.as_str()],
        |row| {
            Ok(LedgerCursor {
                last_added: row.get::<_, i64>(0)? as u64,
                last_sent: row.get::<_, i64>(1)? as u64,
                last_received: row.get::<_, i64>(2)? as u64,
                last_processed: row.get::<_, i64>(3)? as u64,
            })
        },
    )
    .optional()
    .map_err(StoreError::from)
}

fn encode_ranges(ranges: &[AduRange]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(ranges, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

type SentRow = (Vec<u8>, u8, i64, String, i64, Vec<u8>, i64);

fn sent_from_row(row: SentRow) -> Result<SentBundle> {
    let (peer, direction, counter, id, ack, ranges, created_at) = row;
    Ok(SentBundle {
        peer: peer_from_blob(peer)?,
        direction: direction_from_sql(direction)?,
        counter: counter as u64,
        encrypted_id: EncryptedBundleId::parse(&id)?,
        ack: ack as u64,
        ranges: ciborium::from_reader(ranges.as_slice())
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at,
    })
}

fn query_sent(conn: &Connection, peer: &PeerId, direction: Direction, up_to: u64) -> Result<Vec<SentBundle>> {
    let mut stmt = conn.prepare(
        "SELECT peer, direction, counter, encrypted_id, ack, ranges, created_at
         FROM sent_bundles WHERE peer = ?1 AND direction = ?2 AND counter <= ?3
         ORDER BY counter",
    )?;
    let rows = stmt
        .query_map(
            params![peer.as_bytes().as_slice(), direction as u8, up_to as i64],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )?
        .collect::<std::result::Result<Vec<SentRow>, _>>()?;
    rows.into_iter().map(sent_from_row).collect()
}

fn insert_received(conn: &Connection, adu: &Adu) -> Result<InsertResult> {
    ensure_cursor(conn, &adu.peer, &adu.app)?;
    let cursor = load_cursor(conn, &adu.peer, &adu.app)?.unwrap_or_default();
    if adu.seq <= cursor.last_received {
        return Ok(InsertResult::AlreadyExists);
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
    let now = now_millis();
    conn.execute(
        "UPDATE ledger_cursors SET last_received = ?3, updated_at = ?4
         WHERE peer = ?1 AND app = ?2",
        params![adu.peer.as_bytes().as_slice(), adu.app.as_str(), adu.seq as i64, now],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO adus (side, peer, app, seq, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            LedgerSide::Receive as u8,
            adu.peer.as_bytes().as_slice(),
            adu.app.as_str(),
            adu.seq as i64,
            adu.data.as_ref(),
            now
        ],
    )?;
    Ok(InsertResult::Inserted)
}

fn record_received(
    conn: &Connection,
    peer: &PeerId,
    direction: Direction,
    counter: u64,
    id: &EncryptedBundleId,
    carried_adus: bool,
) -> Result<bool> {
    let peer_bytes = peer.as_bytes().as_slice();
    conn.execute(
        "INSERT OR IGNORE INTO received_bundles
         (encrypted_id, peer, direction, counter, received_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id.as_str(), peer_bytes, direction as u8, counter as i64, now_millis()],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO bundle_counters (peer, direction) VALUES (?1, ?2)",
        params![peer_bytes, direction as u8],
    )?;
    let moved = conn.execute(
        "UPDATE bundle_counters SET last_received_counter = ?3, last_received_id = ?4
         WHERE peer = ?1 AND direction = ?2 AND last_received_counter < ?3",
        params![peer_bytes, direction as u8, counter as i64, id.as_str()],
    )?;
    if carried_adus {
        conn.execute(
            "UPDATE bundle_counters SET last_received_data_counter = ?3
             WHERE peer = ?1 AND direction = ?2 AND last_received_data_counter < ?3",
            params![peer_bytes, direction as u8, counter as i64],
        )?;
    }
    Ok(moved > 0)
}

fn save_session(conn: &Connection, peer: &PeerId, state: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sessions (peer, state, updated_at) VALUES (?1, ?2, ?3)",
        params![peer.as_bytes().as_slice(), state, now_millis()],
    )?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn append_adu(&self, peer: &PeerId, app: &AppId, data: Bytes) -> Result<Adu> {
        let (peer, app) = (*peer, app.clone());
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let now = now_millis();
            ensure_cursor(&tx, &peer, &app)?;
            tx.execute(
                "UPDATE ledger_cursors SET last_added = last_added + 1, updated_at = ?3
                 WHERE peer = ?1 AND app = ?2",
                params![peer.as_bytes().as_slice(), app.as_str(), now],
            )?;
            let seq: i64 = tx.query_row(
                "SELECT last_added FROM ledger_cursors WHERE peer = ?1 AND app = ?2",
                params![peer.as_bytes().as_slice(), app.as_str()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO adus (side, peer, app, seq, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    LedgerSide::Send as u8,
                    peer.as_bytes().as_slice(),
                    app.as_str(),
                    seq,
                    data.as_ref(),
                    now
                ],
            )?;
            tx.commit()?;
            Ok(Adu::new(peer, app, seq as u64, data))
        })
        .await
    }

    async fn insert_received_adu(&self, adu: &Adu) -> Result<InsertResult> {
        let adu = adu.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let result = insert_received(&tx, &adu)?;
            tx.commit()?;
            Ok(result)
        })
        .await
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
        let (peer, app) = (*peer, app.clone());
        // Counters above i64::MAX cannot be stored, so clamp the upper bound.
        let to = to.min(i64::MAX as u64) as i64;
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, data FROM adus
                 WHERE side = ?1 AND peer = ?2 AND app = ?3 AND seq >= ?4 AND seq <= ?5
                 ORDER BY seq LIMIT ?6",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        side as u8,
                        peer.as_bytes().as_slice(),
                        app.as_str(),
                        from as i64,
                        to,
                        limit as i64
                    ],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .map(|(seq, data)| Adu::new(peer, app.clone(), seq as u64, data))
                .collect())
        })
        .await
    }

    async fn get_cursor(&self, peer: &PeerId, app: &AppId) -> Result<Option<LedgerCursor>> {
        let (peer, app) = (*peer, app.clone());
        self.run(move |conn| load_cursor(conn, &peer, &app)).await
    }

    async fn advance_cursor(
        &self,
        peer: &PeerId,
        app: &AppId,
        kind: CursorKind,
        up_to: u64,
    ) -> Result<bool> {
        let (peer, app) = (*peer, app.clone());
        self.run(move |conn| {
            let tx = conn.transaction()?;
            ensure_cursor(&tx, &peer, &app)?;
            let cursor = load_cursor(&tx, &peer, &app)?.unwrap_or_default();
            let (column, current, bound) = match kind {
                CursorKind::Sent => ("last_sent", cursor.last_sent, cursor.last_added),
                CursorKind::Received => ("last_received", cursor.last_received, i64::MAX as u64),
                CursorKind::Processed => {
                    ("last_processed", cursor.last_processed, cursor.last_received)
                }
            };
            let target = up_to.min(bound);
            if target <= current {
                tx.commit()?;
                return Ok(false);
            }
            tx.execute(
                &format!(
                    "UPDATE ledger_cursors SET {column} = ?3, updated_at = ?4
                     WHERE peer = ?1 AND app = ?2"
                ),
                params![peer.as_bytes().as_slice(), app.as_str(), target as i64, now_millis()],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete_adus_up_to(
        &self,
        side: LedgerSide,
        peer: &PeerId,
        app: &AppId,
        up_to: u64,
    ) -> Result<u64> {
        let (peer, app) = (*peer, app.clone());
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let Some(cursor) = load_cursor(&tx, &peer, &app)? else {
                return Ok(0);
            };
            let bound = match side {
                LedgerSide::Send => cursor.last_sent,
                LedgerSide::Receive => cursor.last_processed,
            };
            let removed = tx.execute(
                "DELETE FROM adus WHERE side = ?1 AND peer = ?2 AND app = ?3 AND seq <= ?4",
                params![
                    side as u8,
                    peer.as_bytes().as_slice(),
                    app.as_str(),
                    up_to.min(bound) as i64
                ],
            )?;
            tx.commit()?;
            Ok(removed as u64)
        })
        .await
    }

    async fn list_peer_apps(&self) -> Result<Vec<(PeerId, AppId)>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT peer, app FROM ledger_cursors ORDER BY peer, app")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(peer, app)| -> Result<(PeerId, AppId)> {
                    Ok((peer_from_blob(peer)?, AppId::new(app)?))
                })
                .collect()
        })
        .await
    }

    async fn get_counters(&self, peer: &PeerId, direction: Direction) -> Result<BundleCounters> {
        let peer = *peer;
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT last_sent_counter, last_sent_id, last_sent_ack,
                            last_received_counter, last_received_id, last_received_data_counter
                     FROM bundle_counters WHERE peer = ?1 AND direction = ?2",
                    params![peer.as_bytes().as_slice(), direction as u8],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;
            let Some((sent, sent_id, sent_ack, received, received_id, received_data)) = row else {
                return Ok(BundleCounters::default());
            };
            Ok(BundleCounters {
                last_sent_counter: sent as u64,
                last_sent_id: sent_id.map(|s| EncryptedBundleId::parse(&s)).transpose()?,
                last_sent_ack: sent_ack as u64,
                last_received_counter: received as u64,
                last_received_id: received_id
                    .map(|s| EncryptedBundleId::parse(&s))
                    .transpose()?,
                last_received_data_counter: received_data as u64,
            })
        })
        .await
    }

    async fn record_sent_bundle(&self, bundle: &SentBundle) -> Result<()> {
        let bundle = bundle.clone();
        self.run(move |conn| {
            let ranges = encode_ranges(&bundle.ranges)?;
            let peer = bundle.peer.as_bytes().as_slice();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO sent_bundles
                 (peer, direction, counter, encrypted_id, ack, ranges, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    peer,
                    bundle.direction as u8,
                    bundle.counter as i64,
                    bundle.encrypted_id.as_str(),
                    bundle.ack as i64,
                    ranges,
                    bundle.created_at
                ],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO bundle_counters (peer, direction) VALUES (?1, ?2)",
                params![peer, bundle.direction as u8],
            )?;
            tx.execute(
                "UPDATE bundle_counters
                 SET last_sent_counter = MAX(last_sent_counter, ?3), last_sent_id = ?4,
                     last_sent_ack = ?5
                 WHERE peer = ?1 AND direction = ?2",
                params![
                    peer,
                    bundle.direction as u8,
                    bundle.counter as i64,
                    bundle.encrypted_id.as_str(),
                    bundle.ack as i64
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn record_received_bundle(
        &self,
        peer: &PeerId,
        direction: Direction,
        counter: u64,
        id: &EncryptedBundleId,
        carried_adus: bool,
    ) -> Result<bool> {
        let (peer, id) = (*peer, id.clone());
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let moved = record_received(&tx, &peer, direction, counter, &id, carried_adus)?;
            tx.commit()?;
            Ok(moved)
        })
        .await
    }

    async fn absorb_bundle(&self, bundle: &AbsorbedBundle) -> Result<usize> {
        let bundle = bundle.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            save_session(&tx, &bundle.peer, &bundle.session)?;
            let mut inserted = 0;
            for adu in &bundle.adus {
                if insert_received(&tx, adu)? == InsertResult::Inserted {
                    inserted += 1;
                }
            }
            record_received(
                &tx,
                &bundle.peer,
                bundle.direction,
                bundle.counter,
                &bundle.encrypted_id,
                !bundle.adus.is_empty(),
            )?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn outstanding_bundles(
        &self,
        peer: &PeerId,
        direction: Direction,
    ) -> Result<Vec<SentBundle>> {
        let peer = *peer;
        self.run(move |conn| query_sent(conn, &peer, direction, i64::MAX as u64))
            .await
    }

    async fn remove_acknowledged(
        &self,
        peer: &PeerId,
        direction: Direction,
        up_to: u64,
    ) -> Result<Vec<SentBundle>> {
        let peer = *peer;
        let up_to = up_to.min(i64::MAX as u64);
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let acked = query_sent(&tx, &peer, direction, up_to)?;
            tx.execute(
                "DELETE FROM sent_bundles WHERE peer = ?1 AND direction = ?2 AND counter <= ?3",
                params![peer.as_bytes().as_slice(), direction as u8, up_to as i64],
            )?;
            tx.commit()?;
            Ok(acked)
        })
        .await
    }

    async fn has_received_bundle(&self, id: &EncryptedBundleId) -> Result<bool> {
        let id = id.clone();
        self.run(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM received_bundles WHERE encrypted_id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn load_session(&self, peer: &PeerId) -> Result<Option<Vec<u8>>> {
        let peer = *peer;
        self.run(move |conn| {
            conn.query_row(
                "SELECT state FROM sessions WHERE peer = ?1",
                params![peer.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn save_session(&self, peer: &PeerId, state: &[u8]) -> Result<()> {
        let (peer, state) = (*peer, state.to_vec());
        self.run(move |conn| save_session(conn, &peer, &state)).await
    }

    async fn spool_put(
        &self,
        direction: Direction,
        id: &EncryptedBundleId,
        data: Bytes,
    ) -> Result<()> {
        let id = id.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO spool (direction, encrypted_id, data, stored_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![direction as u8, id.as_str(), data.as_ref(), now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn spool_get(
        &self,
        direction: Direction,
        id: &EncryptedBundleId,
    ) -> Result<Option<Bytes>> {
        let id = id.clone();
        self.run(move |conn| {
            let data: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT data FROM spool WHERE direction = ?1 AND encrypted_id = ?2",
                    params![direction as u8, id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(data.map(Bytes::from))
        })
        .await
    }

    async fn spool_delete(&self, direction: Direction, id: &EncryptedBundleId) -> Result<bool> {
        let id = id.clone();
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM spool WHERE direction = ?1 AND encrypted_id = ?2",
                params![direction as u8, id.as_str()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn spool_list(&self, direction: Direction) -> Result<Vec<EncryptedBundleId>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT encrypted_id FROM spool WHERE direction = ?1 ORDER BY encrypted_id",
            )?;
            let ids = stmt
                .query_map(params![direction as u8], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids.iter()
                .map(|s| EncryptedBundleId::parse(s).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn add_route(&self, relay: &PeerId, peer: &PeerId) -> Result<()> {
        let (relay, peer) = (*relay, *peer);
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO routes (relay, peer, updated_at) VALUES (?1, ?2, ?3)",
                params![relay.as_bytes().as_slice(), peer.as_bytes().as_slice(), now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn routes_for(&self, relay: &PeerId) -> Result<Vec<PeerId>> {
        let relay = *relay;
        self.run(move |conn| {
            let mut stmt = conn.prepare("SELECT peer FROM routes WHERE relay = ?1 ORDER BY peer")?;
            let peers = stmt
                .query_map(params![relay.as_bytes().as_slice()], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            peers.into_iter().map(peer_from_blob).collect()
        })
        .await
    }

    async fn put_recency_blob(&self, blob: &SignedRecencyBlob) -> Result<()> {
        let encoded = blob.to_cbor()?;
        let timestamp_ms = blob.blob.timestamp_ms;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO recency_blob (id, timestamp_ms, blob) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET timestamp_ms = excluded.timestamp_ms,
                                               blob = excluded.blob
                 WHERE excluded.timestamp_ms > recency_blob.timestamp_ms",
                params![timestamp_ms, encoded],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_recency_blob(&self) -> Result<Option<SignedRecencyBlob>> {
        self.run(|conn| {
            let encoded: Option<Vec<u8>> = conn
                .query_row("SELECT blob FROM recency_blob WHERE id = 1", [], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(encoded
                .map(|bytes| SignedRecencyBlob::from_cbor(&bytes))
                .transpose()?)
        })
        .await
    }

    async fn record_relay_recency(&self, relay: &PeerId, timestamp_ms: i64) -> Result<()> {
        let relay = *relay;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO relay_recency (relay, timestamp_ms) VALUES (?1, ?2)
                 ON CONFLICT(relay) DO UPDATE
                 SET timestamp_ms = MAX(relay_recency.timestamp_ms, excluded.timestamp_ms)",
                params![relay.as_bytes().as_slice(), timestamp_ms],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_relay_recency(&self) -> Result<Vec<(PeerId, i64)>> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare("SELECT relay, timestamp_ms FROM relay_recency ORDER BY relay")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(relay, ts)| -> Result<(PeerId, i64)> { Ok((peer_from_blob(relay)?, ts)) })
                .collect()
        })
        .await
    }
}
