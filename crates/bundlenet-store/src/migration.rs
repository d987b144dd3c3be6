//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use bundlenet_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
///
/// Sequence numbers and counters are stored as SQLite INTEGER (i64).
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per (peer, app) pairing
        CREATE TABLE ledger_cursors (
            peer BLOB NOT NULL,                   -- 32 bytes
            app TEXT NOT NULL,
            last_added INTEGER NOT NULL DEFAULT 0,
            last_sent INTEGER NOT NULL DEFAULT 0,      -- acknowledged by the peer
            last_received INTEGER NOT NULL DEFAULT 0,
            last_processed INTEGER NOT NULL DEFAULT 0, -- delivered to the app
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (peer, app)
        );

        -- ADU bytes, both directions
        CREATE TABLE adus (
            side INTEGER NOT NULL,                -- 1=send, 2=receive
            peer BLOB NOT NULL,
            app TEXT NOT NULL,
            seq INTEGER NOT NULL,
            data BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (side, peer, app, seq)
        );

        -- Per (peer, direction) bundle counters
        CREATE TABLE bundle_counters (
            peer BLOB NOT NULL,
            direction INTEGER NOT NULL,           -- 1=upstream, 2=downstream
            last_sent_counter INTEGER NOT NULL DEFAULT 0,
            last_sent_id TEXT,
            last_sent_ack INTEGER NOT NULL DEFAULT 0,
            last_received_counter INTEGER NOT NULL DEFAULT 0,
            last_received_id TEXT,
            last_received_data_counter INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (peer, direction)
        );

        -- Sent-but-unacknowledged bundles (the window)
        CREATE TABLE sent_bundles (
            peer BLOB NOT NULL,
            direction INTEGER NOT NULL,
            counter INTEGER NOT NULL,
            encrypted_id TEXT NOT NULL,
            ack INTEGER NOT NULL,
            ranges BLOB NOT NULL,                 -- CBOR array of AduRange
            created_at INTEGER NOT NULL,
            PRIMARY KEY (peer, direction, counter)
        );

        -- Every bundle id ever received
        CREATE TABLE received_bundles (
            encrypted_id TEXT PRIMARY KEY,
            peer BLOB NOT NULL,
            direction INTEGER NOT NULL,
            counter INTEGER NOT NULL,
            received_at INTEGER NOT NULL
        );

        -- Serialized ratchet state per remote peer
        CREATE TABLE sessions (
            peer BLOB PRIMARY KEY,
            state BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Opaque bundle bytes by encrypted id
        CREATE TABLE spool (
            direction INTEGER NOT NULL,
            encrypted_id TEXT NOT NULL,
            data BLOB NOT NULL,
            stored_at INTEGER NOT NULL,
            PRIMARY KEY (direction, encrypted_id)
        );

        -- Which endpoints were reached through which relay
        CREATE TABLE routes (
            relay BLOB NOT NULL,
            peer BLOB NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (relay, peer)
        );

        -- Newest recency blob held by a relay (single row)
        CREATE TABLE recency_blob (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            timestamp_ms INTEGER NOT NULL,
            blob BLOB NOT NULL                    -- CBOR SignedRecencyBlob
        );

        -- Newest accepted recency timestamp per relay, on endpoints
        CREATE TABLE relay_recency (
            relay BLOB PRIMARY KEY,
            timestamp_ms INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}
