//! # bundlenet store
//!
//! Persistence for bundlenet nodes behind the [`Store`] trait: the ADU
//! ledger and its cursors, per-direction bundle counters and the window of
//! unacknowledged bundles, serialized session state, the opaque bundle
//! spool, relay routes and recency records.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`Ledger`] - Sequence assignment and cursor discipline over a store
//! - [`LedgerCursor`] - The four monotonic counters of a (peer, app) pair
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bundlenet_core::{AppId, PeerId};
//! use bundlenet_store::{Ledger, LedgerSide, SqliteStore};
//!
//! async fn example() -> bundlenet_store::Result<()> {
//!     let store = Arc::new(SqliteStore::open("node.db")?);
//!     let ledger = Ledger::new(store);
//!
//!     let peer = PeerId::from_bytes([1; 32]);
//!     let mail = AppId::new("mail")?;
//!     ledger.append(&peer, &mail, b"hello".to_vec()).await?;
//!
//!     let mut range = ledger.read_range(LedgerSide::Send, &peer, &mail, 1, u64::MAX);
//!     while let Some(adu) = range.next().await? {
//!         println!("{} bytes at seq {}", adu.len(), adu.seq);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Monotonic cursors**: advancing to a value at or below the current one is a no-op
//! - **Bounded deletion**: send-side ADUs go only after acknowledgement,
//!   receive-side ADUs only after delivery
//! - **Idempotent receipt**: inbound ADUs at or below `last_received` are ignored

pub mod error;
pub mod ledger;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use ledger::{AduRangeIter, Ledger, DEFAULT_PAGE_SIZE};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    AbsorbedBundle, AduRange, BundleCounters, CursorKind, InsertResult, LedgerCursor, LedgerSide,
    SentBundle, Store,
};
