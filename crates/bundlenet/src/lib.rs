//! # bundlenet
//!
//! Delay-tolerant delivery of application data between endpoints and a
//! backend, carried over intermittent links and untrusted relays.
//!
//! ## Overview
//!
//! Applications hand small units of data (ADUs) to a [`Node`]. The node
//! seals them into bundles under an end-to-end session with the backend and
//! moves them whenever a link appears:
//!
//! - **Endpoint**: queues ADUs, uploads bundles, probes for replies
//! - **Backend**: absorbs bundles, acknowledges, answers relay inventories
//! - **Relay**: holds opaque bundles it cannot read and forwards them later
//!
//! ## Key Properties
//!
//! - Bundles are signed containers; tampering is detected before decryption.
//! - Relays see encrypted bundle ids only.
//! - ADUs are delivered once, in order per application, however often a
//!   bundle is resent.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bundlenet::{ExchangeOptions, Node, NodeBuilder, NodeConfig};
//! use bundlenet::session::Identity;
//! use bundlenet::store::MemoryStore;
//! use bundlenet::sync::MemoryTransport;
//!
//! # async fn example() -> bundlenet::Result<()> {
//! let backend = NodeBuilder::new(Identity::generate(), NodeConfig::backend())
//!     .on_delivery(|adu| println!("{} #{}", adu.app, adu.seq))
//!     .build(MemoryStore::new())?;
//! let endpoint = Node::new(Identity::generate(), MemoryStore::new(), NodeConfig::endpoint().polling())?;
//!
//! let backend_peer = endpoint.register_peer(backend.pre_key_bundle())?;
//! endpoint.send(&backend_peer, "mail", &b"hello"[..]).await?;
//!
//! let link = MemoryTransport::new(backend.service()?);
//! let report = endpoint.exchange(&link, &backend_peer, ExchangeOptions::default()).await?;
//! assert!(report.is_complete());
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! - `bundlenet::core` - containers, bundle ids, payloads, recency blobs
//! - `bundlenet::session` - identities, handshake, ratchet
//! - `bundlenet::store` - storage abstraction, SQLite and in-memory stores
//! - `bundlenet::sync` - exchange engine, services, orchestrator

pub mod config;
pub mod error;
pub mod node;

// Re-export component crates
pub use bundlenet_core as core;
pub use bundlenet_session as session;
pub use bundlenet_store as store;
pub use bundlenet_sync as sync;

pub use config::{DeliveryConfig, DeliveryMode, NodeConfig, NodeRole};
pub use error::{NodeError, Result};
pub use node::{Node, NodeBuilder};

// Re-export commonly used types
pub use bundlenet_core::{Adu, AppId, Direction, EncryptedBundleId, PeerId};
pub use bundlenet_sync::{
    cancellation, CancelSignal, Canceller, ExchangeConfig, ExchangeEvent, ExchangeOptions,
    ExchangeReport, ExchangeState, Transport,
};
