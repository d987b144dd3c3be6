//! # bundlenet Sync
//!
//! Bundle exchange between endpoints, relays and the backend.
//!
//! ## Overview
//!
//! An endpoint and the backend never need a live connection. Each side
//! queues ADUs in its ledger, seals them into bundles under the pairwise
//! session and hands the bundles to whatever link is available: the
//! backend itself, or a relay that carries them opaquely. Acks ride on the
//! next bundle in the other direction.
//!
//! ## Key Properties
//!
//! - **At-least-once bundles, exactly-once ADUs**: bundles may be resent and
//!   re-received; ADU cursors make absorption idempotent
//! - **Nothing deleted without proof**: ledger data goes only after an ack,
//!   relay data only after the backend reports it absorbed
//! - **Contained failures**: a corrupt or foreign bundle is dropped alone
//! - **Resumable**: a timed-out or cancelled attempt leaves state unacked
//!
//! ## Message Flow
//!
//! ```text
//! Endpoint                Relay                   Backend
//!   |---- upload ---------->|                        |
//!   |                       |---- inventory -------->|
//!   |                       |<--- delete/down/up ----|
//!   |                       |---- upload ----------->|
//!   |                       |<--- download ----------|
//!   |                       |<--- recency -----------|
//!   |---- recency --------->|                        |
//!   |<--- download (probe) -|                        |
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bundlenet_sync::{run_endpoint_exchange, Engine, ExchangeConfig, ExchangeOptions, Role};
//! use bundlenet_sync::{BackendService, MemoryTransport};
//! use bundlenet_session::Identity;
//! use bundlenet_store::MemoryStore;
//!
//! # async fn example() -> bundlenet_sync::Result<()> {
//! let backend_identity = Arc::new(Identity::generate());
//! let backend = Arc::new(Engine::new(
//!     backend_identity.clone(),
//!     Role::Backend,
//!     Arc::new(MemoryStore::new()),
//!     ExchangeConfig::default(),
//! ));
//! let link = MemoryTransport::new(Arc::new(BackendService::new(backend)));
//!
//! let endpoint = Engine::new(
//!     Arc::new(Identity::generate()),
//!     Role::Endpoint,
//!     Arc::new(MemoryStore::new()),
//!     ExchangeConfig::default(),
//! );
//! let backend_peer = endpoint.register_peer(backend_identity.pre_key_bundle())?;
//! let app = bundlenet_core::AppId::new("mail")?;
//! endpoint.enqueue(&backend_peer, &app, &b"hello"[..]).await?;
//!
//! let report = run_endpoint_exchange(&endpoint, &link, &backend_peer, ExchangeOptions::default()).await;
//! assert!(report.is_complete());
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod config;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod messages;
pub mod orchestrator;
pub mod service;
pub mod sessions;
pub mod transport;
pub mod window;

pub use assembler::{assemble, disassemble, open_container, open_envelope, Envelope, SealedBundle};
pub use config::ExchangeConfig;
pub use engine::{DeliveryFn, Engine, OutgoingBundle, Received, Role};
pub use error::{Result, SyncError};
pub use inventory::reconcile;
pub use messages::{
    limits, DownloadRequest, InventoryRequest, InventoryResponse, RecencyRequest, RecencyResponse,
    UploadAck, UploadHeader, UploadStatus, PROTOCOL_VERSION,
};
pub use orchestrator::{
    cancellation, probe_recency, run_endpoint_exchange, run_relay_exchange, select_relay,
    CancelSignal, Canceller, EventHook, ExchangeEvent, ExchangeOptions, ExchangeReport,
    ExchangeState,
};
pub use service::{BackendService, RelayService};
pub use sessions::{PeerGuard, SessionManager};
pub use transport::{ByteSink, ByteStream, ExchangeService, FaultPlan, MemoryTransport, Transport};
pub use window::{AckOutcome, WindowEngine};
