//! Serving ends of the exchange protocol.
//!
//! [`BackendService`] opens and absorbs bundles through an [`Engine`] and
//! answers relay inventories. [`RelayService`] holds bundles opaquely: it
//! never sees a session key, only encrypted ids and container bytes.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use bundlenet_core::{
    now_millis, sign_recency_blob, Container, Direction, EncryptedBundleId, PeerId,
    SignedRecencyBlob,
};
use bundlenet_store::Store;

use crate::assembler::entries;
use crate::config::ExchangeConfig;
use crate::engine::Engine;
use crate::error::{Result, SyncError};
use crate::inventory::reconcile;
use crate::messages::{
    DownloadRequest, InventoryRequest, InventoryResponse, RecencyRequest, RecencyResponse,
    UploadAck, UploadHeader, UploadStatus,
};
use crate::transport::{ByteStream, ExchangeService};

async fn receive(stream: ByteStream, config: &ExchangeConfig) -> Result<Container> {
    let limit = config.transfer_timeout;
    tokio::time::timeout(limit, stream.read_container(config.max_bundle_bytes))
        .await
        .map_err(|_| SyncError::Timeout(limit))?
}

/// The backend's half of every exchange.
pub struct BackendService<S: Store> {
    engine: Arc<Engine<S>>,
}

impl<S: Store> BackendService<S> {
    pub fn new(engine: Arc<Engine<S>>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine<S>> {
        &self.engine
    }

    /// Downstream bundles still unacknowledged by endpoints routed via `relay`
    /// and present on the spool.
    async fn wanted_downstream(&self, relay: &PeerId) -> Result<BTreeSet<EncryptedBundleId>> {
        let store = self.engine.store();
        let spooled: HashSet<EncryptedBundleId> =
            store.spool_list(Direction::Downstream).await?.into_iter().collect();
        let mut wanted = BTreeSet::new();
        for peer in store.routes_for(relay).await? {
            for sent in self.engine.window().outstanding(&peer, Direction::Downstream).await? {
                if spooled.contains(&sent.encrypted_id) {
                    wanted.insert(sent.encrypted_id);
                }
            }
        }
        Ok(wanted)
    }
}

#[async_trait]
impl<S: Store> ExchangeService for BackendService<S> {
    async fn handle_upload(&self, header: UploadHeader, stream: ByteStream) -> Result<UploadAck> {
        let container = match receive(stream, self.engine.config()).await {
            Ok(container) => container,
            Err(e) if e.is_bundle_local() => {
                warn!(id = %header.bundle_id, error = %e, "refused upload");
                return Ok(UploadAck {
                    bundle_id: header.bundle_id,
                    status: UploadStatus::Rejected(e.to_string()),
                });
            }
            Err(e) => return Err(e),
        };

        let status = match self
            .engine
            .process_container(&container, Some(&header.bundle_id))
            .await
        {
            Ok(received) => {
                let peer = *received.peer();
                if header.sender != peer {
                    self.engine.store().add_route(&header.sender, &peer).await?;
                }
                if let Err(e) = self.engine.prepare_outgoing(&peer).await {
                    warn!(peer = %peer, error = %e, "could not build downstream bundle");
                }
                if received.is_duplicate() {
                    UploadStatus::Duplicate
                } else {
                    UploadStatus::Accepted
                }
            }
            Err(e) if e.is_bundle_local() => {
                warn!(id = %header.bundle_id, sender = %header.sender, error = %e, "rejected bundle");
                UploadStatus::Rejected(e.to_string())
            }
            Err(e) => return Err(e),
        };
        Ok(UploadAck {
            bundle_id: header.bundle_id,
            status,
        })
    }

    async fn handle_download(&self, request: DownloadRequest) -> Result<Option<ByteStream>> {
        let bytes = self
            .engine
            .store()
            .spool_get(Direction::Downstream, &request.bundle_id)
            .await?;
        Ok(bytes.map(|bytes| ByteStream::from_bytes(bytes, self.engine.config().chunk_size)))
    }

    async fn handle_inventory(&self, request: InventoryRequest) -> Result<InventoryResponse> {
        request.validate_limits()?;
        let store = self.engine.store();
        let mut absorbed = HashSet::new();
        for id in &request.held_upstream {
            if store.has_received_bundle(id).await? {
                absorbed.insert(id.clone());
            }
        }
        let wanted = self.wanted_downstream(&request.relay).await?;
        let plan = reconcile(&request, &absorbed, &wanted);
        info!(
            relay = %request.relay,
            delete = plan.to_delete.len(),
            download = plan.to_download.len(),
            upload = plan.to_upload.len(),
            "reconciled relay inventory"
        );
        Ok(plan)
    }

    async fn handle_recency(&self, _request: RecencyRequest) -> Result<RecencyResponse> {
        let blob = sign_recency_blob(self.engine.identity().keypair(), rand::random(), now_millis());
        Ok(RecencyResponse {
            responder: self.engine.peer_id(),
            blob: Some(blob),
        })
    }
}

/// A relay's spool-backed store-and-forward service.
///
/// Upstream holds bundles collected from endpoints; downstream holds bundles
/// fetched from the backend.
pub struct RelayService<S: Store> {
    peer_id: PeerId,
    store: Arc<S>,
    config: ExchangeConfig,
}

impl<S: Store> RelayService<S> {
    pub fn new(peer_id: PeerId, store: Arc<S>, config: ExchangeConfig) -> Self {
        Self {
            peer_id,
            store,
            config,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Everything held, for reconciliation with the backend.
    pub async fn inventory_request(&self) -> Result<InventoryRequest> {
        Ok(InventoryRequest {
            relay: self.peer_id,
            held_upstream: self.store.spool_list(Direction::Upstream).await?,
            held_downstream: self.store.spool_list(Direction::Downstream).await?,
        })
    }

    /// Drop a bundle from both spools. Returns whether anything was held.
    pub async fn discard(&self, id: &EncryptedBundleId) -> Result<bool> {
        let up = self.store.spool_delete(Direction::Upstream, id).await?;
        let down = self.store.spool_delete(Direction::Downstream, id).await?;
        Ok(up || down)
    }

    /// Cache the backend's latest recency blob for endpoints.
    pub async fn cache_recency(&self, blob: &SignedRecencyBlob) -> Result<()> {
        self.store.put_recency_blob(blob).await?;
        Ok(())
    }
}

/// A relay cannot open a bundle, but it can check the container is intact
/// and travels under the id it names.
fn check_opaque_bundle(container: &Container, id: &EncryptedBundleId) -> Result<()> {
    if container.require(entries::BUNDLE_ID)?.as_ref() != id.as_str().as_bytes() {
        return Err(bundlenet_core::CoreError::MalformedBundleId(
            "upload header id differs from container id".into(),
        )
        .into());
    }
    Ok(())
}

#[async_trait]
impl<S: Store> ExchangeService for RelayService<S> {
    async fn handle_upload(&self, header: UploadHeader, stream: ByteStream) -> Result<UploadAck> {
        let checked = match receive(stream, &self.config).await {
            Ok(container) => check_opaque_bundle(&container, &header.bundle_id).map(|()| container),
            Err(e) => Err(e),
        };
        let status = match checked {
            Ok(container) => {
                self.store
                    .spool_put(
                        Direction::Upstream,
                        &header.bundle_id,
                        Bytes::from(container.to_bytes()),
                    )
                    .await?;
                debug!(id = %header.bundle_id, sender = %header.sender, "stored bundle");
                UploadStatus::Stored
            }
            Err(e) if e.is_bundle_local() => {
                warn!(id = %header.bundle_id, error = %e, "refused upload");
                UploadStatus::Rejected(e.to_string())
            }
            Err(e) => return Err(e),
        };
        Ok(UploadAck {
            bundle_id: header.bundle_id,
            status,
        })
    }

    async fn handle_download(&self, request: DownloadRequest) -> Result<Option<ByteStream>> {
        let bytes = self
            .store
            .spool_get(Direction::Downstream, &request.bundle_id)
            .await?;
        Ok(bytes.map(|bytes| ByteStream::from_bytes(bytes, self.config.chunk_size)))
    }

    async fn handle_inventory(&self, _request: InventoryRequest) -> Result<InventoryResponse> {
        Err(SyncError::InvalidMessage("relays do not reconcile inventories".into()))
    }

    async fn handle_recency(&self, _request: RecencyRequest) -> Result<RecencyResponse> {
        Ok(RecencyResponse {
            responder: self.peer_id,
            blob: self.store.get_recency_blob().await?,
        })
    }
}
