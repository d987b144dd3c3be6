//! The Node: one endpoint, backend or relay.
//!
//! A node ties an identity, a store and a configuration to the exchange
//! machinery for its role. Endpoints and the backend run a bundle engine;
//! relays only hold opaque bundles for others.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use bundlenet_core::{Adu, AppId, PeerId};
use bundlenet_session::{Identity, PreKeyBundle};
use bundlenet_store::Store;
use bundlenet_sync::{
    run_endpoint_exchange, run_relay_exchange, select_relay, BackendService, Engine,
    ExchangeOptions, ExchangeReport, ExchangeService, OutgoingBundle, RelayService, SyncError,
    Transport,
};

use crate::config::{DeliveryMode, NodeConfig, NodeRole};
use crate::error::{NodeError, Result};

type DeliveryCallback = Box<dyn Fn(&Adu) + Send + Sync>;

enum Inner<S: Store> {
    Engine(Arc<Engine<S>>),
    Relay(Arc<RelayService<S>>),
}

/// Builder for a [`Node`].
pub struct NodeBuilder {
    identity: Arc<Identity>,
    config: NodeConfig,
    delivery: Option<DeliveryCallback>,
}

impl NodeBuilder {
    pub fn new(identity: Identity, config: NodeConfig) -> Self {
        Self {
            identity: Arc::new(identity),
            config,
            delivery: None,
        }
    }

    /// Receive ADUs inline as their bundles are absorbed.
    pub fn on_delivery(mut self, deliver: impl Fn(&Adu) + Send + Sync + 'static) -> Self {
        self.delivery = Some(Box::new(deliver));
        self
    }

    /// Open the node over `store`.
    pub fn build<S: Store>(self, store: S) -> Result<Node<S>> {
        self.config.validate()?;
        let store = Arc::new(store);
        let exchange = self.config.exchange.clone();

        let inner = match (self.config.role.engine_role(), self.delivery) {
            (None, Some(_)) => {
                return Err(NodeError::Config("relays do not deliver ADUs".into()));
            }
            (None, None) => Inner::Relay(Arc::new(RelayService::new(
                self.identity.peer_id(),
                store,
                exchange,
            ))),
            (Some(role), delivery) => {
                let engine = Engine::new(self.identity.clone(), role, store, exchange);
                let engine = match (self.config.delivery.mode, delivery) {
                    (DeliveryMode::Inline, Some(deliver)) => engine.with_delivery(deliver),
                    (DeliveryMode::Poll, None) => engine,
                    (DeliveryMode::Inline, None) => {
                        return Err(NodeError::Config(
                            "inline delivery needs a delivery callback".into(),
                        ));
                    }
                    (DeliveryMode::Poll, Some(_)) => {
                        return Err(NodeError::Config(
                            "polling nodes take no delivery callback".into(),
                        ));
                    }
                };
                Inner::Engine(Arc::new(engine))
            }
        };

        info!(peer = %self.identity.peer_id(), role = %self.config.role, "node opened");
        Ok(Node {
            identity: self.identity,
            config: self.config,
            inner,
        })
    }
}

/// A bundlenet participant.
pub struct Node<S: Store> {
    identity: Arc<Identity>,
    config: NodeConfig,
    inner: Inner<S>,
}

impl<S: Store> Node<S> {
    /// Open a relay or a polling node. Inline delivery goes through
    /// [`NodeBuilder`].
    pub fn new(identity: Identity, store: S, config: NodeConfig) -> Result<Self> {
        NodeBuilder::new(identity, config).build(store)
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn role(&self) -> NodeRole {
        self.config.role
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Keys to publish so peers can open a session with this node.
    pub fn pre_key_bundle(&self) -> PreKeyBundle {
        self.identity.pre_key_bundle()
    }

    /// The bundle engine, for endpoints and the backend.
    pub fn engine(&self) -> Option<&Arc<Engine<S>>> {
        match &self.inner {
            Inner::Engine(engine) => Some(engine),
            Inner::Relay(_) => None,
        }
    }

    /// The relay spool service, for relays.
    pub fn relay(&self) -> Option<&Arc<RelayService<S>>> {
        match &self.inner {
            Inner::Relay(relay) => Some(relay),
            Inner::Engine(_) => None,
        }
    }

    fn require_engine(&self, operation: &'static str) -> Result<&Arc<Engine<S>>> {
        self.engine().ok_or(NodeError::WrongRole {
            operation,
            role: self.config.role,
        })
    }

    fn require_role(&self, role: NodeRole, operation: &'static str) -> Result<()> {
        if self.config.role == role {
            Ok(())
        } else {
            Err(NodeError::WrongRole {
                operation,
                role: self.config.role,
            })
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Application Data
    // ─────────────────────────────────────────────────────────────────────────

    /// Trust a peer's published keys. Endpoints register the backend;
    /// the backend learns endpoints from their handshakes.
    pub fn register_peer(&self, bundle: PreKeyBundle) -> Result<PeerId> {
        Ok(self.require_engine("register_peer")?.register_peer(bundle)?)
    }

    /// Queue `data` for `peer` under application `app`.
    ///
    /// The backend seals a bundle straight away, since endpoints and relays
    /// fetch downstream bundles by id. Before `peer` has opened a session
    /// the data just waits.
    pub async fn send(&self, peer: &PeerId, app: &str, data: impl Into<Bytes>) -> Result<Adu> {
        let engine = self.require_engine("send")?;
        let app = AppId::new(app)?;
        let adu = engine.enqueue(peer, &app, data).await?;
        if self.config.role == NodeRole::Backend {
            match engine.prepare_outgoing(peer).await {
                Ok(_) => {}
                Err(SyncError::UnknownPeer(_)) => {
                    debug!(peer = %peer, seq = adu.seq, "no session yet; queued");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(adu)
    }

    /// Hand every received, undelivered ADU from `peer` to `sink`.
    pub async fn drain(&self, peer: &PeerId, sink: impl FnMut(&Adu) + Send) -> Result<usize> {
        Ok(self.require_engine("drain")?.drain(peer, sink).await?)
    }

    /// Bundles sent to `peer` and not yet acknowledged.
    pub async fn pending(&self, peer: &PeerId) -> Result<Vec<OutgoingBundle>> {
        Ok(self.require_engine("pending")?.pending_uploads(peer).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Exchange
    // ─────────────────────────────────────────────────────────────────────────

    /// The service answering exchange calls made to this node.
    pub fn service(&self) -> Result<Arc<dyn ExchangeService>> {
        match &self.inner {
            Inner::Relay(relay) => Ok(relay.clone() as Arc<dyn ExchangeService>),
            Inner::Engine(engine) if self.config.role == NodeRole::Backend => {
                Ok(Arc::new(BackendService::new(engine.clone())))
            }
            Inner::Engine(_) => Err(NodeError::WrongRole {
                operation: "service",
                role: self.config.role,
            }),
        }
    }

    /// Run one endpoint exchange with the backend over `link`, which is
    /// either the backend itself or a relay.
    pub async fn exchange<T>(
        &self,
        link: &T,
        backend: &PeerId,
        options: ExchangeOptions<'_>,
    ) -> Result<ExchangeReport>
    where
        T: Transport + ?Sized,
    {
        self.require_role(NodeRole::Endpoint, "exchange")?;
        let engine = self.require_engine("exchange")?;
        Ok(run_endpoint_exchange(engine, link, backend, options).await)
    }

    /// Run one relay exchange with the backend.
    pub async fn sync_relay<T>(&self, backend: &T, options: ExchangeOptions<'_>) -> Result<ExchangeReport>
    where
        T: Transport + ?Sized,
    {
        let relay = self.relay().ok_or(NodeError::WrongRole {
            operation: "sync_relay",
            role: self.config.role,
        })?;
        Ok(run_relay_exchange(relay, backend, options).await)
    }

    /// Pick the relay whose cached recency blob from `backend` is freshest.
    pub async fn choose_relay<K, T>(&self, backend: &PeerId, relays: &[(K, &T)]) -> Result<Option<K>>
    where
        K: Clone,
        T: Transport + ?Sized,
    {
        self.require_role(NodeRole::Endpoint, "choose_relay")?;
        let engine = self.require_engine("choose_relay")?;
        Ok(select_relay(engine, backend, relays).await?)
    }
}
