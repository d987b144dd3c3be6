//! Endpoint and backend bundle engine.
//!
//! The engine owns the full path between an application's ADUs and bundle
//! bytes on a spool: selecting ADUs, sealing them under the peer's session,
//! opening inbound bundles, absorbing their ADUs and acks, and delivering
//! received data in order.
//!
//! Relays never run an engine. They only move opaque bundle bytes between
//! spools (see [`crate::service::RelayService`]).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use bundlenet_core::{
    now_millis, Adu, AppId, BundleId, BundlePayload, Container, Direction, EncryptedBundleId,
    PeerId, RecencyPolicy,
};
use bundlenet_session::{x3dh, BundleIdCipher, Identity, PreKeyBundle, SessionError};
use bundlenet_store::{AduRange, Ledger, LedgerSide, SentBundle, Store};

use crate::assembler::{assemble, open_container, open_envelope, Envelope};
use crate::config::ExchangeConfig;
use crate::error::{Result, SyncError};
use crate::sessions::{PeerGuard, SessionManager};
use crate::window::{AckOutcome, WindowEngine};

/// Callback receiving ADUs in sequence order per (peer, app).
pub type DeliveryFn = Arc<dyn Fn(&Adu) + Send + Sync>;

/// Which side of the pairing this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Endpoint,
    Backend,
}

impl Role {
    /// Direction of bundles this role sends.
    pub fn outbound(self) -> Direction {
        match self {
            Role::Endpoint => Direction::Upstream,
            Role::Backend => Direction::Downstream,
        }
    }

    /// Direction of bundles this role receives.
    pub fn inbound(self) -> Direction {
        self.outbound().reverse()
    }
}

/// A spooled bundle ready for transfer.
#[derive(Debug, Clone)]
pub struct OutgoingBundle {
    pub peer: PeerId,
    pub counter: u64,
    pub id: EncryptedBundleId,
    pub bytes: Bytes,
    pub adu_count: u64,
    /// Set when `prepare_outgoing` handed back the previous bundle unchanged.
    pub reused: bool,
}

/// Result of absorbing an inbound bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Accepted {
        peer: PeerId,
        bundle_id: BundleId,
        encrypted_id: EncryptedBundleId,
        new_adus: usize,
        ack: AckOutcome,
        delivered: usize,
    },
    /// Already absorbed. Nothing changed apart from recording the id.
    Duplicate {
        peer: PeerId,
        counter: u64,
        encrypted_id: EncryptedBundleId,
    },
}

impl Received {
    pub fn peer(&self) -> &PeerId {
        match self {
            Received::Accepted { peer, .. } | Received::Duplicate { peer, .. } => peer,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Received::Duplicate { .. })
    }
}

pub struct Engine<S: Store> {
    identity: Arc<Identity>,
    role: Role,
    store: Arc<S>,
    ledger: Ledger<S>,
    window: WindowEngine<S>,
    sessions: SessionManager<S>,
    peers: RwLock<HashMap<PeerId, PreKeyBundle>>,
    config: ExchangeConfig,
    delivery: Option<DeliveryFn>,
}

impl<S: Store> Engine<S> {
    pub fn new(identity: Arc<Identity>, role: Role, store: Arc<S>, config: ExchangeConfig) -> Self {
        Self {
            identity,
            role,
            ledger: Ledger::new(store.clone()),
            window: WindowEngine::new(store.clone()),
            sessions: SessionManager::new(store.clone()),
            store,
            peers: RwLock::new(HashMap::new()),
            config,
            delivery: None,
        }
    }

    /// Hand received ADUs to `deliver` as soon as they are absorbed.
    pub fn with_delivery(mut self, deliver: impl Fn(&Adu) + Send + Sync + 'static) -> Self {
        self.delivery = Some(Arc::new(deliver));
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    pub fn window(&self) -> &WindowEngine<S> {
        &self.window
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Trust a peer's published keys.
    pub fn register_peer(&self, bundle: PreKeyBundle) -> Result<PeerId> {
        bundle.verify()?;
        let peer = bundle.peer_id();
        match self.peers.write() {
            Ok(mut peers) => peers.insert(peer, bundle),
            Err(poisoned) => poisoned.into_inner().insert(peer, bundle),
        };
        debug!(peer = %peer, "registered peer");
        Ok(peer)
    }

    pub fn known_peer(&self, peer: &PeerId) -> Option<PreKeyBundle> {
        match self.peers.read() {
            Ok(peers) => peers.get(peer).cloned(),
            Err(poisoned) => poisoned.into_inner().get(peer).cloned(),
        }
    }

    /// Recency policy pinned to the backend `backend`.
    pub fn recency_policy(&self, backend: &PeerId) -> Result<RecencyPolicy> {
        let bundle = self
            .known_peer(backend)
            .ok_or_else(|| SyncError::UnknownPeer(backend.to_string()))?;
        Ok(RecencyPolicy::new(self.config.recency_max_age)
            .with_future_skew(self.config.recency_future_skew)
            .with_issuer(bundle.identity))
    }

    /// The endpoint a bundle id names when talking to `remote`.
    fn endpoint_of(&self, remote: &PeerId) -> PeerId {
        match self.role {
            Role::Endpoint => self.peer_id(),
            Role::Backend => *remote,
        }
    }

    async fn cipher_for(&self, peer: &PeerId) -> Result<BundleIdCipher> {
        if let Some(bundle) = self.known_peer(peer) {
            return Ok(BundleIdCipher::new(&self.identity, &bundle.identity_dh));
        }
        match self.sessions.peek(peer).await? {
            Some(session) => Ok(BundleIdCipher::new(&self.identity, session.remote_identity_dh())),
            None => Err(SyncError::UnknownPeer(peer.to_string())),
        }
    }

    /// Queue application data for `peer`.
    pub async fn enqueue(&self, peer: &PeerId, app: &AppId, data: impl Into<Bytes>) -> Result<Adu> {
        Ok(self.ledger.append(peer, app, data).await?)
    }

    /// Pick unsent ADUs for `peer` up to the payload budget.
    ///
    /// At least one ADU is taken when any is pending, so an oversized ADU
    /// still makes progress alone.
    async fn select_adus(&self, peer: &PeerId) -> Result<Vec<Adu>> {
        let mut budget = self.config.max_payload_bytes;
        let mut selected: Vec<Adu> = Vec::new();
        for app in self.ledger.apps_for(peer).await? {
            let cursor = self.ledger.cursor(peer, &app).await?;
            if cursor.last_added <= cursor.last_sent {
                continue;
            }
            let mut range = self.ledger.read_range(
                LedgerSide::Send,
                peer,
                &app,
                cursor.last_sent + 1,
                cursor.last_added,
            );
            while let Some(adu) = range.next().await? {
                if adu.len() > budget && !selected.is_empty() {
                    break;
                }
                budget = budget.saturating_sub(adu.len());
                selected.push(adu);
            }
        }
        Ok(selected)
    }

    /// Build the next bundle for `peer`, or hand back the last one.
    ///
    /// Returns `None` when there is nothing new to say: no pending ADUs and
    /// no data from `peer` waiting to be acknowledged.
    pub async fn prepare_outgoing(&self, peer: &PeerId) -> Result<Option<OutgoingBundle>> {
        let guard = self.sessions.lock(peer).await;
        let outbound = self.role.outbound();

        let mut session = match self.sessions.load(&guard).await? {
            Some(session) => session,
            None => match (self.role, self.known_peer(peer)) {
                (Role::Endpoint, Some(bundle)) => {
                    info!(peer = %peer, "starting session");
                    x3dh::initiate(&self.identity, &bundle)?
                }
                _ => return Err(SyncError::UnknownPeer(peer.to_string())),
            },
        };
        if !session.can_send() {
            debug!(peer = %peer, "session cannot send before the first inbound bundle");
            return Ok(None);
        }

        let ack = self.window.ack_to_send(peer, self.role.inbound()).await?;
        let counters = self.store.get_counters(peer, outbound).await?;
        let adus = self.select_adus(peer).await?;
        let ranges = ranges_of(&adus);
        let outstanding = self.window.outstanding(peer, outbound).await?;

        if let Some(last) = outstanding.last() {
            if last.counter == counters.last_sent_counter && last.ack == ack && last.ranges == ranges {
                if let Some(bytes) = self.store.spool_get(outbound, &last.encrypted_id).await? {
                    debug!(peer = %peer, counter = last.counter, "reusing unacknowledged bundle");
                    return Ok(Some(OutgoingBundle {
                        peer: *peer,
                        counter: last.counter,
                        id: last.encrypted_id.clone(),
                        bytes,
                        adu_count: adu_count(&last.ranges),
                        reused: true,
                    }));
                }
            }
        }
        let owes_ack = ack > counters.last_sent_ack
            && self
                .window
                .owes_ack(peer, self.role.inbound(), counters.last_sent_ack)
                .await?;
        if adus.is_empty() && counters.last_sent_counter > 0 && !owes_ack {
            return Ok(None);
        }

        let counter = counters.last_sent_counter + 1;
        let bundle_id = BundleId::new(self.endpoint_of(peer), counter, outbound);
        let payload = BundlePayload::new(bundle_id, ack, adus);
        let cipher = BundleIdCipher::new(&self.identity, session.remote_identity_dh());
        let sealed = assemble(&self.identity, &mut session, &cipher, &payload)?;

        self.sessions.save(&guard, &session).await?;
        self.store
            .spool_put(outbound, &sealed.id, sealed.bytes.clone())
            .await?;
        self.window
            .record_sent(&SentBundle {
                peer: *peer,
                direction: outbound,
                counter,
                encrypted_id: sealed.id.clone(),
                ack,
                ranges: ranges.clone(),
                created_at: now_millis(),
            })
            .await?;

        info!(
            peer = %peer,
            counter,
            adus = payload.adus.len(),
            ack,
            bytes = sealed.bytes.len(),
            "built bundle"
        );
        Ok(Some(OutgoingBundle {
            peer: *peer,
            counter,
            id: sealed.id,
            bytes: sealed.bytes,
            adu_count: adu_count(&ranges),
            reused: false,
        }))
    }

    /// Unacknowledged bundles still on the spool, oldest first.
    pub async fn pending_uploads(&self, peer: &PeerId) -> Result<Vec<OutgoingBundle>> {
        let outbound = self.role.outbound();
        let mut pending = Vec::new();
        for sent in self.window.outstanding(peer, outbound).await? {
            match self.store.spool_get(outbound, &sent.encrypted_id).await? {
                Some(bytes) => pending.push(OutgoingBundle {
                    peer: *peer,
                    counter: sent.counter,
                    adu_count: adu_count(&sent.ranges),
                    id: sent.encrypted_id,
                    bytes,
                    reused: false,
                }),
                None => warn!(peer = %peer, counter = sent.counter, "outstanding bundle missing from spool"),
            }
        }
        Ok(pending)
    }

    /// Ids of the next inbound bundles `peer` may have produced.
    pub async fn expected_downloads(&self, peer: &PeerId) -> Result<Vec<EncryptedBundleId>> {
        let inbound = self.role.inbound();
        let cipher = self.cipher_for(peer).await?;
        let next = self.store.get_counters(peer, inbound).await?.last_received_counter + 1;
        (next..next + self.config.download_probe_window)
            .map(|counter| -> Result<EncryptedBundleId> {
                let id = BundleId::new(self.endpoint_of(peer), counter, inbound);
                Ok(cipher.encrypt(&id)?)
            })
            .collect()
    }

    /// Open and absorb an inbound bundle.
    ///
    /// `claimed` is the id the bundle travelled under, checked against the
    /// one sealed inside. The advanced session, the ADUs and the bundle id
    /// are committed together, so a failure before that point leaves the
    /// bundle replayable. Ack release and delivery run afterwards and are
    /// picked up again by the next bundle or [`Engine::deliver`].
    pub async fn process_incoming(
        &self,
        bytes: &[u8],
        claimed: Option<&EncryptedBundleId>,
    ) -> Result<Received> {
        let envelope = open_envelope(bytes, &self.identity.public_key())?;
        self.absorb_envelope(envelope, claimed).await
    }

    /// [`Engine::process_incoming`] for a container already verified while
    /// it streamed in.
    pub async fn process_container(
        &self,
        container: &Container,
        claimed: Option<&EncryptedBundleId>,
    ) -> Result<Received> {
        let envelope = open_container(container, &self.identity.public_key())?;
        self.absorb_envelope(envelope, claimed).await
    }

    async fn absorb_envelope(
        &self,
        envelope: Envelope,
        claimed: Option<&EncryptedBundleId>,
    ) -> Result<Received> {
        if let Some(claimed) = claimed {
            if *claimed != envelope.encrypted_id {
                return Err(bundlenet_core::CoreError::MalformedBundleId(
                    "transfer id differs from sealed id".into(),
                )
                .into());
            }
        }
        let peer = envelope.sender_peer();
        if self.role == Role::Endpoint && self.known_peer(&peer).is_none() {
            return Err(SyncError::UnknownPeer(peer.to_string()));
        }
        let inbound = self.role.inbound();
        let guard = self.sessions.lock(&peer).await;

        let stored = self.sessions.load(&guard).await?;
        let (mut session, fresh) = match (self.role, &envelope.handshake, stored) {
            (Role::Backend, Some(handshake), Some(existing))
                if existing.handshake_base_key() == Some(&handshake.base_key) =>
            {
                (existing, false)
            }
            (Role::Backend, Some(handshake), _) => (x3dh::respond(&self.identity, handshake)?, true),
            (_, _, Some(existing)) => (existing, false),
            (_, _, None) => return Err(SyncError::UnknownPeer(peer.to_string())),
        };
        if *session.remote_identity() != envelope.sender {
            return Err(SessionError::UntrustedPeer("sender does not own this session".into()).into());
        }

        let cipher = BundleIdCipher::new(&self.identity, session.remote_identity_dh());
        let bundle_id = envelope.decrypt_id(&cipher)?;
        if bundle_id.direction != inbound {
            return Err(bundlenet_core::CoreError::DirectionMismatch { expected: inbound }.into());
        }
        if bundle_id.peer != self.endpoint_of(&peer) {
            return Err(SessionError::UntrustedPeer("bundle id names another endpoint".into()).into());
        }

        if self.window.is_duplicate(&peer, inbound, bundle_id.counter).await?
            || self.store.has_received_bundle(&envelope.encrypted_id).await?
        {
            self.window
                .record_received(&peer, inbound, bundle_id.counter, &envelope.encrypted_id, false)
                .await?;
            debug!(peer = %peer, counter = bundle_id.counter, "duplicate bundle");
            return Ok(Received::Duplicate {
                peer,
                counter: bundle_id.counter,
                encrypted_id: envelope.encrypted_id,
            });
        }

        let payload = envelope.open_payload(&mut session, &bundle_id)?;
        let new_adus = self
            .sessions
            .absorb(
                &guard,
                &session,
                inbound,
                bundle_id.counter,
                &envelope.encrypted_id,
                &payload.adus,
            )
            .await?;
        if fresh {
            info!(peer = %peer, "accepted new session");
        }
        let ack = self
            .window
            .on_ack_received(&peer, self.role.outbound(), payload.ack)
            .await?;
        let delivered = self.deliver_locked(&guard).await?;
        drop(guard);

        info!(
            peer = %peer,
            counter = bundle_id.counter,
            new_adus,
            ack = payload.ack,
            delivered,
            "absorbed bundle"
        );
        Ok(Received::Accepted {
            peer,
            bundle_id,
            encrypted_id: envelope.encrypted_id,
            new_adus,
            ack,
            delivered,
        })
    }

    /// Hand every received, unprocessed ADU from `peer` to the delivery
    /// callback, then reclaim it. Returns the number delivered.
    pub async fn deliver(&self, peer: &PeerId) -> Result<usize> {
        let guard = self.sessions.lock(peer).await;
        self.deliver_locked(&guard).await
    }

    /// Like [`Engine::deliver`], with a one-off sink instead of the
    /// configured callback. For hosts that poll rather than subscribe.
    pub async fn drain(&self, peer: &PeerId, mut sink: impl FnMut(&Adu) + Send) -> Result<usize> {
        let guard = self.sessions.lock(peer).await;
        self.drain_locked(&guard, &mut sink).await
    }

    async fn deliver_locked(&self, guard: &PeerGuard) -> Result<usize> {
        let Some(deliver) = self.delivery.clone() else {
            return Ok(0);
        };
        self.drain_locked(guard, &mut |adu: &Adu| deliver(adu)).await
    }

    async fn drain_locked(&self, guard: &PeerGuard, sink: &mut (dyn FnMut(&Adu) + Send)) -> Result<usize> {
        let peer = guard.peer();
        let mut delivered = 0;
        for app in self.ledger.apps_for(peer).await? {
            let cursor = self.ledger.cursor(peer, &app).await?;
            if cursor.last_received <= cursor.last_processed {
                continue;
            }
            let mut range = self.ledger.read_range(
                LedgerSide::Receive,
                peer,
                &app,
                cursor.last_processed + 1,
                cursor.last_received,
            );
            let mut last = cursor.last_processed;
            while let Some(adu) = range.next().await? {
                sink(&adu);
                last = adu.seq;
                delivered += 1;
            }
            if last > cursor.last_processed {
                self.ledger.advance_processed(peer, &app, last).await?;
                self.ledger
                    .delete_up_to(LedgerSide::Receive, peer, &app, last)
                    .await?;
            }
        }
        Ok(delivered)
    }
}

fn ranges_of(adus: &[Adu]) -> Vec<AduRange> {
    let mut ranges: BTreeMap<&AppId, (u64, u64)> = BTreeMap::new();
    for adu in adus {
        ranges
            .entry(&adu.app)
            .and_modify(|r| {
                r.0 = r.0.min(adu.seq);
                r.1 = r.1.max(adu.seq);
            })
            .or_insert((adu.seq, adu.seq));
    }
    ranges
        .into_iter()
        .map(|(app, (from, to))| AduRange {
            app: app.clone(),
            from,
            to,
        })
        .collect()
}

fn adu_count(ranges: &[AduRange]) -> u64 {
    ranges.iter().map(|r| r.to - r.from + 1).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlenet_core::SignedRecencyBlob;
    use bundlenet_store::{
        AbsorbedBundle, BundleCounters, CursorKind, InsertResult, LedgerCursor, MemoryStore,
        Result as StoreResult, SqliteStore, StoreError,
    };
    use std::sync::Mutex;

    struct Pair<S: Store> {
        endpoint: Engine<S>,
        backend: Engine<S>,
    }

    fn mail() -> AppId {
        AppId::new("mail").unwrap()
    }

    fn engines<S: Store>(endpoint_store: S, backend_store: S, config: ExchangeConfig) -> Pair<S> {
        let endpoint_id = Arc::new(Identity::from_seed(&[1; 32]));
        let backend_id = Arc::new(Identity::from_seed(&[2; 32]));
        let endpoint = Engine::new(endpoint_id, Role::Endpoint, Arc::new(endpoint_store), config.clone());
        let backend = Engine::new(backend_id.clone(), Role::Backend, Arc::new(backend_store), config);
        endpoint.register_peer(backend_id.pre_key_bundle()).unwrap();
        Pair { endpoint, backend }
    }

    fn memory_pair() -> Pair<MemoryStore> {
        engines(MemoryStore::new(), MemoryStore::new(), ExchangeConfig::default())
    }

    fn collector() -> (Arc<Mutex<Vec<Vec<u8>>>>, impl Fn(&Adu) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |adu: &Adu| seen.lock().unwrap().push(adu.data.to_vec())
        };
        (seen, sink)
    }

    #[test]
    fn test_role_directions() {
        assert_eq!(Role::Endpoint.outbound(), Direction::Upstream);
        assert_eq!(Role::Endpoint.inbound(), Direction::Downstream);
        assert_eq!(Role::Backend.outbound(), Direction::Downstream);
        assert_eq!(Role::Backend.inbound(), Direction::Upstream);
    }

    #[test]
    fn test_ranges_group_by_app() {
        let peer = PeerId::from_bytes([1; 32]);
        let chat = AppId::new("chat").unwrap();
        let adus = vec![
            Adu::new(peer, mail(), 3, Bytes::new()),
            Adu::new(peer, mail(), 4, Bytes::new()),
            Adu::new(peer, chat.clone(), 1, Bytes::new()),
        ];
        let ranges = ranges_of(&adus);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], AduRange { app: chat, from: 1, to: 1 });
        assert_eq!(ranges[1], AduRange { app: mail(), from: 3, to: 4 });
        assert_eq!(adu_count(&ranges), 3);
    }

    #[tokio::test]
    async fn test_mail_round_trip() {
        let (seen, sink) = collector();
        let pair = memory_pair();
        let backend = pair.backend.with_delivery(sink);
        let endpoint = pair.endpoint;
        let backend_peer = backend.peer_id();

        for body in [&b"one"[..], b"two", b"three"] {
            endpoint.enqueue(&backend_peer, &mail(), body.to_vec()).await.unwrap();
        }
        let up = endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap();
        assert_eq!(up.counter, 1);
        assert_eq!(up.adu_count, 3);

        let received = backend.process_incoming(&up.bytes, Some(&up.id)).await.unwrap();
        match received {
            Received::Accepted { new_adus, delivered, .. } => {
                assert_eq!(new_adus, 3);
                assert_eq!(delivered, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );

        // The backend answers with an ack-only bundle; the endpoint reclaims.
        let endpoint_peer = endpoint.peer_id();
        let down = backend.prepare_outgoing(&endpoint_peer).await.unwrap().unwrap();
        assert_eq!(down.adu_count, 0);
        let expected = endpoint.expected_downloads(&backend_peer).await.unwrap();
        assert_eq!(expected[0], down.id);

        match endpoint.process_incoming(&down.bytes, Some(&down.id)).await.unwrap() {
            Received::Accepted { ack, .. } => assert_eq!(ack.reclaimed_adus, 3),
            other => panic!("unexpected {other:?}"),
        }
        let cursor = endpoint.ledger().cursor(&backend_peer, &mail()).await.unwrap();
        assert_eq!(cursor.last_sent, 3);
        assert!(endpoint.pending_uploads(&backend_peer).await.unwrap().is_empty());

        // An ack-only bundle is not acknowledged in turn.
        assert!(endpoint.prepare_outgoing(&backend_peer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_without_callback() {
        let pair = memory_pair();
        let backend_peer = pair.backend.peer_id();
        let endpoint_peer = pair.endpoint.peer_id();
        pair.endpoint.enqueue(&backend_peer, &mail(), &b"polled"[..]).await.unwrap();
        let up = pair.endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap();

        match pair.backend.process_incoming(&up.bytes, None).await.unwrap() {
            Received::Accepted { delivered, .. } => assert_eq!(delivered, 0),
            other => panic!("unexpected {other:?}"),
        }
        let mut seen = Vec::new();
        let drained = pair
            .backend
            .drain(&endpoint_peer, |adu| seen.push(adu.data.clone()))
            .await
            .unwrap();
        assert_eq!(drained, 1);
        assert_eq!(seen, vec![Bytes::from_static(b"polled")]);
        assert_eq!(pair.backend.drain(&endpoint_peer, |_| {}).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent_until_state_changes() {
        let pair = memory_pair();
        let backend_peer = pair.backend.peer_id();
        pair.endpoint.enqueue(&backend_peer, &mail(), &b"hi"[..]).await.unwrap();

        let first = pair.endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap();
        let again = pair.endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap();
        assert!(again.reused);
        assert_eq!(first.id, again.id);
        assert_eq!(first.bytes, again.bytes);

        pair.endpoint.enqueue(&backend_peer, &mail(), &b"more"[..]).await.unwrap();
        let next = pair.endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap();
        assert!(!next.reused);
        assert_eq!(next.counter, 2);
        assert_eq!(next.adu_count, 2);
        assert_eq!(pair.endpoint.pending_uploads(&backend_peer).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_first_exchange_sends_empty_handshake_bundle() {
        let pair = memory_pair();
        let backend_peer = pair.backend.peer_id();
        let first = pair.endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap();
        assert_eq!(first.adu_count, 0);
        assert!(!pair
            .backend
            .process_incoming(&first.bytes, None)
            .await
            .unwrap()
            .is_duplicate());
    }

    #[tokio::test]
    async fn test_replayed_bundle_is_duplicate() {
        let pair = memory_pair();
        let backend_peer = pair.backend.peer_id();
        pair.endpoint.enqueue(&backend_peer, &mail(), &b"once"[..]).await.unwrap();
        let up = pair.endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap();

        pair.backend.process_incoming(&up.bytes, None).await.unwrap();
        let replay = pair.backend.process_incoming(&up.bytes, None).await.unwrap();
        assert!(replay.is_duplicate());
        let cursor = pair
            .backend
            .ledger()
            .cursor(&pair.endpoint.peer_id(), &mail())
            .await
            .unwrap();
        assert_eq!(cursor.last_received, 1);
    }

    /// What the next `absorb_bundle` call does instead of committing.
    #[derive(Clone, Copy)]
    enum Fault {
        None,
        Fail,
        Hang,
    }

    /// Memory store whose next absorb can be made to fail or never finish.
    struct FaultyStore {
        inner: MemoryStore,
        fault: Mutex<Fault>,
    }

    impl FaultyStore {
        fn new(fault: Fault) -> Self {
            Self {
                inner: MemoryStore::new(),
                fault: Mutex::new(fault),
            }
        }
    }

    #[async_trait::async_trait]
    impl Store for FaultyStore {
        async fn append_adu(&self, peer: &PeerId, app: &AppId, data: Bytes) -> StoreResult<Adu> {
            self.inner.append_adu(peer, app, data).await
        }

        async fn insert_received_adu(&self, adu: &Adu) -> StoreResult<InsertResult> {
            self.inner.insert_received_adu(adu).await
        }

        async fn read_adus(
            &self,
            side: LedgerSide,
            peer: &PeerId,
            app: &AppId,
            from: u64,
            to: u64,
            limit: usize,
        ) -> StoreResult<Vec<Adu>> {
            self.inner.read_adus(side, peer, app, from, to, limit).await
        }

        async fn get_cursor(&self, peer: &PeerId, app: &AppId) -> StoreResult<Option<LedgerCursor>> {
            self.inner.get_cursor(peer, app).await
        }

        async fn advance_cursor(
            &self,
            peer: &PeerId,
            app: &AppId,
            kind: CursorKind,
            up_to: u64,
        ) -> StoreResult<bool> {
            self.inner.advance_cursor(peer, app, kind, up_to).await
        }

        async fn delete_adus_up_to(
            &self,
            side: LedgerSide,
            peer: &PeerId,
            app: &AppId,
            up_to: u64,
        ) -> StoreResult<u64> {
            self.inner.delete_adus_up_to(side, peer, app, up_to).await
        }

        async fn list_peer_apps(&self) -> StoreResult<Vec<(PeerId, AppId)>> {
            self.inner.list_peer_apps().await
        }

        async fn get_counters(&self, peer: &PeerId, direction: Direction) -> StoreResult<BundleCounters> {
            self.inner.get_counters(peer, direction).await
        }

        async fn record_sent_bundle(&self, bundle: &SentBundle) -> StoreResult<()> {
            self.inner.record_sent_bundle(bundle).await
        }

        async fn record_received_bundle(
            &self,
            peer: &PeerId,
            direction: Direction,
            counter: u64,
            id: &EncryptedBundleId,
            carried_adus: bool,
        ) -> StoreResult<bool> {
            self.inner
                .record_received_bundle(peer, direction, counter, id, carried_adus)
                .await
        }

        async fn absorb_bundle(&self, bundle: &AbsorbedBundle) -> StoreResult<usize> {
            let fault = std::mem::replace(&mut *self.fault.lock().unwrap(), Fault::None);
            match fault {
                Fault::None => self.inner.absorb_bundle(bundle).await,
                Fault::Fail => Err(StoreError::Io(std::io::Error::other("disk full"))),
                Fault::Hang => std::future::pending().await,
            }
        }

        async fn outstanding_bundles(
            &self,
            peer: &PeerId,
            direction: Direction,
        ) -> StoreResult<Vec<SentBundle>> {
            self.inner.outstanding_bundles(peer, direction).await
        }

        async fn remove_acknowledged(
            &self,
            peer: &PeerId,
            direction: Direction,
            up_to: u64,
        ) -> StoreResult<Vec<SentBundle>> {
            self.inner.remove_acknowledged(peer, direction, up_to).await
        }

        async fn has_received_bundle(&self, id: &EncryptedBundleId) -> StoreResult<bool> {
            self.inner.has_received_bundle(id).await
        }

        async fn load_session(&self, peer: &PeerId) -> StoreResult<Option<Vec<u8>>> {
            self.inner.load_session(peer).await
        }

        async fn save_session(&self, peer: &PeerId, state: &[u8]) -> StoreResult<()> {
            self.inner.save_session(peer, state).await
        }

        async fn spool_put(&self, direction: Direction, id: &EncryptedBundleId, data: Bytes) -> StoreResult<()> {
            self.inner.spool_put(direction, id, data).await
        }

        async fn spool_get(&self, direction: Direction, id: &EncryptedBundleId) -> StoreResult<Option<Bytes>> {
            self.inner.spool_get(direction, id).await
        }

        async fn spool_delete(&self, direction: Direction, id: &EncryptedBundleId) -> StoreResult<bool> {
            self.inner.spool_delete(direction, id).await
        }

        async fn spool_list(&self, direction: Direction) -> StoreResult<Vec<EncryptedBundleId>> {
            self.inner.spool_list(direction).await
        }

        async fn add_route(&self, relay: &PeerId, peer: &PeerId) -> StoreResult<()> {
            self.inner.add_route(relay, peer).await
        }

        async fn routes_for(&self, relay: &PeerId) -> StoreResult<Vec<PeerId>> {
            self.inner.routes_for(relay).await
        }

        async fn put_recency_blob(&self, blob: &SignedRecencyBlob) -> StoreResult<()> {
            self.inner.put_recency_blob(blob).await
        }

        async fn get_recency_blob(&self) -> StoreResult<Option<SignedRecencyBlob>> {
            self.inner.get_recency_blob().await
        }

        async fn record_relay_recency(&self, relay: &PeerId, timestamp_ms: i64) -> StoreResult<()> {
            self.inner.record_relay_recency(relay, timestamp_ms).await
        }

        async fn list_relay_recency(&self) -> StoreResult<Vec<(PeerId, i64)>> {
            self.inner.list_relay_recency().await
        }
    }

    /// Upload three ADUs to a backend whose first absorb misbehaves, let
    /// `interrupt` run that first attempt, then replay the same bytes.
    async fn replay_after_interruption<F, Fut>(fault: Fault, interrupt: F)
    where
        F: FnOnce(Arc<Engine<FaultyStore>>, Bytes) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let (seen, sink) = collector();
        let pair = engines(
            FaultyStore::new(Fault::None),
            FaultyStore::new(fault),
            ExchangeConfig::default(),
        );
        let backend = Arc::new(pair.backend.with_delivery(sink));
        let endpoint = pair.endpoint;
        let backend_peer = backend.peer_id();
        let endpoint_peer = endpoint.peer_id();

        for body in [&b"one"[..], b"two", b"three"] {
            endpoint.enqueue(&backend_peer, &mail(), body.to_vec()).await.unwrap();
        }
        let up = endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap();

        interrupt(backend.clone(), up.bytes.clone()).await;
        assert!(seen.lock().unwrap().is_empty());
        let counters = backend
            .store()
            .get_counters(&endpoint_peer, Direction::Upstream)
            .await
            .unwrap();
        assert_eq!(counters.last_received_counter, 0);

        match backend.process_incoming(&up.bytes, Some(&up.id)).await.unwrap() {
            Received::Accepted { new_adus, delivered, .. } => {
                assert_eq!(new_adus, 3);
                assert_eq!(delivered, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(backend
            .process_incoming(&up.bytes, Some(&up.id))
            .await
            .unwrap()
            .is_duplicate());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );

        let down = backend.prepare_outgoing(&endpoint_peer).await.unwrap().unwrap();
        endpoint.process_incoming(&down.bytes, Some(&down.id)).await.unwrap();
        let cursor = endpoint.ledger().cursor(&backend_peer, &mail()).await.unwrap();
        assert_eq!(cursor.last_sent, 3);
        let received = backend.ledger().cursor(&endpoint_peer, &mail()).await.unwrap();
        assert_eq!(received.last_received, 3);
    }

    #[tokio::test]
    async fn test_failed_absorb_leaves_bundle_replayable() {
        replay_after_interruption(Fault::Fail, |backend, bytes| async move {
            let err = backend.process_incoming(&bytes, None).await.unwrap_err();
            assert!(matches!(err, SyncError::Store(_)));
        })
        .await;
    }

    #[tokio::test]
    async fn test_cancelled_absorb_leaves_bundle_replayable() {
        replay_after_interruption(Fault::Hang, |backend, bytes| async move {
            let attempt = tokio::time::timeout(
                std::time::Duration::from_millis(50),
                backend.process_incoming(&bytes, None),
            )
            .await;
            assert!(attempt.is_err());
        })
        .await;
    }

    #[tokio::test]
    async fn test_backend_cannot_start_a_session() {
        let pair = memory_pair();
        let err = pair
            .backend
            .prepare_outgoing(&pair.endpoint.peer_id())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_endpoint_rejects_unknown_sender() {
        let pair = memory_pair();
        let stranger = Engine::new(
            Arc::new(Identity::from_seed(&[5; 32])),
            Role::Endpoint,
            Arc::new(MemoryStore::new()),
            ExchangeConfig::default(),
        );
        stranger
            .register_peer(pair.endpoint.identity().pre_key_bundle())
            .unwrap();
        let bundle = stranger
            .prepare_outgoing(&pair.endpoint.peer_id())
            .await
            .unwrap()
            .unwrap();
        let err = pair.endpoint.process_incoming(&bundle.bytes, None).await.unwrap_err();
        assert!(err.is_bundle_local());
    }

    #[tokio::test]
    async fn test_payload_budget_splits_bundles() {
        let config = ExchangeConfig {
            max_payload_bytes: 10,
            ..Default::default()
        };
        let pair = engines(MemoryStore::new(), MemoryStore::new(), config);
        let backend_peer = pair.backend.peer_id();
        for _ in 0..3 {
            pair.endpoint.enqueue(&backend_peer, &mail(), vec![0u8; 6]).await.unwrap();
        }
        let first = pair.endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap();
        assert_eq!(first.adu_count, 1);

        // An ADU larger than the whole budget still goes out alone.
        let chat = AppId::new("chat").unwrap();
        let pair = engines(
            MemoryStore::new(),
            MemoryStore::new(),
            ExchangeConfig {
                max_payload_bytes: 10,
                ..Default::default()
            },
        );
        pair.endpoint.enqueue(&backend_peer, &chat, vec![0u8; 64]).await.unwrap();
        let big = pair.endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap();
        assert_eq!(big.adu_count, 1);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint_path = dir.path().join("endpoint.db");
        let backend_path = dir.path().join("backend.db");
        let backend_identity = Arc::new(Identity::from_seed(&[2; 32]));
        let endpoint_identity = Arc::new(Identity::from_seed(&[1; 32]));
        let backend_peer = backend_identity.peer_id();

        let open_endpoint = || {
            let engine = Engine::new(
                endpoint_identity.clone(),
                Role::Endpoint,
                Arc::new(SqliteStore::open(&endpoint_path).unwrap()),
                ExchangeConfig::default(),
            );
            engine.register_peer(backend_identity.pre_key_bundle()).unwrap();
            engine
        };
        let backend = Engine::new(
            backend_identity.clone(),
            Role::Backend,
            Arc::new(SqliteStore::open(&backend_path).unwrap()),
            ExchangeConfig::default(),
        );

        let first_id = {
            let endpoint = open_endpoint();
            endpoint.enqueue(&backend_peer, &mail(), &b"persisted"[..]).await.unwrap();
            endpoint.prepare_outgoing(&backend_peer).await.unwrap().unwrap().id
        };

        let endpoint = open_endpoint();
        let pending = endpoint.pending_uploads(&backend_peer).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first_id);
        assert!(!backend
            .process_incoming(&pending[0].bytes, Some(&first_id))
            .await
            .unwrap()
            .is_duplicate());
    }
}
