//! Exchange orchestration.
//!
//! One call drives one exchange attempt against one counterpart:
//!
//! * endpoint: `Idle → Uploading → Downloading → Complete | Failed`
//! * relay:    `Idle → Reconciling → Uploading → Downloading → Complete | Failed`
//!
//! Every transfer runs under `transfer_timeout` and can be cancelled. Local
//! state is only touched after a transfer finished, so a timeout or a
//! cancellation leaves everything unacknowledged and a later attempt resends
//! the same data.
//!
//! Failures contained to one bundle (integrity, crypto) are counted and the
//! attempt carries on. Transport and store failures fail the attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use bundlenet_core::{
    now_millis, select_freshest, Direction, EncryptedBundleId, PeerId, RecencyPolicy,
    SignedRecencyBlob,
};
use bundlenet_store::Store;

use crate::engine::{Engine, Received};
use crate::error::{Result, SyncError};
use crate::messages::{DownloadRequest, RecencyRequest, UploadHeader, UploadStatus};
use crate::service::RelayService;
use crate::transport::{ByteStream, Transport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeState {
    #[default]
    Idle,
    Reconciling,
    Uploading,
    Downloading,
    Complete,
    Failed,
}

/// Progress notifications emitted during an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    StateChanged {
        from: ExchangeState,
        to: ExchangeState,
    },
    BundleUploaded {
        id: EncryptedBundleId,
        status: UploadStatus,
    },
    BundleDownloaded {
        id: EncryptedBundleId,
        duplicate: bool,
    },
    /// Dropped for an integrity or cryptographic failure.
    BundleRejected {
        id: EncryptedBundleId,
        reason: String,
    },
    BundleDeleted {
        id: EncryptedBundleId,
    },
    /// A probed id the counterpart does not hold.
    ProbeMissed {
        id: EncryptedBundleId,
    },
}

/// Outcome of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeReport {
    pub state: ExchangeState,
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    /// Why the attempt failed, if it did.
    pub error: Option<String>,
}

impl ExchangeReport {
    pub fn is_complete(&self) -> bool {
        self.state == ExchangeState::Complete
    }
}

/// Event callback for one attempt.
pub type EventHook<'a> = Box<dyn FnMut(&ExchangeEvent) + Send + 'a>;

/// Raises cancellation for every [`CancelSignal`] cloned from it.
#[derive(Debug)]
pub struct Canceller(watch::Sender<bool>);

/// Cooperative cancellation observed between and during transfers.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

/// A linked canceller and signal.
pub fn cancellation() -> (Canceller, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (Canceller(tx), CancelSignal(rx))
}

impl Canceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        CancelSignal(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            // Canceller dropped without firing.
            std::future::pending::<()>().await;
        }
    }
}

/// Per-attempt collaborators beyond the link itself.
pub struct ExchangeOptions<'a> {
    pub on_event: Option<EventHook<'a>>,
    pub cancel: CancelSignal,
}

impl Default for ExchangeOptions<'_> {
    fn default() -> Self {
        Self {
            on_event: None,
            cancel: CancelSignal::never(),
        }
    }
}

impl<'a> ExchangeOptions<'a> {
    pub fn on_event(mut self, hook: impl FnMut(&ExchangeEvent) + Send + 'a) -> Self {
        self.on_event = Some(Box::new(hook));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

struct Attempt<'a> {
    report: ExchangeReport,
    on_event: Option<EventHook<'a>>,
    cancel: CancelSignal,
    timeout: Duration,
}

impl<'a> Attempt<'a> {
    fn new(options: ExchangeOptions<'a>, timeout: Duration) -> Self {
        Self {
            report: ExchangeReport::default(),
            on_event: options.on_event,
            cancel: options.cancel,
            timeout,
        }
    }

    fn emit(&mut self, event: ExchangeEvent) {
        match &event {
            ExchangeEvent::StateChanged { to, .. } => self.report.state = *to,
            ExchangeEvent::BundleUploaded { status, .. } => match status {
                UploadStatus::Rejected(_) => self.report.rejected += 1,
                UploadStatus::Duplicate => {
                    self.report.uploaded += 1;
                    self.report.duplicates += 1;
                }
                UploadStatus::Stored | UploadStatus::Accepted => self.report.uploaded += 1,
            },
            ExchangeEvent::BundleDownloaded { duplicate, .. } => {
                self.report.downloaded += 1;
                if *duplicate {
                    self.report.duplicates += 1;
                }
            }
            ExchangeEvent::BundleRejected { .. } => self.report.rejected += 1,
            ExchangeEvent::BundleDeleted { .. } => self.report.deleted += 1,
            ExchangeEvent::ProbeMissed { .. } => {}
        }
        if let Some(hook) = self.on_event.as_mut() {
            hook(&event);
        }
    }

    fn transition(&mut self, to: ExchangeState) {
        let from = self.report.state;
        debug!(?from, ?to, "exchange state");
        self.emit(ExchangeEvent::StateChanged { from, to });
    }

    fn reject(&mut self, id: EncryptedBundleId, error: &SyncError) {
        warn!(id = %id, error = %error, "dropped bundle");
        self.emit(ExchangeEvent::BundleRejected {
            id,
            reason: error.to_string(),
        });
    }

    /// Run one transfer under the attempt's timeout and cancellation.
    async fn transfer<T>(&mut self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let limit = self.timeout;
        let mut cancel = self.cancel.clone();
        tokio::select! {
            outcome = tokio::time::timeout(limit, fut) => {
                outcome.map_err(|_| SyncError::Timeout(limit))?
            }
            () = cancel.cancelled() => Err(SyncError::Cancelled),
        }
    }

    fn finish(mut self, outcome: Result<()>) -> ExchangeReport {
        match outcome {
            Ok(()) => self.transition(ExchangeState::Complete),
            Err(e) => {
                warn!(error = %e, "exchange failed");
                self.report.error = Some(e.to_string());
                self.transition(ExchangeState::Failed);
            }
        }
        info!(
            state = ?self.report.state,
            uploaded = self.report.uploaded,
            downloaded = self.report.downloaded,
            deleted = self.report.deleted,
            rejected = self.report.rejected,
            duplicates = self.report.duplicates,
            "exchange finished"
        );
        self.report
    }
}

/// Exchange between an endpoint and the link towards `backend` (the backend
/// itself or a relay).
pub async fn run_endpoint_exchange<S, T>(
    engine: &Engine<S>,
    link: &T,
    backend: &PeerId,
    options: ExchangeOptions<'_>,
) -> ExchangeReport
where
    S: Store,
    T: Transport + ?Sized,
{
    let mut attempt = Attempt::new(options, engine.config().transfer_timeout);
    let outcome = endpoint_phases(engine, link, backend, &mut attempt).await;
    attempt.finish(outcome)
}

async fn endpoint_phases<S, T>(
    engine: &Engine<S>,
    link: &T,
    backend: &PeerId,
    attempt: &mut Attempt<'_>,
) -> Result<()>
where
    S: Store,
    T: Transport + ?Sized,
{
    let config = engine.config().clone();

    attempt.transition(ExchangeState::Uploading);
    engine.prepare_outgoing(backend).await?;
    for bundle in engine.pending_uploads(backend).await? {
        let header = UploadHeader {
            bundle_id: bundle.id.clone(),
            sender: engine.peer_id(),
        };
        let stream = ByteStream::from_bytes(bundle.bytes, config.chunk_size);
        let ack = attempt.transfer(link.upload(header, stream)).await?;
        debug!(id = %bundle.id, counter = bundle.counter, status = ?ack.status, "uploaded bundle");
        attempt.emit(ExchangeEvent::BundleUploaded {
            id: bundle.id,
            status: ack.status,
        });
    }

    attempt.transition(ExchangeState::Downloading);
    for id in engine.expected_downloads(backend).await? {
        let request = DownloadRequest {
            bundle_id: id.clone(),
            requester: engine.peer_id(),
        };
        let Some(stream) = attempt.transfer(link.download(request)).await? else {
            debug!(id = %id, "probe found nothing");
            attempt.emit(ExchangeEvent::ProbeMissed { id });
            continue;
        };
        let container = match attempt.transfer(stream.read_container(config.max_bundle_bytes)).await {
            Ok(container) => container,
            Err(e) if e.is_bundle_local() => {
                attempt.reject(id, &e);
                continue;
            }
            Err(e) => return Err(e),
        };
        match engine.process_container(&container, Some(&id)).await {
            Ok(received) => attempt.emit(ExchangeEvent::BundleDownloaded {
                id,
                duplicate: matches!(received, Received::Duplicate { .. }),
            }),
            Err(e) if e.is_bundle_local() => attempt.reject(id, &e),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Exchange between a relay and the backend.
///
/// Reconciles inventories, drops what the backend reports stale, forwards
/// held endpoint bundles, fetches backend bundles for routed endpoints and
/// refreshes the cached recency blob. Each bundle transfer is independent;
/// a failed one is remembered and fails the attempt once the rest are done.
pub async fn run_relay_exchange<S, T>(
    relay: &RelayService<S>,
    backend: &T,
    options: ExchangeOptions<'_>,
) -> ExchangeReport
where
    S: Store,
    T: Transport + ?Sized,
{
    let mut attempt = Attempt::new(options, relay.config().transfer_timeout);
    let outcome = relay_phases(relay, backend, &mut attempt).await;
    attempt.finish(outcome)
}

async fn relay_phases<S, T>(
    relay: &RelayService<S>,
    backend: &T,
    attempt: &mut Attempt<'_>,
) -> Result<()>
where
    S: Store,
    T: Transport + ?Sized,
{
    let store = relay.store();
    let config = relay.config().clone();

    attempt.transition(ExchangeState::Reconciling);
    let request = relay.inventory_request().await?;
    let plan = attempt.transfer(backend.inventory(request)).await?;
    for id in plan.to_delete {
        if relay.discard(&id).await? {
            attempt.emit(ExchangeEvent::BundleDeleted { id });
        }
    }

    let mut first_failure: Option<SyncError> = None;

    attempt.transition(ExchangeState::Uploading);
    for id in plan.to_download {
        let Some(bytes) = store.spool_get(Direction::Upstream, &id).await? else {
            warn!(id = %id, "backend asked for a bundle no longer held");
            continue;
        };
        let header = UploadHeader {
            bundle_id: id.clone(),
            sender: relay.peer_id(),
        };
        let stream = ByteStream::from_bytes(bytes, config.chunk_size);
        match attempt.transfer(backend.upload(header, stream)).await {
            Ok(ack) => {
                if let UploadStatus::Rejected(reason) = &ack.status {
                    warn!(
                        id = %id,
                        relay = %relay.peer_id(),
                        reason = %reason,
                        "backend rejected forwarded bundle, deleting relay copy"
                    );
                }
                store.spool_delete(Direction::Upstream, &id).await?;
                attempt.emit(ExchangeEvent::BundleUploaded {
                    id,
                    status: ack.status,
                });
            }
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => {
                warn!(id = %id, error = %e, "forwarding bundle failed");
                first_failure.get_or_insert(e);
            }
        }
    }

    attempt.transition(ExchangeState::Downloading);
    for id in plan.to_upload {
        let request = DownloadRequest {
            bundle_id: id.clone(),
            requester: relay.peer_id(),
        };
        let fetched = match attempt.transfer(backend.download(request)).await {
            Ok(Some(stream)) => attempt
                .transfer(stream.read_container(config.max_bundle_bytes))
                .await
                .map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        match fetched {
            Ok(Some(container)) => {
                store
                    .spool_put(Direction::Downstream, &id, container.to_bytes().into())
                    .await?;
                attempt.emit(ExchangeEvent::BundleDownloaded {
                    id,
                    duplicate: false,
                });
            }
            Ok(None) => {
                debug!(id = %id, "backend no longer holds bundle");
                attempt.emit(ExchangeEvent::ProbeMissed { id });
            }
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) if e.is_bundle_local() => attempt.reject(id, &e),
            Err(e) => {
                warn!(id = %id, error = %e, "fetching bundle failed");
                first_failure.get_or_insert(e);
            }
        }
    }

    let request = RecencyRequest {
        requester: relay.peer_id(),
    };
    match attempt.transfer(backend.recency(request)).await {
        Ok(response) => {
            if let Some(blob) = response.blob {
                relay.cache_recency(&blob).await?;
            }
        }
        Err(e) => warn!(error = %e, "could not refresh recency blob"),
    }

    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Ask one relay for its cached recency blob and check it against `policy`.
///
/// An invalid or missing blob is not an error: the relay is just not a
/// candidate. Accepted timestamps are remembered per relay.
pub async fn probe_recency<S, T>(
    engine: &Engine<S>,
    relay: &T,
    policy: &RecencyPolicy,
) -> Result<Option<(PeerId, SignedRecencyBlob)>>
where
    S: Store,
    T: Transport + ?Sized,
{
    let limit = engine.config().transfer_timeout;
    let request = RecencyRequest {
        requester: engine.peer_id(),
    };
    let response = tokio::time::timeout(limit, relay.recency(request))
        .await
        .map_err(|_| SyncError::Timeout(limit))??;
    let Some(blob) = response.blob else {
        debug!(relay = %response.responder, "relay has no recency blob");
        return Ok(None);
    };
    if let Err(e) = blob.verify(policy, now_millis()) {
        warn!(relay = %response.responder, error = %e, "ignoring recency blob");
        return Ok(None);
    }
    engine
        .store()
        .record_relay_recency(&response.responder, blob.blob.timestamp_ms)
        .await?;
    Ok(Some((response.responder, blob)))
}

/// Pick the reachable relay whose recency blob from `backend` is freshest.
///
/// Relays that cannot be reached or return an unacceptable blob are skipped.
pub async fn select_relay<K, S, T>(
    engine: &Engine<S>,
    backend: &PeerId,
    relays: &[(K, &T)],
) -> Result<Option<K>>
where
    K: Clone,
    S: Store,
    T: Transport + ?Sized,
{
    let policy = engine.recency_policy(backend)?;
    let mut candidates = Vec::new();
    for (key, link) in relays {
        match probe_recency(engine, *link, &policy).await {
            Ok(Some((_, blob))) => candidates.push((key.clone(), blob)),
            Ok(None) => {}
            Err(e) if matches!(e, SyncError::Store(_)) => return Err(e),
            Err(e) => debug!(error = %e, "relay unreachable for recency"),
        }
    }
    Ok(select_freshest(candidates, &policy, now_millis()))
}
