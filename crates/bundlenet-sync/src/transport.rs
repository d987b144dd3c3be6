//! Transfer abstraction for bundle exchange.
//!
//! A [`Transport`] is the client end of one point-to-point link: it uploads
//! bundle streams, downloads them by id and carries the inventory and
//! recency RPCs. An [`ExchangeService`] is the serving end. Any RPC system
//! with client- and server-streaming calls can sit in between; the
//! in-memory transport here connects the two directly.

use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use bundlenet_core::{Container, ContainerReader};

use crate::error::{Result, SyncError};
use crate::messages::{
    decode_message, encode_message, DownloadRequest, InventoryRequest, InventoryResponse,
    RecencyRequest, RecencyResponse, UploadAck, UploadHeader,
};

/// A chunked byte stream with a declared total length.
pub struct ByteStream {
    declared_len: u64,
    rx: mpsc::Receiver<Result<Bytes>>,
}

/// Producer half of a [`ByteStream`].
pub struct ByteSink {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl ByteStream {
    /// Create a stream fed by the returned sink.
    pub fn channel(declared_len: u64, buffer: usize) -> (ByteSink, ByteStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (ByteSink { tx }, ByteStream { declared_len, rx })
    }

    /// Stream an in-memory buffer in `chunk_size` pieces.
    pub fn from_bytes(bytes: Bytes, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks = bytes.len().div_ceil(chunk_size).max(1);
        let (tx, rx) = mpsc::channel(chunks);
        let mut offset = 0;
        while offset < bytes.len() {
            let end = (offset + chunk_size).min(bytes.len());
            // Capacity covers every chunk, so this cannot be full.
            let _ = tx.try_send(Ok(bytes.slice(offset..end)));
            offset = end;
        }
        Self {
            declared_len: bytes.len() as u64,
            rx,
        }
    }

    pub fn declared_len(&self) -> u64 {
        self.declared_len
    }

    /// Next chunk, or `None` once the producer is done.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await
    }

    /// Read the whole stream, refusing anything declared above `max`.
    ///
    /// A stream that ends short of its declared length is a transport
    /// failure: the producer went away mid-transfer.
    pub async fn collect(mut self, max: u64) -> Result<Bytes> {
        if self.declared_len > max {
            return Err(SyncError::BundleTooLarge {
                len: self.declared_len,
                max,
            });
        }
        let mut buf = Vec::with_capacity(self.declared_len as usize);
        while let Some(chunk) = self.rx.recv().await {
            let chunk = chunk?;
            if (buf.len() + chunk.len()) as u64 > self.declared_len {
                return Err(SyncError::Transport(format!(
                    "stream longer than declared {} bytes",
                    self.declared_len
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        if buf.len() as u64 != self.declared_len {
            return Err(SyncError::Transport(format!(
                "stream ended after {} of {} bytes",
                buf.len(),
                self.declared_len
            )));
        }
        Ok(Bytes::from(buf))
    }
}

/// Blocking [`Read`] over chunks handed across from the async side.
///
/// Only used on a blocking thread; end of input is the sender going away.
struct ChunkReader {
    rx: mpsc::Receiver<Bytes>,
    chunk: Bytes,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while !self.chunk.has_remaining() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.chunk = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len());
        buf[..n].copy_from_slice(&self.chunk[..n]);
        self.chunk.advance(n);
        Ok(n)
    }
}

impl ByteStream {
    /// Read the stream as a bundle container.
    ///
    /// Chunks are fed to a [`ContainerReader`] as they arrive, so each
    /// entry's digest is checked before the next one is pulled and a corrupt
    /// bundle is refused without waiting for the rest of it. The producer is
    /// never read further than one chunk ahead of the reader.
    pub async fn read_container(mut self, max: u64) -> Result<Container> {
        if self.declared_len > max {
            return Err(SyncError::BundleTooLarge {
                len: self.declared_len,
                max,
            });
        }
        let (tx, rx) = mpsc::channel(1);
        let parser = tokio::task::spawn_blocking(move || {
            ContainerReader::new(ChunkReader {
                rx,
                chunk: Bytes::new(),
            })?
            .read_all()
        });

        let mut received = 0u64;
        let mut failure = None;
        loop {
            match self.rx.recv().await {
                Some(Ok(chunk)) => {
                    received += chunk.len() as u64;
                    if received > self.declared_len {
                        failure = Some(SyncError::Transport(format!(
                            "stream longer than declared {} bytes",
                            self.declared_len
                        )));
                        break;
                    }
                    // A closed channel means the reader already failed.
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                None => {
                    if received != self.declared_len {
                        failure = Some(SyncError::Transport(format!(
                            "stream ended after {received} of {} bytes",
                            self.declared_len
                        )));
                    }
                    break;
                }
            }
        }
        drop(tx);

        let parsed = parser
            .await
            .map_err(|e| SyncError::Transport(format!("container reader stopped: {e}")))?;
        match failure {
            Some(e) => Err(e),
            None => Ok(parsed?),
        }
    }
}

impl ByteSink {
    /// Send one chunk. Fails with `Cancelled` if the reader went away.
    pub async fn send(&self, chunk: Bytes) -> Result<()> {
        self.tx.send(Ok(chunk)).await.map_err(|_| SyncError::Cancelled)
    }

    /// Abort the stream with an error for the reader.
    pub async fn fail(self, error: SyncError) {
        let _ = self.tx.send(Err(error)).await;
    }
}

/// Client end of a link to a relay or backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Push one bundle to the counterpart.
    async fn upload(&self, header: UploadHeader, stream: ByteStream) -> Result<UploadAck>;

    /// Fetch a bundle by id. `None` means the counterpart does not hold it.
    async fn download(&self, request: DownloadRequest) -> Result<Option<ByteStream>>;

    /// Relay to backend: reconcile held bundle ids.
    async fn inventory(&self, request: InventoryRequest) -> Result<InventoryResponse>;

    async fn recency(&self, request: RecencyRequest) -> Result<RecencyResponse>;
}

/// Serving end of a link.
#[async_trait]
pub trait ExchangeService: Send + Sync {
    async fn handle_upload(&self, header: UploadHeader, stream: ByteStream) -> Result<UploadAck>;

    async fn handle_download(&self, request: DownloadRequest) -> Result<Option<ByteStream>>;

    async fn handle_inventory(&self, request: InventoryRequest) -> Result<InventoryResponse>;

    async fn handle_recency(&self, request: RecencyRequest) -> Result<RecencyResponse>;
}

/// Faults injected by [`MemoryTransport`].
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Cut bundle streams after this many chunks.
    pub truncate_after_chunks: Option<usize>,
    /// Fail every call with a transport error.
    pub disconnected: bool,
    /// Delay every call by this much.
    pub latency: Option<Duration>,
}

/// Cut `stream` after `chunks` chunks, then fail it like a dropped link.
fn truncate(mut stream: ByteStream, chunks: usize) -> ByteStream {
    let (sink, out) = ByteStream::channel(stream.declared_len(), 4);
    tokio::spawn(async move {
        for _ in 0..chunks {
            match stream.next_chunk().await {
                Some(Ok(chunk)) => {
                    if sink.send(chunk).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    sink.fail(e).await;
                    return;
                }
                None => return,
            }
        }
        sink.fail(SyncError::Transport("connection reset".into())).await;
    });
    out
}

/// In-process transport wired straight to a service.
///
/// Control messages go through their CBOR encoding so the wire form is
/// exercised. Faults can be injected for tests.
pub struct MemoryTransport {
    service: Arc<dyn ExchangeService>,
    faults: Mutex<FaultPlan>,
}

impl MemoryTransport {
    pub fn new(service: Arc<dyn ExchangeService>) -> Self {
        Self {
            service,
            faults: Mutex::new(FaultPlan::default()),
        }
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults = plan;
        }
    }

    /// Remove all injected faults.
    pub fn heal(&self) {
        self.set_faults(FaultPlan::default());
    }

    async fn before_call(&self) -> Result<FaultPlan> {
        let plan = self.faults.lock().map(|f| f.clone()).unwrap_or_default();
        if let Some(latency) = plan.latency {
            tokio::time::sleep(latency).await;
        }
        if plan.disconnected {
            return Err(SyncError::Transport("link down".into()));
        }
        Ok(plan)
    }
}

fn over_the_wire<T>(message: &T) -> Result<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    decode_message(&encode_message(message)?)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn upload(&self, header: UploadHeader, stream: ByteStream) -> Result<UploadAck> {
        let plan = self.before_call().await?;
        let stream = match plan.truncate_after_chunks {
            Some(n) => truncate(stream, n),
            None => stream,
        };
        let ack = self.service.handle_upload(over_the_wire(&header)?, stream).await?;
        over_the_wire(&ack)
    }

    async fn download(&self, request: DownloadRequest) -> Result<Option<ByteStream>> {
        let plan = self.before_call().await?;
        let stream = self.service.handle_download(over_the_wire(&request)?).await?;
        Ok(match (stream, plan.truncate_after_chunks) {
            (Some(stream), Some(n)) => Some(truncate(stream, n)),
            (stream, _) => stream,
        })
    }

    async fn inventory(&self, request: InventoryRequest) -> Result<InventoryResponse> {
        self.before_call().await?;
        let response = self
            .service
            .handle_inventory(over_the_wire(&request)?)
            .await?;
        over_the_wire(&response)
    }

    async fn recency(&self, request: RecencyRequest) -> Result<RecencyResponse> {
        self.before_call().await?;
        let response = self.service.handle_recency(over_the_wire(&request)?).await?;
        over_the_wire(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::UploadStatus;
    use bundlenet_core::{EncryptedBundleId, PeerId};

    /// Collects uploads and serves them back.
    #[derive(Default)]
    struct EchoService {
        held: Mutex<Option<Bytes>>,
    }

    #[async_trait]
    impl ExchangeService for EchoService {
        async fn handle_upload(&self, header: UploadHeader, stream: ByteStream) -> Result<UploadAck> {
            let bytes = stream.collect(1024).await?;
            *self.held.lock().unwrap() = Some(bytes);
            Ok(UploadAck {
                bundle_id: header.bundle_id,
                status: UploadStatus::Stored,
            })
        }

        async fn handle_download(&self, _: DownloadRequest) -> Result<Option<ByteStream>> {
            Ok(self
                .held
                .lock()
                .unwrap()
                .clone()
                .map(|b| ByteStream::from_bytes(b, 3)))
        }

        async fn handle_inventory(&self, _: InventoryRequest) -> Result<InventoryResponse> {
            Ok(InventoryResponse::default())
        }

        async fn handle_recency(&self, request: RecencyRequest) -> Result<RecencyResponse> {
            Ok(RecencyResponse {
                responder: request.requester,
                blob: None,
            })
        }
    }

    fn header() -> UploadHeader {
        UploadHeader {
            bundle_id: EncryptedBundleId::parse("abc").unwrap(),
            sender: PeerId::from_bytes([1; 32]),
        }
    }

    fn download() -> DownloadRequest {
        DownloadRequest {
            bundle_id: EncryptedBundleId::parse("abc").unwrap(),
            requester: PeerId::from_bytes([1; 32]),
        }
    }

    #[tokio::test]
    async fn test_chunked_stream_collects() {
        let stream = ByteStream::from_bytes(Bytes::from_static(b"hello world"), 4);
        assert_eq!(stream.declared_len(), 11);
        assert_eq!(stream.collect(100).await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_empty_stream_collects() {
        let stream = ByteStream::from_bytes(Bytes::new(), 4);
        assert!(stream.collect(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_stream_refused() {
        let stream = ByteStream::from_bytes(Bytes::from(vec![0u8; 64]), 8);
        assert!(matches!(
            stream.collect(10).await,
            Err(SyncError::BundleTooLarge { len: 64, max: 10 })
        ));
    }

    #[tokio::test]
    async fn test_short_stream_is_transport_error() {
        let (sink, stream) = ByteStream::channel(10, 2);
        sink.send(Bytes::from_static(b"12345")).await.unwrap();
        drop(sink);
        assert!(matches!(stream.collect(100).await, Err(SyncError::Transport(_))));
    }

    #[tokio::test]
    async fn test_container_read_across_many_chunks() {
        let bytes = bundlenet_core::pack([
            ("payload", vec![7u8; 100_000]),
            ("bundle.id", b"abc".to_vec()),
        ])
        .unwrap();
        let stream = ByteStream::from_bytes(Bytes::from(bytes.clone()), 4096);
        let container = stream.read_container(1 << 20).await.unwrap();
        assert_eq!(container.get("payload").unwrap().len(), 100_000);
        assert_eq!(container.to_bytes(), bytes);
    }

    #[tokio::test]
    async fn test_corrupt_entry_refused_before_stream_ends() {
        let first = vec![1u8; 8 * 1024];
        let second = vec![2u8; 64 * 1024];
        let mut bytes = bundlenet_core::pack([("first", first.clone()), ("second", second.clone())])
            .unwrap();
        let body_start = bytes.len() - first.len() - second.len();
        bytes[body_start] ^= 0xff;

        let chunk = 1024;
        let total_chunks = bytes.len().div_ceil(chunk);
        let (sink, stream) = ByteStream::channel(bytes.len() as u64, 1);
        let producer = tokio::spawn(async move {
            let mut sent = 0;
            for piece in bytes.chunks(chunk) {
                if sink.send(Bytes::copy_from_slice(piece)).await.is_err() {
                    break;
                }
                sent += 1;
            }
            sent
        });

        let err = stream.read_container(1 << 20).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Core(bundlenet_core::CoreError::Integrity { ref entry }) if entry == "first"
        ));
        let sent = producer.await.unwrap();
        assert!(sent < total_chunks, "sent {sent} of {total_chunks} chunks");
    }

    #[tokio::test]
    async fn test_short_container_stream_is_transport_error() {
        let (sink, stream) = ByteStream::channel(64, 2);
        sink.send(Bytes::from_static(b"BNDL")).await.unwrap();
        drop(sink);
        assert!(matches!(
            stream.read_container(100).await,
            Err(SyncError::Transport(_))
        ));
        let oversized = ByteStream::from_bytes(Bytes::from(vec![0u8; 64]), 8);
        assert!(matches!(
            oversized.read_container(10).await,
            Err(SyncError::BundleTooLarge { len: 64, max: 10 })
        ));
    }

    #[tokio::test]
    async fn test_memory_transport_round_trip() {
        let transport = MemoryTransport::new(Arc::new(EchoService::default()));
        let ack = transport
            .upload(header(), ByteStream::from_bytes(Bytes::from_static(b"bundle"), 2))
            .await
            .unwrap();
        assert_eq!(ack.status, UploadStatus::Stored);

        let stream = transport.download(download()).await.unwrap().unwrap();
        assert_eq!(stream.collect(100).await.unwrap(), Bytes::from_static(b"bundle"));
    }

    #[tokio::test]
    async fn test_truncation_fault_fails_upload() {
        let service = Arc::new(EchoService::default());
        let transport = MemoryTransport::new(service.clone());
        transport.set_faults(FaultPlan {
            truncate_after_chunks: Some(1),
            ..Default::default()
        });
        let result = transport
            .upload(header(), ByteStream::from_bytes(Bytes::from_static(b"bundle"), 2))
            .await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
        assert!(service.held.lock().unwrap().is_none());

        transport.heal();
        assert!(transport
            .upload(header(), ByteStream::from_bytes(Bytes::from_static(b"bundle"), 2))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_disconnected_fault() {
        let transport = MemoryTransport::new(Arc::new(EchoService::default()));
        transport.set_faults(FaultPlan {
            disconnected: true,
            ..Default::default()
        });
        assert!(transport.download(download()).await.is_err());
    }
}
