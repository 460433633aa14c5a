use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::network::Connection;
use crate::network::DuplexStream;
use crate::network::Headers;
use crate::network::ListenRequest;
use crate::network::WatchChange;
use crate::network::WriteRequest;
use crate::network::WriteResponse;
use crate::Document;
use crate::DocumentKey;
use crate::DocumentMap;
use crate::Error;
use crate::Result;
use crate::SnapshotVersion;
use crate::StatusError;

/// How long a test waits for the client to open a stream or send a request.
pub const FAKE_BACKEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend side of one stream opened by the client.
pub struct FakeStream<Req, Resp> {
    pub headers: Headers,
    requests: mpsc::UnboundedReceiver<Req>,
    responses: mpsc::Sender<std::result::Result<Resp, StatusError>>,
}

impl<Req, Resp> FakeStream<Req, Resp> {
    /// Next message the client sent. Panics if none arrives in time.
    pub async fn next_request(&mut self) -> Req {
        timeout(FAKE_BACKEND_TIMEOUT, self.requests.recv())
            .await
            .expect("client sent no request in time")
            .expect("client closed the stream")
    }

    pub fn try_next_request(&mut self) -> Option<Req> {
        self.requests.try_recv().ok()
    }

    pub async fn respond(
        &self,
        response: Resp,
    ) {
        self.responses.send(Ok(response)).await.expect("client dropped the stream");
    }

    /// Closes the stream with `status`.
    pub async fn fail(
        &self,
        status: StatusError,
    ) {
        let _ = self.responses.send(Err(status)).await;
    }

    /// Client side still holds the stream.
    pub fn is_open(&self) -> bool {
        !self.responses.is_closed()
    }
}

pub type FakeWatchStream = FakeStream<ListenRequest, WatchChange>;
pub type FakeWriteStream = FakeStream<WriteRequest, WriteResponse>;

/// In-process [`Connection`] scripted by the test.
///
/// Every stream the client opens is handed to the test through
/// [`next_watch_stream`](Self::next_watch_stream) and
/// [`next_write_stream`](Self::next_write_stream). Unary reads are served
/// from a document map.
pub struct FakeBackend {
    watch_tx: mpsc::UnboundedSender<FakeWatchStream>,
    watch_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeWatchStream>>,
    write_tx: mpsc::UnboundedSender<FakeWriteStream>,
    write_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeWriteStream>>,
    documents: Mutex<DocumentMap>,
    batch_get_failures: Mutex<VecDeque<StatusError>>,
    batch_get_calls: AtomicUsize,
    open_failures: Mutex<VecDeque<StatusError>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            watch_tx,
            watch_rx: tokio::sync::Mutex::new(watch_rx),
            write_tx,
            write_rx: tokio::sync::Mutex::new(write_rx),
            documents: Mutex::new(DocumentMap::new()),
            batch_get_failures: Mutex::new(VecDeque::new()),
            batch_get_calls: AtomicUsize::new(0),
            open_failures: Mutex::new(VecDeque::new()),
        })
    }

    pub async fn next_watch_stream(&self) -> FakeWatchStream {
        timeout(FAKE_BACKEND_TIMEOUT, self.watch_rx.lock().await.recv())
            .await
            .expect("client opened no watch stream in time")
            .expect("fake backend dropped")
    }

    pub async fn next_write_stream(&self) -> FakeWriteStream {
        timeout(FAKE_BACKEND_TIMEOUT, self.write_rx.lock().await.recv())
            .await
            .expect("client opened no write stream in time")
            .expect("fake backend dropped")
    }

    /// Stores `document` for unary reads.
    pub fn put_document(
        &self,
        document: Document,
    ) {
        self.documents.lock().insert(document.key().clone(), document);
    }

    /// The next unary reads fail with the queued statuses, oldest first.
    pub fn fail_batch_get(
        &self,
        status: StatusError,
    ) {
        self.batch_get_failures.lock().push_back(status);
    }

    /// The next stream opens fail with the queued statuses, oldest first.
    pub fn fail_open(
        &self,
        status: StatusError,
    ) {
        self.open_failures.lock().push_back(status);
    }

    pub fn batch_get_calls(&self) -> usize {
        self.batch_get_calls.load(Ordering::SeqCst)
    }

    fn open<Req, Resp>(
        &self,
        headers: Headers,
        sink: &mpsc::UnboundedSender<FakeStream<Req, Resp>>,
    ) -> Result<DuplexStream<Req, Resp>> {
        if let Some(status) = self.open_failures.lock().pop_front() {
            return Err(Error::Status(status));
        }
        let (outgoing, requests) = mpsc::unbounded_channel();
        let (responses, incoming) = mpsc::channel(64);
        let _ = sink.send(FakeStream {
            headers,
            requests,
            responses,
        });
        Ok(DuplexStream { outgoing, incoming })
    }
}

#[async_trait]
impl Connection for FakeBackend {
    async fn open_listen_stream(
        &self,
        headers: Headers,
    ) -> Result<DuplexStream<ListenRequest, WatchChange>> {
        self.open(headers, &self.watch_tx)
    }

    async fn open_write_stream(
        &self,
        headers: Headers,
    ) -> Result<DuplexStream<WriteRequest, WriteResponse>> {
        self.open(headers, &self.write_tx)
    }

    async fn batch_get_documents(
        &self,
        keys: Vec<DocumentKey>,
        _headers: Headers,
    ) -> Result<Vec<Document>> {
        self.batch_get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.batch_get_failures.lock().pop_front() {
            return Err(Error::Status(status));
        }
        let documents = self.documents.lock();
        Ok(keys
            .into_iter()
            .map(|key| match documents.get(&key) {
                Some(document) => document.clone(),
                None => Document::new_no_document(key, SnapshotVersion::MIN),
            })
            .collect())
    }
}
