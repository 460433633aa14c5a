use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docsync::Connection;
use docsync::Document;
use docsync::DocumentKey;
use docsync::DuplexStream;
use docsync::Headers;
use docsync::ListenRequest;
use docsync::LocalStorage;
use docsync::MutationResult;
use docsync::SnapshotVersion;
use docsync::StatusError;
use docsync::SyncClient;
use docsync::SyncConfig;
use docsync::Timestamp;
use docsync::WatchChange;
use docsync::WriteRequest;
use docsync::WriteResponse;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::time::timeout;

pub const WAIT_FOR_BACKEND: Duration = Duration::from_secs(5);

/// Backend end of a stream the client opened.
pub struct BackendStream<Req, Resp> {
    requests: mpsc::UnboundedReceiver<Req>,
    responses: mpsc::Sender<std::result::Result<Resp, StatusError>>,
}

impl<Req, Resp> BackendStream<Req, Resp> {
    pub async fn next_request(&mut self) -> Req {
        timeout(WAIT_FOR_BACKEND, self.requests.recv())
            .await
            .expect("no request in time")
            .expect("stream closed by client")
    }

    pub async fn respond(
        &self,
        response: Resp,
    ) {
        self.responses.send(Ok(response)).await.expect("client dropped stream");
    }
}

/// Connection whose streams are handed to the test one by one.
pub struct ScriptedBackend {
    watch_tx: mpsc::UnboundedSender<BackendStream<ListenRequest, WatchChange>>,
    watch_rx: Mutex<mpsc::UnboundedReceiver<BackendStream<ListenRequest, WatchChange>>>,
    write_tx: mpsc::UnboundedSender<BackendStream<WriteRequest, WriteResponse>>,
    write_rx: Mutex<mpsc::UnboundedReceiver<BackendStream<WriteRequest, WriteResponse>>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            watch_tx,
            watch_rx: Mutex::new(watch_rx),
            write_tx,
            write_rx: Mutex::new(write_rx),
        })
    }

    pub async fn next_watch_stream(&self) -> BackendStream<ListenRequest, WatchChange> {
        timeout(WAIT_FOR_BACKEND, self.watch_rx.lock().await.recv())
            .await
            .expect("no watch stream in time")
            .expect("backend dropped")
    }

    pub async fn next_write_stream(&self) -> BackendStream<WriteRequest, WriteResponse> {
        timeout(WAIT_FOR_BACKEND, self.write_rx.lock().await.recv())
            .await
            .expect("no write stream in time")
            .expect("backend dropped")
    }

    /// Answers the handshake of the next write stream.
    pub async fn accept_write_stream(&self) -> BackendStream<WriteRequest, WriteResponse> {
        let mut stream = self.next_write_stream().await;
        match stream.next_request().await {
            WriteRequest::Handshake { .. } => {}
            other => panic!("expected handshake, got {:?}", other),
        }
        stream
            .respond(WriteResponse {
                stream_token: b"handshake".to_vec(),
                commit_version: None,
                mutation_results: Vec::new(),
            })
            .await;
        stream
    }
}

fn open<Req, Resp>(sink: &mpsc::UnboundedSender<BackendStream<Req, Resp>>) -> DuplexStream<Req, Resp> {
    let (outgoing, requests) = mpsc::unbounded_channel();
    let (responses, incoming) = mpsc::channel(64);
    let _ = sink.send(BackendStream { requests, responses });
    DuplexStream { outgoing, incoming }
}

#[async_trait]
impl Connection for ScriptedBackend {
    async fn open_listen_stream(
        &self,
        _headers: Headers,
    ) -> docsync::Result<DuplexStream<ListenRequest, WatchChange>> {
        Ok(open(&self.watch_tx))
    }

    async fn open_write_stream(
        &self,
        _headers: Headers,
    ) -> docsync::Result<DuplexStream<WriteRequest, WriteResponse>> {
        Ok(open(&self.write_tx))
    }

    async fn batch_get_documents(
        &self,
        keys: Vec<DocumentKey>,
        _headers: Headers,
    ) -> docsync::Result<Vec<Document>> {
        Ok(keys
            .into_iter()
            .map(|key| Document::new_no_document(key, SnapshotVersion::MIN))
            .collect())
    }
}

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
}

/// Acknowledges a batch of `count` writes at `seconds`.
pub fn ack(
    count: usize,
    seconds: i64,
) -> WriteResponse {
    WriteResponse {
        stream_token: format!("ack-{}", seconds).into_bytes(),
        commit_version: Some(version(seconds)),
        mutation_results: (0..count)
            .map(|_| MutationResult {
                version: version(seconds),
                transform_results: Vec::new(),
            })
            .collect(),
    }
}

pub async fn start_client(
    storage: Arc<dyn LocalStorage>,
    backend: Option<Arc<ScriptedBackend>>,
) -> SyncClient {
    let mut builder = SyncClient::builder(SyncConfig::default()).storage(storage);
    if let Some(backend) = backend {
        builder = builder.connection(backend);
    }
    builder.start().await.expect("client starts")
}
