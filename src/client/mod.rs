//! Application-facing handle of the sync client.
//!
//! Provides the entry points an embedder works with:
//! - [`SyncClient`] - Cloneable handle for writes, reads and listens
//! - [`SyncClientBuilder`] - Wires storage, transport and credentials
//! - [`ListenerRegistration`] - Stream of [`QuerySnapshot`]s for one listen
//! - [`DocumentData`] / [`FieldValue`] - Write input, including sentinels
//!
//! # Basic Usage
//! ```ignore
//! use docsync::{DocumentData, ListenOptions, SetOptions, SyncClient, SyncConfig, Value};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> docsync::Result<()> {
//!     let client = SyncClient::builder(SyncConfig::default()).start().await?;
//!
//!     let key = client.doc("rooms/eros")?;
//!     let write = client
//!         .write(&key, DocumentData::new().with("name", Value::from("Eros")), SetOptions::Overwrite)
//!         .await?;
//!
//!     let mut rooms = client.listen(client.collection("rooms")?, ListenOptions::default()).await?;
//!     if let Some(snapshot) = rooms.next().await {
//!         println!("{} rooms", snapshot?.len());
//!     }
//!     write.committed().await
//! }
//! ```
//!
//! Every handle talks to one worker task that owns the local store, the
//! remote store and the views; requests are served in the order they are
//! sent.

mod builder;
mod event;
mod listener;
mod pending_write;
mod snapshot;
mod user_data;
mod worker;

pub use builder::*;
pub(crate) use event::*;
pub use listener::*;
pub use pending_write::*;
pub use snapshot::*;
pub use user_data::*;
pub(crate) use worker::*;

#[cfg(test)]
mod user_data_test;

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nanoid::nanoid;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::instrument;

use crate::constants::AUTO_ID_ALPHABET;
use crate::constants::AUTO_ID_LENGTH;
use crate::core::ListenOptions;
use crate::core::Query;
use crate::core::QueryListener;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::Mutation;
use crate::model::ResourcePath;
use crate::network::batch_get_documents_with_retry;
use crate::network::Connection;
use crate::network::CredentialsProvider;
use crate::BackoffPolicy;
use crate::Error;
use crate::Result;
use crate::SyncConfig;

/// Handle of a running sync client.
///
/// Cheap to clone; all clones share one worker. Created through
/// [`builder()`](SyncClient::builder).
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    client_id: String,
    unary_retry: BackoffPolicy,
    next_listener_id: AtomicU64,
}

impl SyncClient {
    pub fn builder(config: SyncConfig) -> SyncClientBuilder {
        SyncClientBuilder::new(config)
    }

    /// Identifier sent with every request of this client.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Query over all documents of the collection at `path`.
    pub fn collection(
        &self,
        path: &str,
    ) -> Result<Query> {
        Query::collection(ResourcePath::from_string(path)?)
    }

    pub fn doc(
        &self,
        path: &str,
    ) -> Result<DocumentKey> {
        DocumentKey::from_string(path)
    }

    // -
    // Writes

    /// Writes `data` to `key`. The returned handle resolves once the
    /// backend commits the write; the local view changes immediately.
    #[instrument(skip(self, data))]
    pub async fn write(
        &self,
        key: &DocumentKey,
        data: impl Into<DocumentData>,
        options: SetOptions,
    ) -> Result<PendingWrite> {
        let mutation = parse_set_data(key.clone(), &data.into(), &options)?;
        self.write_mutations(vec![mutation]).await
    }

    /// Updates fields of an existing document. Keys of `data` are dotted
    /// field paths. The commit fails with `NotFound` if the document does
    /// not exist on the backend.
    #[instrument(skip(self, data))]
    pub async fn update(
        &self,
        key: &DocumentKey,
        data: impl Into<DocumentData>,
    ) -> Result<PendingWrite> {
        let mutation = parse_update_data(key.clone(), &data.into())?;
        self.write_mutations(vec![mutation]).await
    }

    #[instrument(skip(self))]
    pub async fn delete(
        &self,
        key: &DocumentKey,
    ) -> Result<PendingWrite> {
        self.write_mutations(vec![Mutation::delete(key.clone())]).await
    }

    /// Writes `data` to a new document with a generated id.
    pub async fn add(
        &self,
        collection_path: &str,
        data: impl Into<DocumentData>,
    ) -> Result<(DocumentKey, PendingWrite)> {
        let collection = ResourcePath::from_string(collection_path)?;
        let id = nanoid!(AUTO_ID_LENGTH, &AUTO_ID_ALPHABET);
        let key = DocumentKey::from_path(collection.child(id))?;
        let pending = self.write(&key, data, SetOptions::Overwrite).await?;
        Ok((key, pending))
    }

    /// Applies `mutations` as one atomic batch.
    pub async fn write_batch(
        &self,
        mutations: Vec<Mutation>,
    ) -> Result<PendingWrite> {
        self.write_mutations(mutations).await
    }

    async fn write_mutations(
        &self,
        mutations: Vec<Mutation>,
    ) -> Result<PendingWrite> {
        self.request(|responder| ClientEvent::Write { mutations, responder }).await
    }

    /// Resolves once every write issued before the call is committed or
    /// rejected. Fails with `Cancelled` if the user changes first.
    pub async fn wait_for_pending_writes(&self) -> Result<()> {
        self.request(|responder| ClientEvent::WaitForPendingWrites { responder })
            .await
    }

    // -
    // Reads

    /// The document as the local view sees it, pending writes included.
    pub async fn get(
        &self,
        key: &DocumentKey,
    ) -> Result<DocumentSnapshot> {
        let key = key.clone();
        self.request(|responder| ClientEvent::GetDocument { key, responder })
            .await
    }

    /// Runs `query` against the local cache only.
    pub async fn get_query(
        &self,
        query: &Query,
    ) -> Result<QuerySnapshot> {
        let query = query.clone();
        self.request(|responder| ClientEvent::GetQuery { query, responder })
            .await
    }

    /// Reads the document straight from the backend, bypassing the cache.
    ///
    /// Retried per the `retry.unary` policy. The result is not written to
    /// the cache.
    #[instrument(skip(self))]
    pub async fn get_from_server(
        &self,
        key: &DocumentKey,
    ) -> Result<DocumentSnapshot> {
        let documents = batch_get_documents_with_retry(
            self.inner.connection.clone(),
            self.inner.credentials.clone(),
            self.inner.client_id.clone(),
            vec![key.clone()],
            self.inner.unary_retry,
        )
        .await?;
        let document = documents
            .into_iter()
            .find(|doc| doc.key() == key)
            .unwrap_or_else(|| Document::new_invalid(key.clone()));
        Ok(DocumentSnapshot::new(key.clone(), document, false, false))
    }

    // -
    // Listens

    /// Starts listening to `query`. The registration yields a snapshot
    /// whenever the results or, if requested, their metadata change.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
    ) -> Result<ListenerRegistration> {
        let listener_id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let listener = QueryListener::new(listener_id, query.clone(), options, sender);
        debug!("[SyncClient] listen {} as listener {}", query.canonical_id(), listener_id);
        self.request(|responder| ClientEvent::Listen { listener, responder })
            .await?;
        Ok(ListenerRegistration::new(
            query,
            listener_id,
            receiver,
            self.inner.event_tx.clone(),
        ))
    }

    // -
    // Lifecycle

    pub async fn enable_network(&self) -> Result<()> {
        self.request(|responder| ClientEvent::EnableNetwork { responder })
            .await
    }

    /// Closes both streams and reports the client offline. Writes queue
    /// locally until the network is enabled again.
    pub async fn disable_network(&self) -> Result<()> {
        self.request(|responder| ClientEvent::DisableNetwork { responder })
            .await
    }

    /// Stops the worker. Every handle fails with `ClientTerminated`
    /// afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|responder| ClientEvent::Shutdown { responder })
            .await
    }

    async fn request<T>(
        &self,
        make_event: impl FnOnce(Responder<T>) -> ClientEvent,
    ) -> Result<T> {
        let (responder, receiver) = oneshot::channel();
        self.inner
            .event_tx
            .send(make_event(responder))
            .map_err(|_| Error::ClientTerminated)?;
        receiver.await.map_err(|_| Error::ClientTerminated)?
    }
}
