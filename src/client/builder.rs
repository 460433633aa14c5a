use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use nanoid::nanoid;
use tokio::sync::mpsc;
use tracing::info;

use super::ClientInner;
use super::SyncClient;
use super::SyncWorker;
use crate::constants::AUTO_ID_ALPHABET;
use crate::constants::AUTO_ID_LENGTH;
use crate::core::SyncEngine;
use crate::local::LocalStore;
use crate::network::Connection;
use crate::network::CredentialsProvider;
use crate::network::EmptyCredentialsProvider;
use crate::network::RemoteStore;
use crate::network::StreamContext;
use crate::network::UnreachableConnection;
use crate::storage::init_storage;
use crate::storage::LocalStorage;
use crate::Result;
use crate::SyncConfig;

/// Assembles a [`SyncClient`] and spawns its worker.
///
/// Without a connection the client runs offline; without credentials it
/// runs unauthenticated; without a storage it opens the one named by
/// `config.persistence`.
pub struct SyncClientBuilder {
    config: SyncConfig,
    connection: Option<Arc<dyn Connection>>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    storage: Option<Arc<dyn LocalStorage>>,
}

impl SyncClientBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            connection: None,
            credentials: None,
            storage: None,
        }
    }

    /// Transport to the backend.
    pub fn connection(
        mut self,
        connection: Arc<dyn Connection>,
    ) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn credentials(
        mut self,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Overrides the storage built from `config.persistence`.
    pub fn storage(
        mut self,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validates the config, opens the local store and starts the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(self) -> Result<SyncClient> {
        let config = self.config.validate()?;
        let storage = match self.storage {
            Some(storage) => storage,
            None => init_storage(&config.persistence)?,
        };
        let connection = self.connection.unwrap_or_else(|| Arc::new(UnreachableConnection));
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(EmptyCredentialsProvider::new()));

        let user_rx = credentials.subscribe();
        let user = user_rx.borrow().clone();
        let local_store = LocalStore::open(storage, user, config.query.clone())?;

        let client_id = nanoid!(AUTO_ID_LENGTH, &AUTO_ID_ALPHABET);
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let context = StreamContext {
            connection: connection.clone(),
            credentials: credentials.clone(),
            events: stream_tx,
            client_id: client_id.clone(),
        };
        let remote_store = RemoteStore::new(context, &config);
        let sync_engine = SyncEngine::new(local_store, remote_store, &config);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = SyncWorker::new(sync_engine, event_rx, stream_rx, user_rx);
        tokio::spawn(worker.run());
        info!("[SyncClient] client {} started", client_id);

        Ok(SyncClient {
            inner: Arc::new(ClientInner {
                event_tx,
                connection,
                credentials,
                client_id,
                unary_retry: config.retry.unary,
                next_listener_id: AtomicU64::new(1),
            }),
        })
    }
}
