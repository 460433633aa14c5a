//! The serial worker that owns all client state.
//!
//! Handle requests, stream events, credential changes and timer deadlines
//! are multiplexed onto one task, so the sync engine never needs locks.

use std::future::pending;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::ClientEvent;
use super::DocumentSnapshot;
use super::PendingWrite;
use super::QuerySnapshot;
use crate::core::SyncEngine;
use crate::network::RemoteStreamEvent;
use crate::User;

pub(crate) struct SyncWorker {
    sync_engine: SyncEngine,
    event_rx: mpsc::UnboundedReceiver<ClientEvent>,
    stream_rx: mpsc::UnboundedReceiver<RemoteStreamEvent>,
    user_rx: watch::Receiver<User>,
}

impl SyncWorker {
    pub(crate) fn new(
        sync_engine: SyncEngine,
        event_rx: mpsc::UnboundedReceiver<ClientEvent>,
        stream_rx: mpsc::UnboundedReceiver<RemoteStreamEvent>,
        user_rx: watch::Receiver<User>,
    ) -> Self {
        Self {
            sync_engine,
            event_rx,
            stream_rx,
            user_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            "[SyncWorker] started for user {:?}",
            self.sync_engine.current_user().uid()
        );
        if let Err(e) = self.sync_engine.start() {
            error!("[SyncWorker] start failed: {}", e);
        }

        loop {
            let deadline = self.sync_engine.next_deadline();
            let tick = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                // Use biased to ensure branch order
                biased;
                // P0: requests from handles, including shutdown
                event = self.event_rx.recv() => {
                    match event {
                        Some(ClientEvent::Shutdown { responder }) => {
                            let _ = responder.send(self.sync_engine.shutdown());
                            info!("[SyncWorker] stopped");
                            return;
                        }
                        Some(event) => self.handle_client_event(event),
                        None => {
                            debug!("[SyncWorker] every handle dropped, stopping");
                            if let Err(e) = self.sync_engine.shutdown() {
                                warn!("[SyncWorker] shutdown failed: {}", e);
                            }
                            return;
                        }
                    }
                }
                // P1: user changes
                Ok(()) = self.user_rx.changed() => {
                    let user = self.user_rx.borrow_and_update().clone();
                    if let Err(e) = self.sync_engine.handle_credential_change(user) {
                        error!("[SyncWorker] user change failed: {}", e);
                    }
                }
                // P2: stream callbacks
                Some(stream_event) = self.stream_rx.recv() => {
                    trace!("[SyncWorker] stream event");
                    if let Err(e) = self.sync_engine.handle_stream_event(stream_event) {
                        error!("[SyncWorker] handle_stream_event: {}", e);
                    }
                }
                // P3: backoff, idle, health-check and online-state timers
                _ = tick => {
                    if let Err(e) = self.sync_engine.handle_timers(Instant::now()) {
                        error!("[SyncWorker] handle_timers: {}", e);
                    }
                }
            }
        }
    }

    fn handle_client_event(
        &mut self,
        event: ClientEvent,
    ) {
        match event {
            ClientEvent::Write { mutations, responder } => {
                let (committed_tx, committed_rx) = tokio::sync::oneshot::channel();
                let result = self
                    .sync_engine
                    .write(mutations, committed_tx)
                    .map(|batch_id| PendingWrite::new(batch_id, committed_rx));
                let _ = responder.send(result);
            }
            ClientEvent::GetDocument { key, responder } => {
                let document = self.sync_engine.get_document(&key);
                let _ = responder.send(Ok(DocumentSnapshot::from_local(document)));
            }
            ClientEvent::GetQuery { query, responder } => {
                let result = self.sync_engine.get_query_from_cache(&query).map(QuerySnapshot::from);
                let _ = responder.send(result);
            }
            ClientEvent::Listen { listener, responder } => {
                let _ = responder.send(self.sync_engine.listen(listener));
            }
            ClientEvent::Unlisten { query, listener_id } => {
                if let Err(e) = self.sync_engine.unlisten(&query, listener_id) {
                    warn!("[SyncWorker] unlisten of listener {} failed: {}", listener_id, e);
                }
            }
            ClientEvent::WaitForPendingWrites { responder } => {
                self.sync_engine.register_pending_writes_callback(responder);
            }
            ClientEvent::EnableNetwork { responder } => {
                let _ = responder.send(self.sync_engine.enable_network());
            }
            ClientEvent::DisableNetwork { responder } => {
                let _ = responder.send(self.sync_engine.disable_network());
            }
            ClientEvent::Shutdown { responder } => {
                let _ = responder.send(self.sync_engine.shutdown());
            }
        }
    }
}
