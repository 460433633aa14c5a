//! Orchestrates the local store, the remote store and the views.
//!
//! [`SyncEngine`] is owned by the client worker and only ever runs on it.
//! User operations and network results flow through here in the order the
//! worker receives them: writes are applied locally and queued, remote
//! events update the cache, and every change is pushed through the views
//! of all active queries before listeners hear about it.
//!
//! Limbo documents are documents a view holds locally that its synced
//! target does not contain. Each one gets a single-document listen so the
//! backend can confirm or delete it; at most
//! `max_concurrent_limbo_resolutions` of those run at once and the rest
//! wait in a queue.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::ChangeType;
use super::EventManager;
use super::LimboDocumentChange;
use super::ListenerId;
use super::Query;
use super::QueryListener;
use super::TargetData;
use super::TargetIdGenerator;
use super::TargetPurpose;
use super::View;
use super::ViewSnapshot;
use crate::local::LocalStore;
use crate::local::LocalViewChanges;
use crate::metrics::ACKNOWLEDGED_WRITES;
use crate::metrics::ACTIVE_LIMBO_RESOLUTIONS;
use crate::metrics::REJECTED_WRITES;
use crate::model::BatchId;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::DocumentKeySet;
use crate::model::DocumentMap;
use crate::model::ListenSequenceNumber;
use crate::model::Mutation;
use crate::model::MutationBatchResult;
use crate::model::SnapshotVersion;
use crate::model::TargetId;
use crate::model::BATCH_ID_UNKNOWN;
use crate::network::OnlineState;
use crate::network::RemoteEvent;
use crate::network::RemoteKeysProvider;
use crate::network::RemoteStore;
use crate::network::RemoteStoreEvent;
use crate::network::RemoteStreamEvent;
use crate::network::TargetChange;
use crate::Code;
use crate::Error;
use crate::Result;
use crate::StatusError;
use crate::SyncConfig;
use crate::User;

/// Limbo targets are never persisted, so they carry no sequence number.
const LIMBO_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Resolves once the backend acknowledged or rejected a batch.
pub(crate) type WriteCallback = oneshot::Sender<Result<()>>;

#[derive(Debug)]
struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

#[derive(Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// The limbo target delivered the document at least once.
    received_document: bool,
}

/// Query views and limbo bookkeeping. Kept apart from the stores so the
/// remote store can borrow it for remote keys while the engine mutates
/// the stores.
#[derive(Debug, Default)]
pub(crate) struct ViewRegistry {
    query_views: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which query targets reference each limbo document.
    limbo_document_refs: BTreeSet<(DocumentKey, TargetId)>,
}

impl ViewRegistry {
    fn is_limbo_referenced(
        &self,
        key: &DocumentKey,
    ) -> bool {
        self.limbo_document_refs
            .range((key.clone(), TargetId::MIN)..=(key.clone(), TargetId::MAX))
            .next()
            .is_some()
    }

    fn remove_limbo_references_for_target(
        &mut self,
        target_id: TargetId,
    ) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self
            .limbo_document_refs
            .iter()
            .filter(|(_, id)| *id == target_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.limbo_document_refs.remove(&(key.clone(), target_id));
        }
        keys
    }
}

impl RemoteKeysProvider for ViewRegistry {
    fn remote_keys_for_target(
        &self,
        target_id: TargetId,
    ) -> DocumentKeySet {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            let mut keys = DocumentKeySet::new();
            if resolution.received_document {
                keys.insert(resolution.key.clone());
            }
            return keys;
        }
        let mut keys = DocumentKeySet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }
}

pub(crate) struct SyncEngine {
    local_store: LocalStore,
    remote_store: RemoteStore,
    registry: ViewRegistry,
    event_manager: EventManager,
    limbo_target_ids: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
    /// Per user, the callbacks of batches written through this client.
    mutation_user_callbacks: HashMap<String, BTreeMap<BatchId, WriteCallback>>,
    /// Waiters keyed by the highest batch id pending when they registered.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    current_user: User,
}

impl SyncEngine {
    pub(crate) fn new(
        local_store: LocalStore,
        remote_store: RemoteStore,
        config: &SyncConfig,
    ) -> Self {
        let current_user = local_store.user().clone();
        Self {
            local_store,
            remote_store,
            registry: ViewRegistry::default(),
            event_manager: EventManager::new(),
            limbo_target_ids: TargetIdGenerator::for_sync_engine(),
            max_concurrent_limbo_resolutions: config.remote.max_concurrent_limbo_resolutions,
            mutation_user_callbacks: HashMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            current_user,
        }
    }

    pub(crate) fn current_user(&self) -> &User {
        &self.current_user
    }

    #[cfg(test)]
    pub(crate) fn online_state(&self) -> OnlineState {
        self.remote_store.online_state()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.remote_store.next_deadline()
    }

    /// Starts the streams for work that is already pending.
    pub(crate) fn start(&mut self) -> Result<()> {
        self.remote_store.resume_streams(&self.local_store);
        self.drain_remote_events()
    }

    // -
    // Listens

    /// Registers a query listener; the first listener of a query starts
    /// listening to its target.
    pub(crate) fn listen(
        &mut self,
        listener: QueryListener,
    ) -> Result<()> {
        let query = listener.query().clone();
        if !self.event_manager.add_listener(listener) {
            return Ok(());
        }
        match self.listen_to_query(&query) {
            Ok(snapshot) => {
                self.event_manager.on_watch_change(vec![snapshot]);
                self.drain_remote_events()
            }
            Err(e) => {
                self.event_manager
                    .on_watch_error(&query, StatusError::new(e.code(), e.to_string()));
                Err(e)
            }
        }
    }

    pub(crate) fn unlisten(
        &mut self,
        query: &Query,
        listener_id: ListenerId,
    ) -> Result<()> {
        if !self.event_manager.remove_listener(query, listener_id) {
            return Ok(());
        }
        self.unlisten_from_query(query)?;
        self.drain_remote_events()
    }

    fn listen_to_query(
        &mut self,
        query: &Query,
    ) -> Result<ViewSnapshot> {
        let target_data = self.local_store.allocate_target(query.to_target())?;
        let snapshot = self.initialize_view_and_compute_snapshot(
            query.clone(),
            target_data.target_id,
            target_data.resume_token.clone(),
        )?;
        self.remote_store.listen(target_data, &self.registry);
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        query: Query,
        target_id: TargetId,
        resume_token: Vec<u8>,
    ) -> Result<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        // The first snapshot always comes from cache.
        let synthesized = TargetChange {
            resume_token,
            current: false,
            ..Default::default()
        };
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false)?;
        let Some(snapshot) = view_change.snapshot else {
            return Err(Error::internal("initial view change produced no snapshot"));
        };

        debug!(
            "[SyncEngine] target_id={} initialized with {} cached documents via {:?}",
            target_id,
            snapshot.docs.len(),
            query_result.strategy
        );
        self.registry.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.registry.queries_by_target.entry(target_id).or_default().push(query);
        self.update_tracked_limbos(target_id, view_change.limbo_changes);
        Ok(snapshot)
    }

    fn unlisten_from_query(
        &mut self,
        query: &Query,
    ) -> Result<()> {
        let canonical_id = query.canonical_id();
        let Some(target_id) = self.registry.query_views.get(&canonical_id).map(|qv| qv.target_id) else {
            warn!("[SyncEngine] unlisten of unknown query {}", canonical_id);
            return Ok(());
        };

        if let Some(queries) = self.registry.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|q| q != query);
                self.registry.query_views.remove(&canonical_id);
                return Ok(());
            }
        }

        self.local_store.release_target(target_id)?;
        self.remote_store.unlisten(target_id);
        self.remove_and_cleanup_target(target_id, None);
        Ok(())
    }

    /// Drops the views of `target_id`, failing their listeners with `error`
    /// when given, and releases limbo documents only this target held.
    fn remove_and_cleanup_target(
        &mut self,
        target_id: TargetId,
        error: Option<StatusError>,
    ) {
        for query in self.registry.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.registry.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                self.event_manager.on_watch_error(&query, error.clone());
            }
        }

        for key in self.registry.remove_limbo_references_for_target(target_id) {
            if !self.registry.is_limbo_referenced(&key) {
                self.remove_limbo_target(&key);
            }
        }
    }

    // -
    // Limbo resolution

    fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    trace!(
                        "[SyncEngine] {} entered limbo for target_id={}",
                        key.path().canonical_string(),
                        target_id
                    );
                    self.registry.limbo_document_refs.insert((key.clone(), target_id));
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    trace!(
                        "[SyncEngine] {} left limbo for target_id={}",
                        key.path().canonical_string(),
                        target_id
                    );
                    self.registry.limbo_document_refs.remove(&(key.clone(), target_id));
                    if !self.registry.is_limbo_referenced(&key) {
                        self.remove_limbo_target(&key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(
        &mut self,
        key: DocumentKey,
    ) {
        if self.registry.active_limbo_targets_by_key.contains_key(&key)
            || self.registry.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        debug!("[SyncEngine] new document in limbo: {}", key.path().canonical_string());
        self.registry.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions();
    }

    /// Starts queued limbo listens while below the concurrency limit.
    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.registry.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.registry.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_ids.next();
            self.registry.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.registry
                .active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            let target_data = TargetData::new(
                Query::document(&key).to_target(),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                LIMBO_SEQUENCE_NUMBER,
            );
            self.remote_store.listen(target_data, &self.registry);
        }
        ACTIVE_LIMBO_RESOLUTIONS.set(self.registry.active_limbo_targets_by_key.len() as i64);
    }

    fn remove_limbo_target(
        &mut self,
        key: &DocumentKey,
    ) {
        self.registry.enqueued_limbo_resolutions.retain(|k| k != key);
        // The target may already be gone if its listen was rejected.
        let Some(limbo_target_id) = self.registry.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        self.remote_store.unlisten(limbo_target_id);
        self.registry
            .active_limbo_resolutions_by_target
            .remove(&limbo_target_id);
        self.pump_enqueued_limbo_resolutions();
    }

    #[cfg(test)]
    pub(crate) fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.registry.active_limbo_targets_by_key.clone()
    }

    #[cfg(test)]
    pub(crate) fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.registry.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    // -
    // Writes

    /// Applies `mutations` locally and queues them for the backend.
    /// `callback` resolves when the backend accepts or rejects the batch.
    #[instrument(skip(self, mutations, callback))]
    pub(crate) fn write(
        &mut self,
        mutations: Vec<Mutation>,
        callback: WriteCallback,
    ) -> Result<BatchId> {
        let result = self.local_store.write_locally(mutations)?;
        debug!("[SyncEngine] batch_id={} written locally", result.batch_id);
        self.mutation_user_callbacks
            .entry(self.current_user.key())
            .or_default()
            .insert(result.batch_id, callback);
        self.emit_new_snaps_and_notify_local_store(&result.changes, None)?;
        self.remote_store.fill_write_pipeline(&self.local_store);
        self.drain_remote_events()?;
        Ok(result.batch_id)
    }

    /// Resolves `callback` once every batch pending now is done.
    pub(crate) fn register_pending_writes_callback(
        &mut self,
        callback: WriteCallback,
    ) {
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id();
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return;
        }
        self.pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(callback);
    }

    fn apply_successful_write(
        &mut self,
        result: MutationBatchResult,
    ) -> Result<()> {
        let batch_id = result.batch.batch_id;
        let Some(changes) = self.local_store.acknowledge_batch(&result)? else {
            trace!("[SyncEngine] batch_id={} was already acknowledged", batch_id);
            return Ok(());
        };
        ACKNOWLEDGED_WRITES.inc();
        // Callbacks resolve before listeners see the acknowledged state.
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
    }

    fn reject_failed_write(
        &mut self,
        batch_id: BatchId,
        error: StatusError,
    ) -> Result<()> {
        let Some(changes) = self.local_store.reject_batch(batch_id)? else {
            trace!("[SyncEngine] batch_id={} was already removed", batch_id);
            return Ok(());
        };
        REJECTED_WRITES
            .with_label_values(&[error.code.to_string().as_str()])
            .inc();
        self.process_user_callback(batch_id, Err(Error::Status(error)));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
    }

    fn process_user_callback(
        &mut self,
        batch_id: BatchId,
        result: Result<()>,
    ) {
        let callback = self
            .mutation_user_callbacks
            .get_mut(&self.current_user.key())
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(
        &mut self,
        batch_id: BatchId,
    ) {
        for callback in self.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(
        &mut self,
        message: &str,
    ) {
        for callback in std::mem::take(&mut self.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            let _ = callback.send(Err(Error::status(Code::Cancelled, message)));
        }
    }

    // -
    // Reads

    /// Local view of `key`, including pending writes.
    pub(crate) fn get_document(
        &mut self,
        key: &DocumentKey,
    ) -> Document {
        self.local_store.read_document(key)
    }

    /// One-off evaluation of `query` against the local cache.
    pub(crate) fn get_query_from_cache(
        &mut self,
        query: &Query,
    ) -> Result<ViewSnapshot> {
        let query_result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let view_change = view.apply_changes(doc_changes, false, None, false)?;
        view_change
            .snapshot
            .ok_or_else(|| Error::internal("cache query produced no snapshot"))
    }

    // -
    // Network

    pub(crate) fn enable_network(&mut self) -> Result<()> {
        self.remote_store.enable_network(&self.local_store);
        self.drain_remote_events()
    }

    pub(crate) fn disable_network(&mut self) -> Result<()> {
        self.remote_store.disable_network();
        self.drain_remote_events()
    }

    /// Switches the active user: the streams restart with the new
    /// credentials and the views are recomputed from the user's queue.
    pub(crate) fn handle_credential_change(
        &mut self,
        user: User,
    ) -> Result<()> {
        if user == self.current_user {
            return Ok(());
        }
        info!(
            "[SyncEngine] user changed from {:?} to {:?}",
            self.current_user.uid(),
            user.uid()
        );
        self.remote_store.handle_credential_change_start();
        let outcome = self.switch_user(user);
        self.remote_store.resume_streams(&self.local_store);
        outcome.and_then(|_| self.drain_remote_events())
    }

    fn switch_user(
        &mut self,
        user: User,
    ) -> Result<()> {
        let result = self.local_store.handle_user_change(user.clone())?;
        debug!(
            "[SyncEngine] user change removed {} batches, added {}",
            result.removed_batch_ids.len(),
            result.added_batch_ids.len()
        );
        self.current_user = user;
        self.reject_outstanding_pending_writes_callbacks("pending writes wait cancelled by a user change");
        self.emit_new_snaps_and_notify_local_store(&result.changes, None)
    }

    pub(crate) fn handle_stream_event(
        &mut self,
        event: RemoteStreamEvent,
    ) -> Result<()> {
        let outcome = self
            .remote_store
            .handle_stream_event(event, &mut self.local_store, &self.registry)
            .and_then(|_| self.drain_remote_events());
        self.check_remote_outcome(outcome)
    }

    pub(crate) fn handle_timers(
        &mut self,
        now: Instant,
    ) -> Result<()> {
        let outcome = self
            .remote_store
            .handle_timers(now, &mut self.local_store)
            .and_then(|_| self.drain_remote_events());
        self.check_remote_outcome(outcome)
    }

    /// Losing the store stops the network until the client restarts.
    fn check_remote_outcome(
        &mut self,
        outcome: Result<()>,
    ) -> Result<()> {
        if let Err(Error::PrimaryLeaseLost(reason)) = &outcome {
            error!("[SyncEngine] local store unavailable, disabling network: {}", reason);
            self.remote_store.disable_network();
            if let Err(e) = self.drain_remote_events() {
                warn!("[SyncEngine] failed to process events after disabling network: {}", e);
            }
        }
        outcome
    }

    /// Processes everything the remote store produced, including events
    /// raised while processing earlier ones.
    fn drain_remote_events(&mut self) -> Result<()> {
        loop {
            let events = self.remote_store.take_events();
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                match event {
                    RemoteStoreEvent::RemoteEvent(remote_event) => self.apply_remote_event(remote_event)?,
                    RemoteStoreEvent::RejectListen { target_id, error } => self.reject_listen(target_id, error)?,
                    RemoteStoreEvent::WriteAcknowledged(result) => {
                        self.apply_successful_write(result)?;
                        self.remote_store.fill_write_pipeline(&self.local_store);
                    }
                    RemoteStoreEvent::WriteRejected { batch_id, error } => {
                        self.reject_failed_write(batch_id, error)?;
                        self.remote_store.fill_write_pipeline(&self.local_store);
                    }
                    RemoteStoreEvent::OnlineStateChanged(state) => self.apply_online_state_change(state)?,
                }
            }
        }
    }

    fn apply_remote_event(
        &mut self,
        event: RemoteEvent,
    ) -> Result<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.registry.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            // A limbo target holds one document, so at most one of these is set.
            if change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len() > 1 {
                warn!(
                    "[SyncEngine] limbo target_id={} changed more than one document",
                    target_id
                );
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
    }

    fn reject_listen(
        &mut self,
        target_id: TargetId,
        error: StatusError,
    ) -> Result<()> {
        let limbo_key = self
            .registry
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());

        let Some(limbo_key) = limbo_key else {
            warn!("[SyncEngine] listen for target_id={} rejected: {}", target_id, error);
            self.local_store.release_target(target_id)?;
            self.remove_and_cleanup_target(target_id, Some(error));
            return Ok(());
        };

        // The backend will not tell us about the document, so treat it as
        // deleted; the synthetic version evicts it from the cache.
        debug!(
            "[SyncEngine] limbo target_id={} rejected, deleting {}",
            target_id,
            limbo_key.path().canonical_string()
        );
        let mut document_updates = DocumentMap::new();
        document_updates.insert(
            limbo_key.clone(),
            Document::new_no_document(limbo_key.clone(), SnapshotVersion::MIN),
        );
        let mut resolved_limbo_documents = DocumentKeySet::new();
        resolved_limbo_documents.insert(limbo_key.clone());
        let event = RemoteEvent {
            snapshot_version: SnapshotVersion::MIN,
            document_updates,
            resolved_limbo_documents,
            ..Default::default()
        };

        self.registry.active_limbo_targets_by_key.remove(&limbo_key);
        self.registry
            .active_limbo_resolutions_by_target
            .remove(&target_id);
        self.pump_enqueued_limbo_resolutions();
        self.apply_remote_event(event)
    }

    fn apply_online_state_change(
        &mut self,
        online_state: OnlineState,
    ) -> Result<()> {
        debug!("[SyncEngine] online state is now {:?}", online_state);
        let mut new_snaps = Vec::new();
        for query_view in self.registry.query_views.values_mut() {
            let view_change = query_view.view.apply_online_state_change(online_state)?;
            if let Some(snapshot) = view_change.snapshot {
                new_snaps.push(snapshot);
            }
        }
        self.event_manager.on_online_state_change(online_state);
        self.event_manager.on_watch_change(new_snaps);
        Ok(())
    }

    /// Runs `changes` through every view, raises the resulting snapshots
    /// and records which views are now in sync.
    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> Result<()> {
        let mut new_snaps = Vec::new();
        let mut view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        for query_view in self.registry.query_views.values_mut() {
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                // A limit query lost a document; documents past the old
                // limit may now belong in the result.
                let query_result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&query_result.documents, Some(doc_changes));
            }
            let target_id = query_view.target_id;
            let target_change = remote_event.and_then(|e| e.target_changes.get(&target_id));
            let target_is_pending_reset = remote_event.is_some_and(|e| e.target_mismatches.contains_key(&target_id));
            let view_change = query_view
                .view
                .apply_changes(doc_changes, true, target_change, target_is_pending_reset)?;
            limbo_updates.push((target_id, view_change.limbo_changes));
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(local_view_changes(target_id, &snapshot));
                new_snaps.push(snapshot);
            }
        }

        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(target_id, limbo_changes);
        }
        self.event_manager.on_watch_change(new_snaps);
        self.local_store.notify_local_view_changes(&view_changes);
        Ok(())
    }

    pub(crate) fn shutdown(&mut self) -> Result<()> {
        info!("[SyncEngine] shutting down");
        self.remote_store.shutdown();
        self.reject_outstanding_pending_writes_callbacks("client shut down");
        self.local_store.flush()
    }
}

fn local_view_changes(
    target_id: TargetId,
    snapshot: &ViewSnapshot,
) -> LocalViewChanges {
    let mut added_keys = DocumentKeySet::new();
    let mut removed_keys = DocumentKeySet::new();
    for change in &snapshot.doc_changes {
        match change.change_type {
            ChangeType::Added => {
                added_keys.insert(change.doc.key().clone());
            }
            ChangeType::Removed => {
                removed_keys.insert(change.doc.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}
