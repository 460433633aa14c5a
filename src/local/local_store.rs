//! Local persistence facade of the sync engine.
//!
//! [`LocalStore`] owns the remote document cache, the mutation queue, the
//! target cache, the overlay memo and the index manager. Every operation
//! stages its writes into one [`WriteBatch`] which is committed through
//! [`Persistence`] before the operation returns, so the in-memory state and
//! the store move together.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

use super::LocalDocumentsView;
use super::IndexManager;
use super::MutationQueue;
use super::OverlayCache;
use super::QueryEngine;
use super::QueryStrategy;
use super::RemoteDocumentCache;
use super::RemoteDocumentChangeBuffer;
use super::TargetCache;
use crate::config::QueryEngineConfig;
use crate::core::Query;
use crate::core::Target;
use crate::core::TargetData;
use crate::core::TargetPurpose;
use crate::metrics::ACTIVE_TARGETS;
use crate::model::BatchId;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::DocumentKeySet;
use crate::model::DocumentMap;
use crate::model::Mutation;
use crate::model::MutationBatch;
use crate::model::MutationBatchResult;
use crate::model::SnapshotVersion;
use crate::model::TargetId;
use crate::model::Timestamp;
use crate::network::RemoteEvent;
use crate::network::TargetChange;
use crate::storage::LocalStorage;
use crate::storage::Persistence;
use crate::storage::WriteBatch;
use crate::Error;
use crate::Result;
use crate::User;

/// A resume token older than this is persisted even without document
/// changes.
const RESUME_TOKEN_MAX_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub(crate) struct LocalWriteResult {
    pub(crate) batch_id: BatchId,
    pub(crate) changes: DocumentMap,
}

/// Documents matching a query plus the keys the backend associated with its
/// target.
#[derive(Debug)]
pub(crate) struct LocalQueryResult {
    pub(crate) documents: DocumentMap,
    pub(crate) remote_keys: DocumentKeySet,
    pub(crate) strategy: QueryStrategy,
}

/// Keys a view added or removed from its result set in one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocalViewChanges {
    pub(crate) target_id: TargetId,
    pub(crate) from_cache: bool,
    pub(crate) added_keys: DocumentKeySet,
    pub(crate) removed_keys: DocumentKeySet,
}

#[derive(Debug)]
pub(crate) struct UserChangeResult {
    pub(crate) removed_batch_ids: Vec<BatchId>,
    pub(crate) added_batch_ids: Vec<BatchId>,
    pub(crate) changes: DocumentMap,
}

pub(crate) struct LocalStore {
    persistence: Persistence,
    user: User,
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    target_cache: TargetCache,
    overlays: OverlayCache,
    index_manager: IndexManager,
    query_engine: QueryEngine,
    /// Targets with at least one listener.
    active_targets: BTreeMap<TargetId, TargetData>,
    active_target_ids: HashMap<String, TargetId>,
}

impl LocalStore {
    /// Loads every cache from `storage` and replays the user's queue.
    pub(crate) fn open(
        storage: Arc<dyn LocalStorage>,
        user: User,
        config: QueryEngineConfig,
    ) -> Result<Self> {
        let persistence = Persistence::new(storage);
        let remote_documents = RemoteDocumentCache::load(persistence.storage())?;
        let mutation_queue = MutationQueue::load(persistence.storage(), &user)?;
        let target_cache = TargetCache::load(persistence.storage())?;
        let index_manager = IndexManager::load(persistence.storage(), &remote_documents)?;
        debug!(
            "[LocalStore] opened for user {:?}: {} documents, {} pending batches, {} targets",
            user.uid(),
            remote_documents.len(),
            mutation_queue.len(),
            target_cache.target_count()
        );
        Ok(Self {
            persistence,
            user,
            remote_documents,
            mutation_queue,
            target_cache,
            overlays: OverlayCache::new(),
            index_manager,
            query_engine: QueryEngine::new(config),
            active_targets: BTreeMap::new(),
            active_target_ids: HashMap::new(),
        })
    }

    pub(crate) fn user(&self) -> &User {
        &self.user
    }

    #[cfg(test)]
    pub(crate) fn is_primary_lease_lost(&self) -> bool {
        self.persistence.is_primary_lease_lost()
    }

    fn documents_view(&mut self) -> LocalDocumentsView<'_> {
        LocalDocumentsView {
            remote_documents: &self.remote_documents,
            mutation_queue: &self.mutation_queue,
            overlays: &mut self.overlays,
        }
    }

    fn local_views(
        &mut self,
        keys: &DocumentKeySet,
    ) -> DocumentMap {
        self.documents_view().get_documents(keys)
    }

    /// Switches the mutation queue to `user`. Returns the local views of
    /// every document touched by either user's pending writes.
    pub(crate) fn handle_user_change(
        &mut self,
        user: User,
    ) -> Result<UserChangeResult> {
        let removed: Vec<MutationBatch> = self.mutation_queue.all_mutation_batches().cloned().collect();
        self.mutation_queue = MutationQueue::load(self.persistence.storage(), &user)?;
        self.user = user;
        self.overlays.clear();

        let added: Vec<MutationBatch> = self.mutation_queue.all_mutation_batches().cloned().collect();
        let mut changed_keys = DocumentKeySet::new();
        for batch in removed.iter().chain(added.iter()) {
            changed_keys.extend(batch.keys());
        }
        debug!(
            "[LocalStore] user changed: {} batches removed, {} batches added",
            removed.len(),
            added.len()
        );
        Ok(UserChangeResult {
            removed_batch_ids: removed.iter().map(|b| b.batch_id).collect(),
            added_batch_ids: added.iter().map(|b| b.batch_id).collect(),
            changes: self.local_views(&changed_keys),
        })
    }

    /// Queues `mutations` as one batch and returns the updated local views.
    pub(crate) fn write_locally(
        &mut self,
        mutations: Vec<Mutation>,
    ) -> Result<LocalWriteResult> {
        self.persistence.ensure_writable()?;
        let keys: DocumentKeySet = mutations.iter().map(|m| m.key.clone()).collect();

        let mut batch = WriteBatch::default();
        let mutation_batch = self
            .mutation_queue
            .add_mutation_batch(Timestamp::now(), mutations, &mut batch)?;
        let batch_id = mutation_batch.batch_id;
        if let Err(e) = self.persistence.commit("write_locally", batch) {
            self.mutation_queue.discard_unpersisted_batch(batch_id);
            return Err(e);
        }

        self.overlays.invalidate(&keys);
        trace!("[LocalStore] wrote batch_id={} locally", batch_id);
        Ok(LocalWriteResult {
            batch_id,
            changes: self.local_views(&keys),
        })
    }

    /// Applies an acknowledged batch to the remote document cache and
    /// removes it from the queue. A batch that is no longer queued was
    /// already handled and yields `None`.
    pub(crate) fn acknowledge_batch(
        &mut self,
        result: &MutationBatchResult,
    ) -> Result<Option<DocumentMap>> {
        let batch_id = result.batch.batch_id;
        if self.mutation_queue.lookup_mutation_batch(batch_id).is_none() {
            debug!("[LocalStore] batch_id={} already acknowledged", batch_id);
            return Ok(None);
        }
        self.persistence.ensure_writable()?;

        let affected = result.batch.keys();
        let mut changes = RemoteDocumentChangeBuffer::default();
        for key in &affected {
            let mut doc = self.remote_documents.get(key);
            let ack_version = result.doc_versions.get(key).copied().unwrap_or(result.commit_version);
            if doc.version() < ack_version {
                result.batch.apply_to_remote_document(&mut doc, result);
                if doc.is_valid_document() {
                    doc.set_read_time(result.commit_version);
                    changes.add_entry(doc);
                }
            }
        }

        let mut batch = WriteBatch::default();
        self.apply_document_changes(changes, &mut batch)?;
        self.mutation_queue.remove_mutation_batch(batch_id, &mut batch)?;
        self.mutation_queue
            .set_last_stream_token(result.stream_token.clone(), &mut batch)?;
        self.persistence.commit("acknowledge_batch", batch)?;

        self.overlays.invalidate(&affected);
        Ok(Some(self.local_views(&affected)))
    }

    /// Removes a batch the backend rejected. Returns `None` when the batch
    /// is no longer queued.
    pub(crate) fn reject_batch(
        &mut self,
        batch_id: BatchId,
    ) -> Result<Option<DocumentMap>> {
        let Some(affected) = self.mutation_queue.lookup_mutation_batch(batch_id).map(MutationBatch::keys) else {
            debug!("[LocalStore] batch_id={} already rejected", batch_id);
            return Ok(None);
        };
        self.persistence.ensure_writable()?;

        let mut batch = WriteBatch::default();
        self.mutation_queue.remove_mutation_batch(batch_id, &mut batch)?;
        self.persistence.commit("reject_batch", batch)?;

        self.overlays.invalidate(&affected);
        Ok(Some(self.local_views(&affected)))
    }

    pub(crate) fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.mutation_queue.highest_unacknowledged_batch_id()
    }

    pub(crate) fn get_last_stream_token(&self) -> Vec<u8> {
        self.mutation_queue.last_stream_token().to_vec()
    }

    pub(crate) fn set_last_stream_token(
        &mut self,
        stream_token: Vec<u8>,
    ) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.mutation_queue.set_last_stream_token(stream_token, &mut batch)?;
        self.persistence.commit("set_last_stream_token", batch)
    }

    pub(crate) fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.target_cache.last_remote_snapshot_version()
    }

    /// First queued batch after `after_batch_id`, for the write pipeline.
    pub(crate) fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> Option<MutationBatch> {
        self.mutation_queue
            .next_mutation_batch_after_batch_id(after_batch_id)
            .cloned()
    }

    pub(crate) fn read_document(
        &mut self,
        key: &DocumentKey,
    ) -> Document {
        self.documents_view().get_document(key)
    }

    /// Applies one aggregated watch snapshot to the caches and returns the
    /// local views of every document it changed.
    #[instrument(skip(self, event))]
    pub(crate) fn apply_remote_event(
        &mut self,
        event: &RemoteEvent,
    ) -> Result<DocumentMap> {
        self.persistence.ensure_writable()?;
        let remote_version = event.snapshot_version;
        let last = self.target_cache.last_remote_snapshot_version();
        if !remote_version.is_min() && remote_version < last {
            return Err(Error::internal(format!(
                "watch stream reverted to snapshot {remote_version} after {last}"
            )));
        }
        let mut batch = WriteBatch::default();

        for (target_id, change) in &event.target_changes {
            let Some(old) = self.active_targets.get(target_id).cloned() else {
                continue;
            };
            self.target_cache
                .remove_matching_keys(&change.removed_documents, *target_id, &mut batch);
            self.target_cache
                .add_matching_keys(&change.added_documents, *target_id, &mut batch);

            let sequence_number = self.target_cache.next_sequence_number();
            let mut updated = old.clone().with_sequence_number(sequence_number);
            if event.target_mismatches.contains_key(target_id) {
                updated = updated
                    .with_resume_token(Vec::new(), SnapshotVersion::MIN)
                    .with_last_limbo_free_snapshot_version(SnapshotVersion::MIN);
            } else if !change.resume_token.is_empty() {
                updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
            }

            if should_persist_target_data(&old, &updated, change) {
                self.target_cache.save_target_data(updated.clone(), &mut batch)?;
            }
            self.active_targets.insert(*target_id, updated);
        }

        let mut changed_docs = DocumentMap::new();
        let mut changes = RemoteDocumentChangeBuffer::default();
        for (key, doc) in &event.document_updates {
            let existing = self.remote_documents.get(key);
            if doc.is_no_document() && doc.version().is_min() {
                // Access to the document was lost; forget it.
                changes.remove_entry(key.clone());
                changed_docs.insert(key.clone(), doc.clone());
            } else if !existing.is_valid_document()
                || doc.version() > existing.version()
                || (doc.version() == existing.version() && existing.has_pending_writes())
            {
                let mut doc = doc.clone();
                doc.set_read_time(remote_version);
                changes.add_entry(doc.clone());
                changed_docs.insert(key.clone(), doc);
            } else {
                trace!(
                    "[LocalStore] ignoring outdated watch update for {}: cached {} >= {}",
                    key,
                    existing.version(),
                    doc.version()
                );
            }
        }

        if !remote_version.is_min() {
            self.target_cache
                .set_last_remote_snapshot_version(remote_version, &mut batch)?;
        }

        self.apply_document_changes(changes, &mut batch)?;
        self.persistence.commit("apply_remote_event", batch)?;

        Ok(self.documents_view().get_local_views(changed_docs))
    }

    /// Records which targets are in sync so later queries can start from
    /// their previous results.
    pub(crate) fn notify_local_view_changes(
        &mut self,
        view_changes: &[LocalViewChanges],
    ) {
        for change in view_changes {
            if change.from_cache {
                continue;
            }
            if let Some(data) = self.active_targets.get_mut(&change.target_id) {
                let version = data.snapshot_version;
                data.last_limbo_free_snapshot_version = version;
                trace!(
                    "[LocalStore] target_id={} limbo free at {}",
                    change.target_id,
                    version
                );
            }
        }
    }

    /// Returns the data of the active or cached target for `target`, or
    /// assigns a new target id.
    pub(crate) fn allocate_target(
        &mut self,
        target: Target,
    ) -> Result<TargetData> {
        let canonical_id = target.canonical_id();
        if let Some(data) = self
            .active_target_ids
            .get(&canonical_id)
            .and_then(|id| self.active_targets.get(id))
        {
            return Ok(data.clone());
        }

        let sequence_number = self.target_cache.next_sequence_number();
        let data = match self.target_cache.get_target_data(&target) {
            Some(cached) => cached.clone().with_sequence_number(sequence_number),
            None => {
                let target_id = self.target_cache.allocate_target_id();
                TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number)
            }
        };

        let mut batch = WriteBatch::default();
        self.target_cache.save_target_data(data.clone(), &mut batch)?;
        self.persistence.commit("allocate_target", batch)?;

        debug!("[LocalStore] allocated target_id={} for {}", data.target_id, canonical_id);
        self.active_target_ids.insert(canonical_id, data.target_id);
        self.active_targets.insert(data.target_id, data.clone());
        ACTIVE_TARGETS.set(self.active_targets.len() as i64);
        Ok(data)
    }

    #[cfg(test)]
    pub(crate) fn get_target_data(
        &self,
        target_id: TargetId,
    ) -> Option<&TargetData> {
        self.active_targets.get(&target_id)
    }

    /// Deactivates a target. Its metadata stays persisted so a later listen
    /// resumes from the last resume token.
    pub(crate) fn release_target(
        &mut self,
        target_id: TargetId,
    ) -> Result<()> {
        let Some(data) = self.active_targets.remove(&target_id) else {
            warn!("[LocalStore] releasing unknown target_id={}", target_id);
            return Ok(());
        };
        self.active_target_ids.remove(&data.target.canonical_id());
        ACTIVE_TARGETS.set(self.active_targets.len() as i64);

        if self.persistence.is_primary_lease_lost() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        self.target_cache.save_target_data(data, &mut batch)?;
        self.persistence.commit("release_target", batch)
    }

    /// Runs `query` against the local cache.
    pub(crate) fn execute_query(
        &mut self,
        query: &Query,
        use_previous_results: bool,
    ) -> Result<LocalQueryResult> {
        let target_data = self
            .active_target_ids
            .get(&query.to_target().canonical_id())
            .and_then(|id| self.active_targets.get(id))
            .cloned();
        let (last_limbo_free, remote_keys) = match &target_data {
            Some(data) => (
                if use_previous_results {
                    data.last_limbo_free_snapshot_version
                } else {
                    SnapshotVersion::MIN
                },
                self.target_cache.get_matching_keys_for_target_id(data.target_id),
            ),
            None => (SnapshotVersion::MIN, DocumentKeySet::new()),
        };

        let mut view = LocalDocumentsView {
            remote_documents: &self.remote_documents,
            mutation_queue: &self.mutation_queue,
            overlays: &mut self.overlays,
        };
        let result = self.query_engine.get_documents_matching_query(
            &mut view,
            &self.index_manager,
            query,
            last_limbo_free,
            &remote_keys,
        );
        trace!(
            "[LocalStore] query {} via {:?}: read {}, matched {}",
            query.canonical_id(),
            result.strategy,
            result.documents_read,
            result.documents.len()
        );

        if let Some(index) = result.index_suggestion {
            if !self.persistence.is_primary_lease_lost() {
                let mut batch = WriteBatch::default();
                if self
                    .index_manager
                    .add_field_index(index, &self.remote_documents, &mut batch)?
                {
                    self.persistence.commit("create_field_index", batch)?;
                }
            }
        }

        Ok(LocalQueryResult {
            documents: result.documents,
            remote_keys,
            strategy: result.strategy,
        })
    }

    #[cfg(test)]
    pub(crate) fn get_remote_document_keys(
        &self,
        target_id: TargetId,
    ) -> DocumentKeySet {
        self.target_cache.get_matching_keys_for_target_id(target_id)
    }

    #[cfg(test)]
    /// Net pending write for `key` as of its last computed local view.
    pub(crate) fn get_overlay(
        &self,
        key: &DocumentKey,
    ) -> Option<&Mutation> {
        self.overlays.overlay(key)
    }

    #[cfg(test)]
    pub(crate) fn pending_batch_count(&self) -> usize {
        self.mutation_queue.len()
    }

    #[cfg(test)]
    pub(crate) fn field_index_count(&self) -> usize {
        self.index_manager.field_indexes().len()
    }

    fn apply_document_changes(
        &mut self,
        changes: RemoteDocumentChangeBuffer,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let keys = changes.keys();
        self.remote_documents.apply_changes(changes, batch)?;
        for key in &keys {
            let doc = self.remote_documents.get(key);
            if doc.is_valid_document() {
                self.index_manager.update_document(&doc);
            } else {
                self.index_manager.remove_document(key);
            }
        }
        Ok(())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.persistence.flush()
    }
}

fn should_persist_target_data(
    old: &TargetData,
    new: &TargetData,
    change: &TargetChange,
) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let age_micros = new.snapshot_version.timestamp().to_micros() - old.snapshot_version.timestamp().to_micros();
    if age_micros >= RESUME_TOKEN_MAX_AGE.as_micros() as i64 {
        return true;
    }
    change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len() > 0
}
