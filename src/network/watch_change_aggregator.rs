use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::mem;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::BloomFilter;
use super::DocumentWatchChange;
use super::ExistenceFilterChange;
use super::RemoteEvent;
use super::TargetChange;
use super::WatchTargetChange;
use super::WatchTargetChangeState;
use crate::core::TargetData;
use crate::core::TargetPurpose;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::DocumentKeySet;
use crate::model::DocumentMap;
use crate::model::SnapshotVersion;
use crate::model::TargetId;

/// Sync engine state the aggregator consults while building events.
pub(crate) trait TargetMetadataProvider {
    /// Keys the last raised snapshot of the target contained.
    fn get_remote_keys_for_target(
        &self,
        target_id: TargetId,
    ) -> DocumentKeySet;

    /// Data of the target if it is still being listened to.
    fn get_target_data_for_target(
        &self,
        target_id: TargetId,
    ) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Changes accumulated for one target since its last snapshot.
#[derive(Debug)]
struct TargetState {
    /// Outstanding add/remove requests. Changes for a target with pending
    /// responses belong to an earlier incarnation and are dropped.
    pending_responses: i32,
    current: bool,
    has_pending_changes: bool,
    resume_token: Vec<u8>,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            current: false,
            has_pending_changes: true,
            resume_token: Vec::new(),
            document_changes: BTreeMap::new(),
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(
        &mut self,
        resume_token: &[u8],
    ) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let keys = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            keys.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(
        &mut self,
        key: DocumentKey,
        change_type: ChangeType,
    ) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(
        &mut self,
        key: &DocumentKey,
    ) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        if self.pending_responses < 0 {
            warn!("[WatchChangeAggregator] more target responses than requests");
            self.pending_responses = 0;
        }
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Collects watch changes until the backend declares a consistent snapshot,
/// then turns them into one [`RemoteEvent`].
#[derive(Debug, Default)]
pub(crate) struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: DocumentMap,
    /// Targets each pending document update was reported for.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn handle_document_change(
        &mut self,
        change: &DocumentWatchChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in &change.updated_target_ids {
            match &change.document {
                Some(doc) if doc.is_found_document() => self.add_document_to_target(*target_id, doc.clone(), metadata),
                other => self.remove_document_from_target(*target_id, &change.key, other.clone(), metadata),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.document.clone(), metadata);
        }
    }

    pub(crate) fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in self.target_ids_for(change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // The target was added again; earlier changes are obsolete.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the backend's document count for a target with the local
    /// one. A mismatch the bloom filter cannot explain resets the target.
    pub(crate) fn handle_existence_filter(
        &mut self,
        change: &ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_id = change.target_id;
        let expected_count = change.filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };

        if target_data.target.is_document_query() {
            if expected_count == 0 {
                // The document is gone. Resolve it now so no other query can
                // surface it while the target catches up.
                let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) else {
                    return;
                };
                let deleted = Document::new_no_document(key.clone(), SnapshotVersion::MIN);
                self.remove_document_from_target(target_id, &key, Some(deleted), metadata);
            } else if expected_count != 1 {
                warn!(
                    "[WatchChangeAggregator] single document target_id={} reported count {}",
                    target_id, expected_count
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, metadata);
        if current_count == expected_count as i64 {
            return;
        }

        let application = self.apply_bloom_filter(change, current_count, metadata);
        if application != BloomFilterApplication::Success {
            debug!(
                "[WatchChangeAggregator] existence filter mismatch on target_id={}: expected {}, have {} ({:?})",
                target_id, expected_count, current_count, application
            );
            self.reset_target(target_id, metadata);
            let purpose = if application == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        change: &ExistenceFilterChange,
        current_count: i64,
        metadata: &dyn TargetMetadataProvider,
    ) -> BloomFilterApplication {
        let Some(data) = &change.filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let bloom_filter = match BloomFilter::from_data(data) {
            Ok(filter) => filter,
            Err(e) => {
                warn!("[WatchChangeAggregator] ignoring malformed bloom filter: {}", e);
                return BloomFilterApplication::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let removed = self.filter_removed_documents(&bloom_filter, change.target_id, metadata);
        if change.filter.count as i64 != current_count - removed as i64 {
            BloomFilterApplication::FalsePositive
        } else {
            BloomFilterApplication::Success
        }
    }

    /// Removes the target's documents the bloom filter does not contain.
    fn filter_removed_documents(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> usize {
        let mut removed = 0;
        for key in metadata.get_remote_keys_for_target(target_id) {
            if !bloom_filter.might_contain(&key.path().canonical_string()) {
                self.remove_document_from_target(target_id, &key, None, metadata);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything aggregated so far and resets the
    /// per-event state.
    pub(crate) fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let current = self.target_states.get(&target_id).map(|s| s.current).unwrap_or(false);
            if current && target_data.target.is_document_query() {
                // A current single document target without the document means
                // the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key, metadata)
                    {
                        let deleted = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted), metadata);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                match self.target_data_for_active_target(*target_id, metadata) {
                    Some(data) => data.purpose == TargetPurpose::LimboResolution,
                    None => true,
                }
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = mem::take(&mut self.pending_document_updates);
        for doc in document_updates.values_mut() {
            doc.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        trace!(
            "[WatchChangeAggregator] raising snapshot {} with {} target changes and {} documents",
            snapshot_version,
            target_changes.len(),
            document_updates.len()
        );
        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Notes that an add or remove request for `target_id` went out.
    pub(crate) fn record_pending_target_request(
        &mut self,
        target_id: TargetId,
    ) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    pub(crate) fn remove_target(
        &mut self,
        target_id: TargetId,
    ) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        doc: Document,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = doc.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), doc);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<Document>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Entered and left before a snapshot was raised.
            state.remove_document_change(key);
        }

        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(doc) = updated_document {
            self.pending_document_updates.insert(key.clone(), doc);
        }
    }

    fn current_document_count_for_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> i64 {
        let remote = metadata.get_remote_keys_for_target(target_id).len() as i64;
        match self.target_states.get(&target_id) {
            Some(state) => {
                let change = state.to_target_change();
                remote + change.added_documents.len() as i64 - change.removed_documents.len() as i64
            }
            None => remote,
        }
    }

    /// Clears the target's state and schedules removal of every document it
    /// currently holds.
    fn reset_target(
        &mut self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) {
        self.target_states.insert(target_id, TargetState::default());
        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, metadata);
        }
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.get_remote_keys_for_target(target_id).contains(key)
    }

    fn target_ids_for(
        &self,
        change: &WatchTargetChange,
    ) -> Vec<TargetId> {
        if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    fn ensure_target_state(
        &mut self,
        target_id: TargetId,
    ) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        self.target_data_for_active_target(target_id, metadata).is_some()
    }

    /// Target data unless the target has outstanding requests.
    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.get_target_data_for_target(target_id),
        }
    }
}
