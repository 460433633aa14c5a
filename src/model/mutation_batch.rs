use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use super::BatchId;
use super::Document;
use super::DocumentKey;
use super::DocumentKeySet;
use super::FieldMask;
use super::LocalApply;
use super::Mutation;
use super::MutationResult;
use super::SnapshotVersion;
use super::Timestamp;
use crate::Error;
use crate::Result;

/// Sentinel for "no batch".
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations written together by one application call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations.iter().map(|m| m.key.clone()).collect()
    }

    pub fn affects(
        &self,
        key: &DocumentKey,
    ) -> bool {
        self.mutations.iter().any(|m| &m.key == key)
    }

    /// Replays every mutation of this batch for `doc`'s key, in order.
    ///
    /// Each precondition is checked against the document as left by the
    /// previous mutation. Returns the accumulated field mask.
    pub fn apply_to_local_view(
        &self,
        doc: &mut Document,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        let key = doc.key().clone();
        for mutation in self.mutations.iter().filter(|m| m.key == key) {
            if let LocalApply::Applied(next) = mutation.apply_to_local_view(doc, mask.clone(), self.local_write_time) {
                mask = next;
            }
        }
        mask
    }

    /// Applies the acknowledged mutations for `doc`'s key using the results
    /// reported by the backend.
    pub fn apply_to_remote_document(
        &self,
        doc: &mut Document,
        batch_result: &MutationBatchResult,
    ) {
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if &mutation.key == doc.key() {
                mutation.apply_to_remote_document(doc, result);
            }
        }
    }
}

/// A batch together with the backend's commit response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document reached with this commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> Result<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(Error::internal(format!(
                "batch {} has {} mutations but {} results",
                batch.batch_id,
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(m, r)| (m.key.clone(), r.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
