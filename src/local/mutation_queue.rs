use std::collections::BTreeSet;
use std::collections::VecDeque;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::constants::GLOBAL_NEXT_BATCH_ID_PREFIX;
use crate::constants::GLOBAL_STREAM_TOKEN_PREFIX;
use crate::convert::signed_kv;
use crate::metrics::PENDING_MUTATION_BATCHES;
use crate::model::BatchId;
use crate::model::DocumentKey;
use crate::model::Mutation;
use crate::model::MutationBatch;
use crate::model::ResourcePath;
use crate::model::Timestamp;
use crate::model::BATCH_ID_UNKNOWN;
use crate::storage::read_record;
use crate::storage::scan_records;
use crate::storage::Keyspace;
use crate::storage::LocalStorage;
use crate::storage::WriteBatch;
use crate::Error;
use crate::Result;
use crate::User;

/// Durable FIFO of one user's unacknowledged mutation batches.
///
/// Batch ids increase strictly and are never reused, even across restarts.
/// Batches leave the queue from the head only, so acknowledgements are
/// processed in batch id order.
pub(crate) struct MutationQueue {
    user_key: String,
    batches: VecDeque<MutationBatch>,
    /// (key, batch id) pairs for every queued mutation.
    document_index: BTreeSet<(DocumentKey, BatchId)>,
    next_batch_id: BatchId,
    last_stream_token: Vec<u8>,
}

impl MutationQueue {
    pub(crate) fn load(
        storage: &dyn LocalStorage,
        user: &User,
    ) -> Result<Self> {
        let user_key = user.key();
        let records: Vec<(Vec<u8>, MutationBatch)> =
            scan_records(storage, Keyspace::Mutations, &batch_prefix(&user_key))?;

        let mut queue = Self {
            next_batch_id: 1,
            last_stream_token: Vec::new(),
            batches: VecDeque::with_capacity(records.len()),
            document_index: BTreeSet::new(),
            user_key,
        };
        for (_, batch) in records {
            queue.index_batch(&batch);
            queue.batches.push_back(batch);
        }

        let persisted_next: Option<BatchId> =
            read_record(storage, Keyspace::Globals, queue.next_batch_id_key().as_bytes())?;
        let after_queue = queue.batches.back().map(|b| b.batch_id + 1).unwrap_or(1);
        queue.next_batch_id = persisted_next.unwrap_or(1).max(after_queue);
        queue.last_stream_token =
            read_record(storage, Keyspace::Globals, queue.stream_token_key().as_bytes())?.unwrap_or_default();

        debug!(
            "[MutationQueue] loaded {} batches for user {:?}, next batch id {}",
            queue.batches.len(),
            queue.user_key,
            queue.next_batch_id
        );
        queue.update_metrics();
        Ok(queue)
    }

    /// Appends a new batch and stages it for persistence.
    pub(crate) fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
        batch: &mut WriteBatch,
    ) -> Result<MutationBatch> {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let mutation_batch = MutationBatch::new(batch_id, local_write_time, mutations);
        batch.put_record(Keyspace::Mutations, self.batch_key(batch_id), &mutation_batch)?;
        batch.put_record(Keyspace::Globals, self.next_batch_id_key(), &self.next_batch_id)?;

        trace!("[MutationQueue] queued batch_id={}", batch_id);
        self.index_batch(&mutation_batch);
        self.batches.push_back(mutation_batch.clone());
        self.update_metrics();
        Ok(mutation_batch)
    }

    pub(crate) fn lookup_mutation_batch(
        &self,
        batch_id: BatchId,
    ) -> Option<&MutationBatch> {
        let position = self.position(batch_id)?;
        self.batches.get(position)
    }

    /// First queued batch with an id greater than `batch_id`.
    pub(crate) fn next_mutation_batch_after_batch_id(
        &self,
        batch_id: BatchId,
    ) -> Option<&MutationBatch> {
        self.batches.iter().find(|b| b.batch_id > batch_id)
    }

    pub(crate) fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.batches.back().map(|b| b.batch_id).unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub(crate) fn all_mutation_batches(&self) -> impl Iterator<Item = &MutationBatch> {
        self.batches.iter()
    }

    /// Batches touching `key`, oldest first.
    pub(crate) fn all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<&MutationBatch> {
        let ids: Vec<BatchId> = self
            .document_index
            .range((key.clone(), BatchId::MIN)..=(key.clone(), BatchId::MAX))
            .map(|(_, id)| *id)
            .collect();
        self.batches_by_ids(ids)
    }

    /// Batches touching documents directly under `collection`, oldest first.
    pub(crate) fn all_mutation_batches_affecting_collection(
        &self,
        collection: &ResourcePath,
    ) -> Vec<&MutationBatch> {
        let ids: BTreeSet<BatchId> = self
            .document_index
            .iter()
            .filter(|(key, _)| collection.is_immediate_parent_of(key.path()))
            .map(|(_, id)| *id)
            .collect();
        self.batches_by_ids(ids)
    }

    /// Keys written by any queued batch.
    #[cfg(test)]
    pub(crate) fn mutated_keys(&self) -> crate::model::DocumentKeySet {
        self.document_index.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Removes the batch at the head of the queue.
    pub(crate) fn remove_mutation_batch(
        &mut self,
        batch_id: BatchId,
        batch: &mut WriteBatch,
    ) -> Result<MutationBatch> {
        match self.batches.front() {
            Some(head) if head.batch_id == batch_id => {}
            Some(head) => {
                warn!(
                    "[MutationQueue] refusing to remove batch_id={} before head batch_id={}",
                    batch_id, head.batch_id
                );
                return Err(Error::internal(format!(
                    "can only remove the first batch of the mutation queue, found {} before {}",
                    head.batch_id, batch_id
                )));
            }
            None => {
                return Err(Error::internal(format!(
                    "cannot remove batch {batch_id} from an empty mutation queue"
                )))
            }
        }

        let Some(removed) = self.batches.pop_front() else {
            return Err(Error::internal("mutation queue head vanished"));
        };
        for mutation in &removed.mutations {
            self.document_index.remove(&(mutation.key.clone(), batch_id));
        }
        batch.delete(Keyspace::Mutations, self.batch_key(batch_id));
        trace!("[MutationQueue] removed batch_id={}", batch_id);
        self.update_metrics();
        Ok(removed)
    }

    /// Drops the newest batch after its write failed to commit.
    pub(crate) fn discard_unpersisted_batch(
        &mut self,
        batch_id: BatchId,
    ) {
        if self.batches.back().map(|b| b.batch_id) != Some(batch_id) {
            return;
        }
        if let Some(discarded) = self.batches.pop_back() {
            for mutation in &discarded.mutations {
                self.document_index.remove(&(mutation.key.clone(), batch_id));
            }
            self.update_metrics();
        }
    }

    pub(crate) fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub(crate) fn set_last_stream_token(
        &mut self,
        stream_token: Vec<u8>,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        batch.put_record(Keyspace::Globals, self.stream_token_key(), &stream_token)?;
        self.last_stream_token = stream_token;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.batches.len()
    }

    fn position(
        &self,
        batch_id: BatchId,
    ) -> Option<usize> {
        self.batches.binary_search_by_key(&batch_id, |b| b.batch_id).ok()
    }

    fn batches_by_ids(
        &self,
        ids: impl IntoIterator<Item = BatchId>,
    ) -> Vec<&MutationBatch> {
        let mut ids: Vec<BatchId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter().filter_map(|id| self.lookup_mutation_batch(id)).collect()
    }

    fn index_batch(
        &mut self,
        batch: &MutationBatch,
    ) {
        for mutation in &batch.mutations {
            self.document_index.insert((mutation.key.clone(), batch.batch_id));
        }
    }

    fn batch_key(
        &self,
        batch_id: BatchId,
    ) -> Vec<u8> {
        let mut key = batch_prefix(&self.user_key);
        key.extend_from_slice(&signed_kv(batch_id));
        key
    }

    fn next_batch_id_key(&self) -> String {
        format!("{}{}", GLOBAL_NEXT_BATCH_ID_PREFIX, self.user_key)
    }

    fn stream_token_key(&self) -> String {
        format!("{}{}", GLOBAL_STREAM_TOKEN_PREFIX, self.user_key)
    }

    fn update_metrics(&self) {
        PENDING_MUTATION_BATCHES.set(self.batches.len() as i64);
    }
}

/// Mutations of one user share the prefix `user key ++ 0x00`.
fn batch_prefix(user_key: &str) -> Vec<u8> {
    let mut prefix = user_key.as_bytes().to_vec();
    prefix.push(0);
    prefix
}
