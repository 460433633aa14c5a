use std::collections::BTreeMap;

use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::constants::GLOBAL_REMOTE_DOCUMENT_BYTES;
use crate::convert::decode;
use crate::convert::encode;
use crate::metrics::CACHED_DOCUMENTS;
use crate::metrics::CACHED_DOCUMENT_BYTES;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::DocumentKeySet;
use crate::model::DocumentMap;
use crate::model::ResourcePath;
use crate::model::SnapshotVersion;
#[cfg(test)]
use crate::storage::read_record;
use crate::storage::Keyspace;
use crate::storage::LocalStorage;
use crate::storage::WriteBatch;
use crate::Result;

struct CachedEntry {
    document: Document,
    size: u64,
}

/// Last known server state of every cached document.
///
/// All entries live in memory; changes are written through to the
/// `Documents` keyspace via the caller's [`WriteBatch`].
pub(crate) struct RemoteDocumentCache {
    entries: BTreeMap<DocumentKey, CachedEntry>,
    byte_size: u64,
}

/// Pending document writes applied together once a remote event or an
/// acknowledgement has been processed.
#[derive(Debug, Default)]
pub(crate) struct RemoteDocumentChangeBuffer {
    changes: BTreeMap<DocumentKey, Option<Document>>,
}

impl RemoteDocumentChangeBuffer {
    /// Stages `doc`; its read time must already be set.
    pub(crate) fn add_entry(
        &mut self,
        doc: Document,
    ) {
        self.changes.insert(doc.key().clone(), Some(doc));
    }

    pub(crate) fn remove_entry(
        &mut self,
        key: DocumentKey,
    ) {
        self.changes.insert(key, None);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub(crate) fn keys(&self) -> DocumentKeySet {
        self.changes.keys().cloned().collect()
    }
}

fn storage_key(key: &DocumentKey) -> Vec<u8> {
    key.path().canonical_string().into_bytes()
}

impl RemoteDocumentCache {
    pub(crate) fn load(storage: &dyn LocalStorage) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut byte_size = 0;
        for (raw_key, bytes) in storage.scan_prefix(Keyspace::Documents, &[])? {
            let document: Document = decode(&bytes)?;
            trace!("[RemoteDocumentCache] loaded {:?}", String::from_utf8_lossy(&raw_key));
            let size = bytes.len() as u64;
            byte_size += size;
            entries.insert(document.key().clone(), CachedEntry { document, size });
        }
        debug!("[RemoteDocumentCache] loaded {} documents, {} bytes", entries.len(), byte_size);

        let cache = Self { entries, byte_size };
        cache.update_metrics();
        Ok(cache)
    }

    /// Writes `doc` with `read_time` into the cache.
    pub(crate) fn add(
        &mut self,
        doc: &Document,
        read_time: SnapshotVersion,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        let mut document = doc.clone();
        document.set_read_time(read_time);
        let bytes = encode(&document)?;
        let size = bytes.len() as u64;
        batch.put(Keyspace::Documents, storage_key(document.key()), bytes);

        if let Some(previous) = self.entries.insert(document.key().clone(), CachedEntry { document, size }) {
            self.byte_size -= previous.size;
        }
        self.byte_size += size;
        Ok(())
    }

    pub(crate) fn remove(
        &mut self,
        key: &DocumentKey,
        batch: &mut WriteBatch,
    ) {
        batch.delete(Keyspace::Documents, storage_key(key));
        if let Some(previous) = self.entries.remove(key) {
            self.byte_size -= previous.size;
        }
    }

    /// Stages every buffered change and the updated byte counter.
    #[instrument(skip(self, changes, batch))]
    pub(crate) fn apply_changes(
        &mut self,
        changes: RemoteDocumentChangeBuffer,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        for (key, change) in changes.changes {
            match change {
                Some(doc) => {
                    let read_time = doc.read_time();
                    self.add(&doc, read_time, batch)?;
                }
                None => self.remove(&key, batch),
            }
        }
        batch.put_record(Keyspace::Globals, GLOBAL_REMOTE_DOCUMENT_BYTES, &self.byte_size)?;
        self.update_metrics();
        Ok(())
    }

    /// Cached document for `key`, or an invalid document when unknown.
    #[instrument(skip(self))]
    pub(crate) fn get(
        &self,
        key: &DocumentKey,
    ) -> Document {
        match self.entries.get(key) {
            Some(entry) => entry.document.clone(),
            None => Document::new_invalid(key.clone()),
        }
    }

    pub(crate) fn get_all<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> DocumentMap {
        keys.into_iter().map(|key| (key.clone(), self.get(key))).collect()
    }

    /// Documents directly under `collection`, limited to those read after
    /// `since_read_time` when given.
    pub(crate) fn get_all_from_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: Option<SnapshotVersion>,
    ) -> DocumentMap {
        let mut result = DocumentMap::new();
        let matching = self
            .entries
            .iter()
            .skip_while(|(key, _)| key.path() < collection)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()));
        for (key, entry) in matching {
            let fresh = since_read_time.map_or(true, |since| entry.document.read_time() > since);
            if collection.is_immediate_parent_of(key.path()) && fresh {
                result.insert(key.clone(), entry.document.clone());
            }
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn update_metrics(&self) {
        CACHED_DOCUMENT_BYTES.set(self.byte_size as i64);
        CACHED_DOCUMENTS.set(self.entries.len() as i64);
    }
}

#[cfg(test)]
/// Byte counter as last persisted.
pub(crate) fn persisted_byte_size(storage: &dyn LocalStorage) -> Result<u64> {
    Ok(read_record(storage, Keyspace::Globals, GLOBAL_REMOTE_DOCUMENT_BYTES.as_bytes())?.unwrap_or_default())
}
