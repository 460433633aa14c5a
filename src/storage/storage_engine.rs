use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;
use tracing::trace;

use crate::convert::decode;
use crate::convert::encode;
use crate::Error;
use crate::Result;

/// Logical tables of the local store.
///
/// Adaptors keep every keyspace in one ordered key space, prefixed by
/// [`Keyspace::prefix`], so a [`WriteBatch`] spanning keyspaces commits
/// atomically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Keyspace {
    /// Queued mutation batches, keyed by user and batch id
    Mutations,
    /// Cached remote documents, keyed by document path
    Documents,
    /// Target metadata, keyed by target id
    Targets,
    /// Target membership, keyed by target id and document path
    TargetDocuments,
    /// Single-value metadata records
    Globals,
}

impl Keyspace {
    pub const fn prefix(self) -> u8 {
        match self {
            Keyspace::Mutations => 1,
            Keyspace::Documents => 2,
            Keyspace::Targets => 3,
            Keyspace::TargetDocuments => 4,
            Keyspace::Globals => 5,
        }
    }

    pub(crate) fn prefixed(
        self,
        key: &[u8],
    ) -> Vec<u8> {
        let mut full = Vec::with_capacity(key.len() + 1);
        full.push(self.prefix());
        full.extend_from_slice(key);
        full
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        keyspace: Keyspace,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        keyspace: Keyspace,
        key: Vec<u8>,
    },
}

/// Unit of atomic persistence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn put(
        &mut self,
        keyspace: Keyspace,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) {
        self.ops.push(WriteOp::Put {
            keyspace,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(
        &mut self,
        keyspace: Keyspace,
        key: impl Into<Vec<u8>>,
    ) {
        self.ops.push(WriteOp::Delete {
            keyspace,
            key: key.into(),
        });
    }

    /// Serializes `value` into the keyspace.
    pub fn put_record<T: Serialize>(
        &mut self,
        keyspace: Keyspace,
        key: impl Into<Vec<u8>>,
        value: &T,
    ) -> Result<()> {
        self.put(keyspace, key, encode(value)?);
        Ok(())
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered key-value backend of the local store.
#[cfg_attr(test, automock)]
pub trait LocalStorage: Send + Sync + 'static {
    fn get(
        &self,
        keyspace: Keyspace,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>>;

    /// Entries whose key starts with `prefix`, in key order, with the keys
    /// relative to the keyspace.
    fn scan_prefix(
        &self,
        keyspace: Keyspace,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies every operation of `batch` or none of them.
    fn apply(
        &self,
        batch: WriteBatch,
    ) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn put(
        &self,
        keyspace: Keyspace,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(keyspace, key, value);
        self.apply(batch)
    }

    fn delete(
        &self,
        keyspace: Keyspace,
        key: &[u8],
    ) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.delete(keyspace, key);
        self.apply(batch)
    }
}

/// Reads and deserializes one record.
pub(crate) fn read_record<T: DeserializeOwned>(
    storage: &dyn LocalStorage,
    keyspace: Keyspace,
    key: &[u8],
) -> Result<Option<T>> {
    match storage.get(keyspace, key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Reads and deserializes every record under `prefix`.
pub(crate) fn scan_records<T: DeserializeOwned>(
    storage: &dyn LocalStorage,
    keyspace: Keyspace,
    prefix: &[u8],
) -> Result<Vec<(Vec<u8>, T)>> {
    storage
        .scan_prefix(keyspace, prefix)?
        .into_iter()
        .map(|(key, bytes)| Ok((key, decode(&bytes)?)))
        .collect()
}

/// Storage handle that stops writing once a commit failed.
///
/// A failed commit leaves the in-memory caches ahead of disk, so every later
/// write is refused with [`Error::PrimaryLeaseLost`] instead of persisting
/// state derived from them.
pub struct Persistence {
    storage: Arc<dyn LocalStorage>,
    primary_lease_lost: bool,
}

impl Persistence {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            storage,
            primary_lease_lost: false,
        }
    }

    pub fn storage(&self) -> &dyn LocalStorage {
        self.storage.as_ref()
    }

    pub fn is_primary_lease_lost(&self) -> bool {
        self.primary_lease_lost
    }

    /// Fails fast when the store no longer accepts writes.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.primary_lease_lost {
            return Err(Error::PrimaryLeaseLost(
                "local storage rejected an earlier write".to_string(),
            ));
        }
        Ok(())
    }

    pub fn commit(
        &mut self,
        action: &str,
        batch: WriteBatch,
    ) -> Result<()> {
        self.ensure_writable()?;
        if batch.is_empty() {
            return Ok(());
        }
        trace!("[Persistence] commit {} ({} ops)", action, batch.len());
        if let Err(e) = self.storage.apply(batch) {
            error!("[Persistence] {} failed, local writes disabled: {:?}", action, e);
            self.primary_lease_lost = true;
            return Err(Error::PrimaryLeaseLost(format!("{action}: {e}")));
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }
}
