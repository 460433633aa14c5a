use std::path::Path;

use sled::Batch;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::Keyspace;
use crate::LocalStorage;
use crate::PersistenceConfig;
use crate::Result;
use crate::StorageError;
use crate::WriteBatch;
use crate::WriteOp;

const TREE_NAME: &str = "docsync";

/// On-disk storage backed by one sled tree.
pub struct SledStorage {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        debug!("open sled storage at {:?}", path);
        let db = sled::Config::default()
            .path(path.as_ref())
            .open()
            .map_err(StorageError::Sled)?;
        Self::from_db(db)
    }

    pub fn open_with_config(config: &PersistenceConfig) -> Result<Self> {
        debug!("open sled storage at {:?}", config.db_path);
        let db = sled::Config::default()
            .path(&config.db_path)
            .cache_capacity(config.cache_size_bytes)
            .flush_every_ms(config.flush_every_ms)
            .open()
            .map_err(StorageError::Sled)?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> Result<Self> {
        let tree = db.open_tree(TREE_NAME).map_err(StorageError::Sled)?;
        Ok(Self { db, tree })
    }

    #[cfg(test)]
    pub fn db_size(&self) -> Result<u64> {
        Ok(self.db.size_on_disk().map_err(StorageError::Sled)?)
    }
}

impl LocalStorage for SledStorage {
    #[instrument(skip(self))]
    fn get(
        &self,
        keyspace: Keyspace,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tree
            .get(keyspace.prefixed(key))
            .map_err(StorageError::Sled)?
            .map(|v| v.to_vec()))
    }

    #[instrument(skip(self))]
    fn scan_prefix(
        &self,
        keyspace: Keyspace,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self.tree.scan_prefix(keyspace.prefixed(prefix)) {
            let (key, value) = item.map_err(StorageError::Sled)?;
            entries.push((key[1..].to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn apply(
        &self,
        batch: WriteBatch,
    ) -> Result<()> {
        trace!("SledStorage apply {} ops", batch.len());
        let mut sled_batch = Batch::default();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { keyspace, key, value } => sled_batch.insert(keyspace.prefixed(&key), value),
                WriteOp::Delete { keyspace, key } => sled_batch.remove(keyspace.prefixed(&key)),
            }
        }
        self.tree.apply_batch(sled_batch).map_err(StorageError::Sled)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        trace!("SledStorage flush");
        self.db.flush().map_err(StorageError::Sled)?;
        Ok(())
    }
}
