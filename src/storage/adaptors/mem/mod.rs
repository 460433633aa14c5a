use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::trace;

use crate::Keyspace;
use crate::LocalStorage;
use crate::Result;
use crate::WriteBatch;
use crate::WriteOp;

/// In-memory storage; contents are lost when the client stops.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl LocalStorage for MemoryStorage {
    fn get(
        &self,
        keyspace: Keyspace,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(&keyspace.prefixed(key)).cloned())
    }

    fn scan_prefix(
        &self,
        keyspace: Keyspace,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let start = keyspace.prefixed(prefix);
        let data = self.data.read();
        Ok(data
            .range(start.clone()..)
            .take_while(|(k, _)| k.starts_with(&start))
            .map(|(k, v)| (k[1..].to_vec(), v.clone()))
            .collect())
    }

    fn apply(
        &self,
        batch: WriteBatch,
    ) -> Result<()> {
        trace!("MemoryStorage apply {} ops", batch.len());
        let mut data = self.data.write();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { keyspace, key, value } => {
                    data.insert(keyspace.prefixed(&key), value);
                }
                WriteOp::Delete { keyspace, key } => {
                    data.remove(&keyspace.prefixed(&key));
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        trace!("MemoryStorage flush (no-op)");
        Ok(())
    }
}
