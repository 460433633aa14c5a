mod adaptors;
mod storage_engine;

#[cfg(test)]
mod storage_test;

use std::sync::Arc;

#[doc(hidden)]
pub use adaptors::*;
#[doc(hidden)]
pub use storage_engine::*;
use tracing::debug;

use crate::PersistenceConfig;
use crate::Result;

/// Builds the storage backend selected by `config`.
pub fn init_storage(config: &PersistenceConfig) -> Result<Arc<dyn LocalStorage>> {
    if config.enabled {
        debug!("init_storage: sled at {:?}", config.db_path);
        Ok(Arc::new(SledStorage::open_with_config(config)?))
    } else {
        debug!("init_storage: memory");
        Ok(Arc::new(MemoryStorage::new()))
    }
}
