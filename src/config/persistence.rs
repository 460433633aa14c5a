//! Local persistence configuration
//!
//! ```toml
//! [persistence]
//! enabled = true
//! db_path = "/var/lib/app/docsync"
//! ```

use std::path::PathBuf;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PersistenceConfig {
    /// Keep the mutation queue and document cache on disk
    ///
    /// - `true`: sled database under `db_path`, pending writes survive restarts
    /// - `false`: everything lives in memory
    ///
    /// Default: false
    #[serde(default)]
    pub enabled: bool,

    /// Directory of the on-disk database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Cached document bytes above which the cache is eligible for collection
    ///
    /// Default: 104857600 (100 MiB)
    #[serde(default = "default_cache_size_bytes")]
    pub cache_size_bytes: u64,

    /// Periodic flush interval for the on-disk database (unit: milliseconds)
    ///
    /// `None` keeps sled's own flush cadence.
    #[serde(default)]
    pub flush_every_ms: Option<u64>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: default_db_path(),
            cache_size_bytes: default_cache_size_bytes(),
            flush_every_ms: None,
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.db_path.as_os_str().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "persistence.db_path cannot be empty when persistence is enabled".into(),
            )));
        }
        if self.cache_size_bytes < MIN_CACHE_SIZE_BYTES {
            return Err(Error::Config(ConfigError::Message(format!(
                "persistence.cache_size_bytes must be at least {MIN_CACHE_SIZE_BYTES}"
            ))));
        }
        if self.flush_every_ms == Some(0) {
            return Err(Error::Config(ConfigError::Message(
                "persistence.flush_every_ms cannot be 0".into(),
            )));
        }
        Ok(())
    }
}

const MIN_CACHE_SIZE_BYTES: u64 = 1024 * 1024;

fn default_db_path() -> PathBuf {
    PathBuf::from("./db/docsync")
}
fn default_cache_size_bytes() -> u64 {
    100 * 1024 * 1024
}
