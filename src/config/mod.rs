//! Configuration management for the sync client.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Environment variable overrides
//! - Configuration file support
//! - Component-wise validation
mod persistence;
mod query;
mod remote;
mod retry;
pub use persistence::*;
pub use query::*;
pub use remote::*;
pub use retry::*;
use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

const ENV_PREFIX: &str = "DOCSYNC";

/// Main configuration container of the sync client
///
/// Combines all subsystem configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SyncConfig {
    /// Local storage backend
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Write pipeline and stream timers
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Query execution heuristics
    #[serde(default)]
    pub query: QueryEngineConfig,
    /// Backoff policies for streams and one-shot calls
    #[serde(default)]
    pub retry: RetryPolicies,
}

impl SyncConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Sources merged in order (later sources override earlier):
    /// 1. Type defaults
    /// 2. Configuration file from `CONFIG_PATH` (if set)
    /// 3. Environment variables with `DOCSYNC__` prefix
    ///
    /// Callers MUST call `validate()` before using the configuration.
    ///
    /// ```ignore
    /// std::env::set_var("DOCSYNC__REMOTE__MAX_PENDING_WRITES", "4");
    /// let cfg = SyncConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional overrides from a file without validation.
    ///
    /// Environment variables still take precedence over the file.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every subsystem and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.persistence.validate()?;
        self.remote.validate()?;
        self.query.validate()?;
        self.retry.validate()?;
        Ok(self)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
