//! Remote store tuning
//!
//! Covers the write pipeline, the persistent stream timers and the
//! online-state heuristics of the sync engine.

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RemoteConfig {
    /// Maximum number of mutation batches in flight on the write stream
    ///
    /// Default: 10
    #[serde(default = "default_max_pending_writes")]
    pub max_pending_writes: usize,

    /// How long the client stays `Unknown` before it reports `Offline`
    /// when the watch stream has not produced a message yet
    ///
    /// Default: 10000 (10 seconds)
    #[serde(default = "default_online_state_timeout_ms")]
    pub online_state_timeout_ms: u64,

    /// Close the watch stream after this long without any target
    #[serde(default = "default_idle_timeout_ms")]
    pub watch_idle_timeout_ms: u64,

    /// Close the write stream after this long without pending writes
    #[serde(default = "default_idle_timeout_ms")]
    pub write_idle_timeout_ms: u64,

    /// A stream that stays open this long is healthy and resets its backoff
    ///
    /// Default: 10000 (10 seconds)
    #[serde(default = "default_health_check_delay_ms")]
    pub health_check_delay_ms: u64,

    /// Upper bound on concurrently listened limbo documents
    ///
    /// Additional limbo documents wait in a FIFO queue.
    #[serde(default = "default_max_concurrent_limbo_resolutions")]
    pub max_concurrent_limbo_resolutions: usize,

    /// Capacity of the channel between stream tasks and the worker
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_pending_writes: default_max_pending_writes(),
            online_state_timeout_ms: default_online_state_timeout_ms(),
            watch_idle_timeout_ms: default_idle_timeout_ms(),
            write_idle_timeout_ms: default_idle_timeout_ms(),
            health_check_delay_ms: default_health_check_delay_ms(),
            max_concurrent_limbo_resolutions: default_max_concurrent_limbo_resolutions(),
            stream_buffer_size: default_stream_buffer_size(),
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pending_writes == 0 {
            return Err(Error::Config(ConfigError::Message(
                "remote.max_pending_writes must be at least 1".into(),
            )));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(Error::Config(ConfigError::Message(
                "remote.max_concurrent_limbo_resolutions must be at least 1".into(),
            )));
        }
        if self.stream_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "remote.stream_buffer_size must be at least 1".into(),
            )));
        }
        if self.online_state_timeout_ms == 0 || self.health_check_delay_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "remote timers must be greater than 0".into(),
            )));
        }
        Ok(())
    }

    pub fn online_state_timeout(&self) -> Duration {
        Duration::from_millis(self.online_state_timeout_ms)
    }

    pub fn watch_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_idle_timeout_ms)
    }

    pub fn write_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.write_idle_timeout_ms)
    }

    pub fn health_check_delay(&self) -> Duration {
        Duration::from_millis(self.health_check_delay_ms)
    }
}

fn default_max_pending_writes() -> usize {
    10
}
fn default_online_state_timeout_ms() -> u64 {
    10_000
}
fn default_idle_timeout_ms() -> u64 {
    60_000
}
fn default_health_check_delay_ms() -> u64 {
    10_000
}
fn default_max_concurrent_limbo_resolutions() -> usize {
    100
}
fn default_stream_buffer_size() -> usize {
    64
}
