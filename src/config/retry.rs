use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Exponential backoff template
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// First delay after a failure (unit: milliseconds)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Multiplier applied to the delay after every attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random spread applied to every delay, as a fraction of it
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Maximum number of attempts (0 means unlimited)
    #[serde(default)]
    pub max_retries: usize,

    /// Single operation timeout (unit: milliseconds)
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            max_retries: 0,
            timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl BackoffPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(
        &self,
        name: &str,
    ) -> Result<()> {
        if self.backoff_factor < 1.0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}.backoff_factor must be at least 1.0"
            ))));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}.initial_delay_ms cannot exceed max_delay_ms"
            ))));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}.jitter_factor must be within [0, 1]"
            ))));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}.timeout_ms cannot be 0"
            ))));
        }
        Ok(())
    }
}

/// Divide strategies by stream
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryPolicies {
    // Watch stream reconnects
    #[serde(default)]
    pub watch_stream: BackoffPolicy,

    // Write stream reconnects
    #[serde(default)]
    pub write_stream: BackoffPolicy,

    // One-shot RPCs (document reads from the backend)
    #[serde(default = "default_unary_policy")]
    pub unary: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            watch_stream: BackoffPolicy::default(),
            write_stream: BackoffPolicy::default(),
            unary: default_unary_policy(),
        }
    }
}

impl RetryPolicies {
    pub fn validate(&self) -> Result<()> {
        self.watch_stream.validate("retry.watch_stream")?;
        self.write_stream.validate("retry.write_stream")?;
        self.unary.validate("retry.unary")?;
        Ok(())
    }
}

fn default_unary_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        ..BackoffPolicy::default()
    }
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    1.5
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter_factor() -> f64 {
    0.5
}
fn default_op_timeout_ms() -> u64 {
    10_000
}
