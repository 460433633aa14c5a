use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::BackoffPolicy;

/// Jittered exponential backoff driven by a [`BackoffPolicy`].
///
/// The first attempt after a `reset` is immediate. Every later attempt waits
/// the current base delay, spread by up to `jitter_factor` in either
/// direction, and then grows the base by `backoff_factor` up to the cap.
#[derive(Debug, Clone)]
pub(crate) struct ExponentialBackoff {
    policy: BackoffPolicy,
    current_base: Duration,
}

impl ExponentialBackoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current_base: Duration::ZERO,
        }
    }

    /// Delay to wait before the next attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = if self.current_base.is_zero() || self.policy.jitter_factor <= 0.0 {
            self.current_base
        } else {
            let base = self.current_base.as_secs_f64();
            let spread = rand::thread_rng().gen_range(-1.0..=1.0) * self.policy.jitter_factor * base;
            Duration::from_secs_f64((base + spread).max(0.0))
        };

        let grown = Duration::from_nanos(
            (self.current_base.as_nanos() as f64 * self.policy.backoff_factor) as u64,
        );
        self.current_base = grown.clamp(self.policy.initial_delay(), self.policy.max_delay());

        debug!("backoff for {:?} (next base {:?})", delay, self.current_base);
        delay
    }

    /// Next attempt goes out immediately.
    pub(crate) fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Next attempt waits the maximum delay.
    pub(crate) fn reset_to_max(&mut self) {
        self.current_base = self.policy.max_delay();
    }
}
