use std::time::Duration;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::TimerId;
use crate::utils::timer::TimerQueue;
use crate::StatusError;

/// Connectivity as perceived by the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    /// Not known yet; listeners treat this like online.
    #[default]
    Unknown,
    Online,
    Offline,
}

/// Watch stream failures tolerated before the client reports offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Derives the [`OnlineState`] from watch stream activity.
///
/// The state drops to `Offline` after [`MAX_WATCH_STREAM_FAILURES`]
/// consecutive failed connection attempts, or when a connection attempt
/// stays unanswered for the online-state timeout. Every change is returned
/// to the caller so it can be broadcast.
#[derive(Debug)]
pub(crate) struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    should_warn_client_is_offline: bool,
    timeout: Duration,
}

impl OnlineStateTracker {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            should_warn_client_is_offline: true,
            timeout,
        }
    }

    pub(crate) fn state(&self) -> OnlineState {
        self.state
    }

    /// Called whenever the watch stream starts connecting.
    pub(crate) fn handle_watch_stream_start(
        &mut self,
        timers: &mut TimerQueue<TimerId>,
    ) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_and_broadcast(OnlineState::Unknown);
        if !timers.is_scheduled(TimerId::OnlineStateTimeout) {
            timers.schedule(TimerId::OnlineStateTimeout, self.timeout);
        }
        changed
    }

    pub(crate) fn handle_online_state_timeout(&mut self) -> Option<OnlineState> {
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.log_client_offline_warning_if_necessary(&format!(
            "backend did not respond within {:?}",
            self.timeout
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    pub(crate) fn handle_watch_stream_failure(
        &mut self,
        error: Option<&StatusError>,
        timers: &mut TimerQueue<TimerId>,
    ) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // Give the stream another chance before reporting offline.
            return self.set(OnlineState::Unknown, timers);
        }

        self.watch_stream_failures += 1;
        if self.watch_stream_failures < MAX_WATCH_STREAM_FAILURES {
            return None;
        }
        timers.cancel(TimerId::OnlineStateTimeout);
        let reason = match error {
            Some(e) => format!("connection failed {} times, most recent error: {}", self.watch_stream_failures, e),
            None => format!("connection failed {} times", self.watch_stream_failures),
        };
        self.log_client_offline_warning_if_necessary(&reason);
        self.set_and_broadcast(OnlineState::Offline)
    }

    /// Explicit transition, e.g. a watch message arrived or the network was
    /// disabled.
    pub(crate) fn set(
        &mut self,
        new_state: OnlineState,
        timers: &mut TimerQueue<TimerId>,
    ) -> Option<OnlineState> {
        timers.cancel(TimerId::OnlineStateTimeout);
        self.watch_stream_failures = 0;
        if new_state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(new_state)
    }

    fn set_and_broadcast(
        &mut self,
        new_state: OnlineState,
    ) -> Option<OnlineState> {
        if self.state == new_state {
            return None;
        }
        debug!("[OnlineStateTracker] {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
        Some(new_state)
    }

    fn log_client_offline_warning_if_necessary(
        &mut self,
        details: &str,
    ) {
        if self.should_warn_client_is_offline {
            warn!("[OnlineStateTracker] could not reach the backend: {}", details);
            info!("[OnlineStateTracker] the client will operate in offline mode until it reconnects");
            self.should_warn_client_is_offline = false;
        } else {
            debug!("[OnlineStateTracker] still offline: {}", details);
        }
    }
}
