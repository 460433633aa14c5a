use std::time::Duration;

use tracing_test::traced_test;

use super::*;
use crate::utils::timer::TimerQueue;
use crate::Code;
use crate::StatusError;

fn tracker() -> (OnlineStateTracker, TimerQueue<TimerId>) {
    (OnlineStateTracker::new(Duration::from_secs(10)), TimerQueue::new())
}

#[test]
fn test_stream_start_arms_timeout() {
    let (mut tracker, mut timers) = tracker();
    assert_eq!(tracker.handle_watch_stream_start(&mut timers), None);
    assert!(timers.is_scheduled(TimerId::OnlineStateTimeout));
    assert_eq!(tracker.state(), OnlineState::Unknown);
}

#[test]
#[traced_test]
fn test_timeout_while_unknown_goes_offline_and_warns_once() {
    let (mut tracker, mut timers) = tracker();
    tracker.handle_watch_stream_start(&mut timers);
    assert_eq!(tracker.handle_online_state_timeout(), Some(OnlineState::Offline));
    assert!(logs_contain("could not reach the backend"));

    // A second timeout in the same state changes nothing.
    assert_eq!(tracker.handle_online_state_timeout(), None);
}

#[test]
fn test_timeout_after_online_is_ignored() {
    let (mut tracker, mut timers) = tracker();
    tracker.handle_watch_stream_start(&mut timers);
    assert_eq!(tracker.set(OnlineState::Online, &mut timers), Some(OnlineState::Online));
    assert!(!timers.is_scheduled(TimerId::OnlineStateTimeout));
    assert_eq!(tracker.handle_online_state_timeout(), None);
}

#[test]
fn test_failure_while_online_gives_stream_another_chance() {
    let (mut tracker, mut timers) = tracker();
    tracker.set(OnlineState::Online, &mut timers);
    let error = StatusError::new(Code::Unavailable, "reset");
    assert_eq!(
        tracker.handle_watch_stream_failure(Some(&error), &mut timers),
        Some(OnlineState::Unknown)
    );
    assert_eq!(
        tracker.handle_watch_stream_failure(Some(&error), &mut timers),
        Some(OnlineState::Offline)
    );
}

#[test]
fn test_failure_while_unknown_goes_offline() {
    let (mut tracker, mut timers) = tracker();
    tracker.handle_watch_stream_start(&mut timers);
    assert_eq!(
        tracker.handle_watch_stream_failure(None, &mut timers),
        Some(OnlineState::Offline)
    );
    assert!(!timers.is_scheduled(TimerId::OnlineStateTimeout));

    // Restarting after a failure keeps the offline state.
    assert_eq!(tracker.handle_watch_stream_start(&mut timers), None);
    assert_eq!(tracker.state(), OnlineState::Offline);
}
