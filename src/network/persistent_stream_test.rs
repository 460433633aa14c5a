use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing_test::traced_test;

use super::*;
use crate::test_utils::FakeBackend;
use crate::test_utils::FakeWatchStream;
use crate::test_utils::FAKE_BACKEND_TIMEOUT;
use crate::utils::timer::TimerQueue;
use crate::BackoffPolicy;
use crate::Code;
use crate::StatusError;
use crate::CLIENT_ID_HEADER;

type Reports = mpsc::UnboundedReceiver<RemoteStreamEvent>;

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        initial_delay_ms: 100,
        max_delay_ms: 1_000,
        jitter_factor: 0.0,
        ..BackoffPolicy::default()
    }
}

fn watch_stream(
    backend: &Arc<FakeBackend>,
    credentials: Arc<dyn CredentialsProvider>,
) -> (PersistentStream<WatchStreamSpec>, Reports) {
    let (events, reports) = mpsc::unbounded_channel();
    let context = StreamContext {
        connection: backend.clone(),
        credentials,
        events,
        client_id: "test-client".to_string(),
    };
    let stream = PersistentStream::new(
        context,
        policy(),
        Duration::from_secs(60),
        Duration::from_secs(10),
    );
    (stream, reports)
}

async fn next_report(reports: &mut Reports) -> (u64, StreamEvent<ListenRequest, WatchChange>) {
    match timeout(FAKE_BACKEND_TIMEOUT, reports.recv()).await {
        Ok(Some(RemoteStreamEvent::Watch { generation, event })) => (generation, event),
        other => panic!("expected a watch report, got {:?}", other),
    }
}

/// Starts `stream` and applies its open report.
async fn open(
    stream: &mut PersistentStream<WatchStreamSpec>,
    reports: &mut Reports,
    backend: &FakeBackend,
    timers: &mut TimerQueue<TimerId>,
) -> FakeWatchStream {
    stream.start(timers);
    assert_eq!(stream.state(), StreamState::Starting);
    let fake = backend.next_watch_stream().await;
    let (generation, event) = next_report(reports).await;
    assert!(matches!(
        stream.handle_event(generation, event, timers),
        Some(StreamOutput::Open)
    ));
    fake
}

async fn fail_with(
    stream: &mut PersistentStream<WatchStreamSpec>,
    reports: &mut Reports,
    fake: &FakeWatchStream,
    code: Code,
    timers: &mut TimerQueue<TimerId>,
) {
    fake.fail(StatusError::new(code, "stream failed")).await;
    let (generation, event) = next_report(reports).await;
    assert!(matches!(
        stream.handle_event(generation, event, timers),
        Some(StreamOutput::Closed(status)) if status.code == code
    ));
}

#[tokio::test]
async fn test_open_stream_sends_requests_and_forwards_messages() {
    let backend = FakeBackend::new();
    let (mut stream, mut reports) = watch_stream(&backend, Arc::new(EmptyCredentialsProvider::new()));
    let mut timers = TimerQueue::new();

    let mut fake = open(&mut stream, &mut reports, &backend, &mut timers).await;
    assert!(stream.is_open());
    assert!(timers.is_scheduled(TimerId::WatchHealthCheck));
    assert_eq!(fake.headers.get(CLIENT_ID_HEADER).map(String::as_str), Some("test-client"));

    stream.send(ListenRequest::RemoveTarget { target_id: 2 }, &mut timers);
    assert_eq!(fake.next_request().await, ListenRequest::RemoveTarget { target_id: 2 });

    let change = WatchChange::Target(WatchTargetChange::new(WatchTargetChangeState::Current, vec![2]));
    fake.respond(change.clone()).await;
    let (generation, event) = next_report(&mut reports).await;
    match stream.handle_event(generation, event, &mut timers) {
        Some(StreamOutput::Message(received)) => assert_eq!(received, change),
        other => panic!("unexpected output {:?}", other),
    }
}

#[tokio::test]
async fn test_reports_of_a_stopped_generation_are_dropped() {
    let backend = FakeBackend::new();
    let (mut stream, mut reports) = watch_stream(&backend, Arc::new(EmptyCredentialsProvider::new()));
    let mut timers = TimerQueue::new();
    let _fake = open(&mut stream, &mut reports, &backend, &mut timers).await;

    stream.stop(&mut timers);
    assert_eq!(stream.state(), StreamState::Initial);
    assert!(!timers.is_scheduled(TimerId::WatchHealthCheck));

    let stale = StreamEvent::Closed(StatusError::new(Code::Unavailable, "late"));
    assert!(stream.handle_event(1, stale, &mut timers).is_none());
    assert_eq!(stream.state(), StreamState::Initial);
}

#[tokio::test]
async fn test_error_close_backs_off_before_reconnecting() {
    let backend = FakeBackend::new();
    let (mut stream, mut reports) = watch_stream(&backend, Arc::new(EmptyCredentialsProvider::new()));
    let mut timers = TimerQueue::new();
    let fake = open(&mut stream, &mut reports, &backend, &mut timers).await;

    fail_with(&mut stream, &mut reports, &fake, Code::Unavailable, &mut timers).await;
    assert_eq!(stream.state(), StreamState::Error);
    assert!(!stream.is_started());

    stream.start(&mut timers);
    assert_eq!(stream.state(), StreamState::Backoff);
    assert!(timers.is_scheduled(TimerId::WatchBackoff));

    stream.handle_backoff_timer(&mut timers);
    assert_eq!(stream.state(), StreamState::Starting);
    let _reconnected = backend.next_watch_stream().await;
}

#[tokio::test]
async fn test_resource_exhausted_waits_the_maximum_delay() {
    let backend = FakeBackend::new();
    let (mut stream, mut reports) = watch_stream(&backend, Arc::new(EmptyCredentialsProvider::new()));
    let mut timers = TimerQueue::new();
    let fake = open(&mut stream, &mut reports, &backend, &mut timers).await;

    fail_with(&mut stream, &mut reports, &fake, Code::ResourceExhausted, &mut timers).await;
    stream.start(&mut timers);
    let deadline = timers.next_deadline().unwrap();
    assert!(deadline >= Instant::now() + Duration::from_millis(900));
}

#[tokio::test]
async fn test_unauthenticated_before_healthy_refreshes_token() {
    let backend = FakeBackend::new();
    let mut credentials = MockCredentialsProvider::new();
    credentials
        .expect_get_token()
        .withf(|force_refresh| !*force_refresh)
        .times(1)
        .returning(|_| Ok(None));
    credentials
        .expect_get_token()
        .withf(|force_refresh| *force_refresh)
        .times(1)
        .returning(|_| Ok(None));
    credentials.expect_invalidate_token().times(1).return_const(());
    let (mut stream, mut reports) = watch_stream(&backend, Arc::new(credentials));
    let mut timers = TimerQueue::new();

    let fake = open(&mut stream, &mut reports, &backend, &mut timers).await;
    fail_with(&mut stream, &mut reports, &fake, Code::Unauthenticated, &mut timers).await;

    stream.start(&mut timers);
    stream.handle_backoff_timer(&mut timers);
    let _reconnected = backend.next_watch_stream().await;
}

#[tokio::test]
async fn test_health_check_marks_stream_healthy() {
    let backend = FakeBackend::new();
    let (mut stream, mut reports) = watch_stream(&backend, Arc::new(EmptyCredentialsProvider::new()));
    let mut timers = TimerQueue::new();
    let _fake = open(&mut stream, &mut reports, &backend, &mut timers).await;

    stream.handle_health_check_timer();
    assert_eq!(stream.state(), StreamState::Healthy);
    assert!(stream.is_open());
}

#[tokio::test]
async fn test_idle_timer_closes_stream_unless_used() {
    let backend = FakeBackend::new();
    let (mut stream, mut reports) = watch_stream(&backend, Arc::new(EmptyCredentialsProvider::new()));
    let mut timers = TimerQueue::new();
    let _fake = open(&mut stream, &mut reports, &backend, &mut timers).await;

    stream.mark_idle(&mut timers);
    assert!(timers.is_scheduled(TimerId::WatchIdle));
    stream.send(ListenRequest::RemoveTarget { target_id: 2 }, &mut timers);
    assert!(!timers.is_scheduled(TimerId::WatchIdle));

    stream.mark_idle(&mut timers);
    assert!(stream.handle_idle_timer(&mut timers));
    assert_eq!(stream.state(), StreamState::Initial);
    assert!(!stream.handle_idle_timer(&mut timers));
}

#[tokio::test]
async fn test_failed_open_is_reported_as_close() {
    let backend = FakeBackend::new();
    backend.fail_open(StatusError::new(Code::Unavailable, "refused"));
    let (mut stream, mut reports) = watch_stream(&backend, Arc::new(EmptyCredentialsProvider::new()));
    let mut timers = TimerQueue::new();

    stream.start(&mut timers);
    let (generation, event) = next_report(&mut reports).await;
    assert!(matches!(
        stream.handle_event(generation, event, &mut timers),
        Some(StreamOutput::Closed(status)) if status.code == Code::Unavailable
    ));
    assert_eq!(stream.state(), StreamState::Error);
}

#[test]
#[traced_test]
fn test_send_on_closed_stream_is_logged() {
    let backend = FakeBackend::new();
    let (mut stream, _reports) = watch_stream(&backend, Arc::new(EmptyCredentialsProvider::new()));
    let mut timers = TimerQueue::new();
    stream.send(ListenRequest::RemoveTarget { target_id: 2 }, &mut timers);
    assert!(logs_contain("cannot send on a stream that is not open"));
}
