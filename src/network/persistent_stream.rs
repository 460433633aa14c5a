//! Lifecycle of the long-lived watch and write streams.
//!
//! A [`PersistentStream`] lives on the serial worker. Connecting and reading
//! happen on a spawned task that reports back through one event channel;
//! every report carries the stream generation it was started with, and
//! reports from an older generation are dropped. Closing a stream bumps the
//! generation, so callbacks of a torn-down connection can never reach the
//! sync engine.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::Connection;
use super::CredentialsProvider;
use super::DuplexStream;
use super::Headers;
use super::ListenRequest;
use super::TimerId;
use super::WatchChange;
use super::WriteRequest;
use super::WriteResponse;
use crate::constants::AUTHORIZATION_HEADER;
use crate::constants::CLIENT_ID_HEADER;
use crate::metrics::STREAM_FAILURES;
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::timer::TimerQueue;
use crate::BackoffPolicy;
use crate::Code;
use crate::Result;
use crate::StatusError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamState {
    Initial,
    /// Fetching credentials and connecting.
    Starting,
    Open,
    /// Open for at least the health-check delay.
    Healthy,
    /// Closed by an error; the next start backs off first.
    Error,
    /// Waiting for the backoff timer before reconnecting.
    Backoff,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Watch,
    Write,
}

impl StreamKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            StreamKind::Watch => "watch",
            StreamKind::Write => "write",
        }
    }

    fn backoff_timer(self) -> TimerId {
        match self {
            StreamKind::Watch => TimerId::WatchBackoff,
            StreamKind::Write => TimerId::WriteBackoff,
        }
    }

    fn idle_timer(self) -> TimerId {
        match self {
            StreamKind::Watch => TimerId::WatchIdle,
            StreamKind::Write => TimerId::WriteIdle,
        }
    }

    fn health_check_timer(self) -> TimerId {
        match self {
            StreamKind::Watch => TimerId::WatchHealthCheck,
            StreamKind::Write => TimerId::WriteHealthCheck,
        }
    }
}

/// Report of a stream task.
#[derive(Debug)]
pub(crate) enum StreamEvent<Req, Resp> {
    Opened(mpsc::UnboundedSender<Req>),
    Message(Resp),
    Closed(StatusError),
}

/// Stream reports as seen by the worker's event channel.
#[derive(Debug)]
pub(crate) enum RemoteStreamEvent {
    Watch {
        generation: u64,
        event: StreamEvent<ListenRequest, WatchChange>,
    },
    Write {
        generation: u64,
        event: StreamEvent<WriteRequest, WriteResponse>,
    },
}

/// What a stream report means for the remote store.
#[derive(Debug)]
pub(crate) enum StreamOutput<Resp> {
    Open,
    Message(Resp),
    Closed(StatusError),
}

/// Per-stream protocol glue.
pub(crate) trait StreamSpec: Send + 'static {
    type Request: Send + Debug + 'static;
    type Response: Send + Debug + 'static;

    const KIND: StreamKind;

    fn open(
        connection: Arc<dyn Connection>,
        headers: Headers,
    ) -> BoxFuture<'static, Result<DuplexStream<Self::Request, Self::Response>>>;

    fn wrap(
        generation: u64,
        event: StreamEvent<Self::Request, Self::Response>,
    ) -> RemoteStreamEvent;
}

pub(crate) struct WatchStreamSpec;

impl StreamSpec for WatchStreamSpec {
    type Request = ListenRequest;
    type Response = WatchChange;

    const KIND: StreamKind = StreamKind::Watch;

    fn open(
        connection: Arc<dyn Connection>,
        headers: Headers,
    ) -> BoxFuture<'static, Result<DuplexStream<ListenRequest, WatchChange>>> {
        async move { connection.open_listen_stream(headers).await }.boxed()
    }

    fn wrap(
        generation: u64,
        event: StreamEvent<ListenRequest, WatchChange>,
    ) -> RemoteStreamEvent {
        RemoteStreamEvent::Watch { generation, event }
    }
}

pub(crate) struct WriteStreamSpec;

impl StreamSpec for WriteStreamSpec {
    type Request = WriteRequest;
    type Response = WriteResponse;

    const KIND: StreamKind = StreamKind::Write;

    fn open(
        connection: Arc<dyn Connection>,
        headers: Headers,
    ) -> BoxFuture<'static, Result<DuplexStream<WriteRequest, WriteResponse>>> {
        async move { connection.open_write_stream(headers).await }.boxed()
    }

    fn wrap(
        generation: u64,
        event: StreamEvent<WriteRequest, WriteResponse>,
    ) -> RemoteStreamEvent {
        RemoteStreamEvent::Write { generation, event }
    }
}

/// Collaborators shared by both streams.
#[derive(Clone)]
pub(crate) struct StreamContext {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) credentials: Arc<dyn CredentialsProvider>,
    pub(crate) events: mpsc::UnboundedSender<RemoteStreamEvent>,
    pub(crate) client_id: String,
}

pub(crate) struct PersistentStream<S: StreamSpec> {
    state: StreamState,
    generation: u64,
    backoff: ExponentialBackoff,
    sender: Option<mpsc::UnboundedSender<S::Request>>,
    cancel: Option<CancellationToken>,
    force_token_refresh: bool,
    context: StreamContext,
    idle_timeout: Duration,
    health_check_delay: Duration,
    _spec: PhantomData<S>,
}

impl<S: StreamSpec> PersistentStream<S> {
    pub(crate) fn new(
        context: StreamContext,
        policy: BackoffPolicy,
        idle_timeout: Duration,
        health_check_delay: Duration,
    ) -> Self {
        Self {
            state: StreamState::Initial,
            generation: 0,
            backoff: ExponentialBackoff::new(policy),
            sender: None,
            cancel: None,
            force_token_refresh: false,
            context,
            idle_timeout,
            health_check_delay,
            _spec: PhantomData,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    /// Started streams are connecting, open or waiting to reconnect.
    pub(crate) fn is_started(&self) -> bool {
        matches!(self.state, StreamState::Starting | StreamState::Backoff) || self.is_open()
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::Healthy)
    }

    pub(crate) fn start(
        &mut self,
        timers: &mut TimerQueue<TimerId>,
    ) {
        match self.state {
            StreamState::Error => self.perform_backoff(timers),
            StreamState::Initial => {
                self.state = StreamState::Starting;
                self.open_connection();
            }
            state => debug!("[{}Stream] start ignored in state {:?}", S::KIND.name(), state),
        }
    }

    /// Closes the stream without an error. The next start connects
    /// immediately.
    pub(crate) fn stop(
        &mut self,
        timers: &mut TimerQueue<TimerId>,
    ) {
        if self.is_started() {
            self.close(StreamState::Initial, None, timers);
        }
    }

    /// Skips the backoff before the next start.
    pub(crate) fn inhibit_backoff(&mut self) {
        if self.is_started() {
            return;
        }
        self.state = StreamState::Initial;
        self.backoff.reset();
    }

    pub(crate) fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    /// Arms the idle timer of an open stream with nothing left to do.
    pub(crate) fn mark_idle(
        &mut self,
        timers: &mut TimerQueue<TimerId>,
    ) {
        if self.is_open() && !timers.is_scheduled(S::KIND.idle_timer()) {
            timers.schedule(S::KIND.idle_timer(), self.idle_timeout);
        }
    }

    pub(crate) fn send(
        &mut self,
        request: S::Request,
        timers: &mut TimerQueue<TimerId>,
    ) {
        timers.cancel(S::KIND.idle_timer());
        match &self.sender {
            Some(sender) => {
                trace!("[{}Stream] sending {:?}", S::KIND.name(), request);
                if sender.send(request).is_err() {
                    debug!("[{}Stream] transport dropped before the request was sent", S::KIND.name());
                }
            }
            None => warn!("[{}Stream] cannot send on a stream that is not open", S::KIND.name()),
        }
    }

    /// Applies a report from the stream task.
    pub(crate) fn handle_event(
        &mut self,
        generation: u64,
        event: StreamEvent<S::Request, S::Response>,
        timers: &mut TimerQueue<TimerId>,
    ) -> Option<StreamOutput<S::Response>> {
        if generation != self.generation {
            trace!(
                "[{}Stream] dropping report of generation {} (current {})",
                S::KIND.name(),
                generation,
                self.generation
            );
            return None;
        }
        match event {
            StreamEvent::Opened(sender) => {
                debug!("[{}Stream] open", S::KIND.name());
                self.sender = Some(sender);
                self.state = StreamState::Open;
                timers.schedule(S::KIND.health_check_timer(), self.health_check_delay);
                Some(StreamOutput::Open)
            }
            StreamEvent::Message(response) => Some(StreamOutput::Message(response)),
            StreamEvent::Closed(status) => {
                debug!("[{}Stream] closed: {}", S::KIND.name(), status);
                self.close(StreamState::Error, Some(&status), timers);
                Some(StreamOutput::Closed(status))
            }
        }
    }

    pub(crate) fn handle_backoff_timer(
        &mut self,
        timers: &mut TimerQueue<TimerId>,
    ) {
        if self.state != StreamState::Backoff {
            return;
        }
        self.state = StreamState::Initial;
        self.start(timers);
    }

    pub(crate) fn handle_health_check_timer(&mut self) {
        if self.is_open() {
            trace!("[{}Stream] healthy", S::KIND.name());
            self.state = StreamState::Healthy;
            self.backoff.reset();
        }
    }

    /// Returns whether the idle timer closed the stream.
    pub(crate) fn handle_idle_timer(
        &mut self,
        timers: &mut TimerQueue<TimerId>,
    ) -> bool {
        if !self.is_open() {
            return false;
        }
        debug!("[{}Stream] closing idle stream", S::KIND.name());
        self.close(StreamState::Initial, None, timers);
        true
    }

    fn perform_backoff(
        &mut self,
        timers: &mut TimerQueue<TimerId>,
    ) {
        self.state = StreamState::Backoff;
        let delay = self.backoff.next_delay();
        debug!("[{}Stream] reconnecting in {:?}", S::KIND.name(), delay);
        timers.schedule(S::KIND.backoff_timer(), delay);
    }

    fn close(
        &mut self,
        final_state: StreamState,
        error: Option<&StatusError>,
        timers: &mut TimerQueue<TimerId>,
    ) {
        timers.cancel(S::KIND.idle_timer());
        timers.cancel(S::KIND.health_check_timer());
        timers.cancel(S::KIND.backoff_timer());
        self.generation += 1;

        if final_state != StreamState::Error {
            self.backoff.reset();
        } else if let Some(error) = error {
            STREAM_FAILURES.with_label_values(&[S::KIND.name()]).inc();
            if error.code == Code::ResourceExhausted {
                warn!(
                    "[{}Stream] backend reports exhausted resources, using maximum backoff",
                    S::KIND.name()
                );
                self.backoff.reset_to_max();
            } else if error.code == Code::Unauthenticated && self.state != StreamState::Healthy {
                // The credential expired before the stream became healthy.
                self.context.credentials.invalidate_token();
                self.force_token_refresh = true;
            }
        }

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.sender = None;
        self.state = final_state;
    }

    fn open_connection(&mut self) {
        self.generation += 1;
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());
        let force_refresh = std::mem::take(&mut self.force_token_refresh);
        trace!(
            "[{}Stream] connecting, generation {}",
            S::KIND.name(),
            self.generation
        );
        tokio::spawn(run_stream::<S>(
            self.context.clone(),
            self.generation,
            force_refresh,
            cancel,
        ));
    }
}

async fn run_stream<S: StreamSpec>(
    context: StreamContext,
    generation: u64,
    force_refresh: bool,
    cancel: CancellationToken,
) {
    let report = |event: StreamEvent<S::Request, S::Response>| context.events.send(S::wrap(generation, event)).is_ok();

    let token = tokio::select! {
        _ = cancel.cancelled() => return,
        token = context.credentials.get_token(force_refresh) => token,
    };
    let token = match token {
        Ok(token) => token,
        Err(e) => {
            report(StreamEvent::Closed(StatusError::new(e.code(), e.to_string())));
            return;
        }
    };

    let mut headers = Headers::new();
    headers.insert(CLIENT_ID_HEADER.to_string(), context.client_id.clone());
    if let Some(token) = token {
        headers.insert(AUTHORIZATION_HEADER.to_string(), token.authorization_header());
    }

    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = S::open(context.connection.clone(), headers) => opened,
    };
    let DuplexStream { outgoing, mut incoming } = match opened {
        Ok(stream) => stream,
        Err(e) => {
            report(StreamEvent::Closed(StatusError::new(e.code(), e.to_string())));
            return;
        }
    };
    if !report(StreamEvent::Opened(outgoing)) {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            message = incoming.recv() => match message {
                Some(Ok(response)) => {
                    if !report(StreamEvent::Message(response)) {
                        return;
                    }
                }
                Some(Err(status)) => {
                    report(StreamEvent::Closed(status));
                    return;
                }
                None => {
                    report(StreamEvent::Closed(StatusError::new(
                        Code::Unavailable,
                        format!("{} stream closed by the backend", S::KIND.name()),
                    )));
                    return;
                }
            }
        }
    }
}
