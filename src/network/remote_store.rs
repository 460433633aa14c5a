//! Network half of the sync engine.
//!
//! [`RemoteStore`] keeps the set of targets the client listens to, drives
//! the watch stream through a [`WatchChangeAggregator`], and feeds queued
//! mutation batches into the write stream. It never calls back into the
//! sync engine: results accumulate as [`RemoteStoreEvent`]s that the caller
//! drains after every interaction.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::ListenRequest;
use super::OnlineState;
use super::OnlineStateTracker;
use super::PersistentStream;
use super::RemoteEvent;
use super::RemoteStreamEvent;
use super::StreamContext;
use super::StreamOutput;
use super::TargetMetadataProvider;
use super::WatchChange;
use super::WatchChangeAggregator;
use super::WatchStreamSpec;
use super::WatchTargetChange;
use super::WatchTargetChangeState;
use super::WriteRequest;
use super::WriteResponse;
use super::WriteStreamSpec;
use crate::core::TargetData;
use crate::local::LocalStore;
use crate::model::BatchId;
use crate::model::DocumentKeySet;
use crate::model::MutationBatch;
use crate::model::MutationBatchResult;
use crate::model::SnapshotVersion;
use crate::model::TargetId;
use crate::model::BATCH_ID_UNKNOWN;
use crate::utils::timer::TimerQueue;
use crate::Error;
use crate::Result;
use crate::StatusError;
use crate::SyncConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum TimerId {
    WatchBackoff,
    WatchIdle,
    WatchHealthCheck,
    WriteBackoff,
    WriteIdle,
    WriteHealthCheck,
    OnlineStateTimeout,
}

/// Keys of the documents the sync engine last reported for a target.
pub(crate) trait RemoteKeysProvider {
    fn remote_keys_for_target(
        &self,
        target_id: TargetId,
    ) -> DocumentKeySet;
}

#[derive(Debug)]
pub(crate) enum RemoteStoreEvent {
    RemoteEvent(RemoteEvent),
    /// The backend removed a target with an error.
    RejectListen { target_id: TargetId, error: StatusError },
    WriteAcknowledged(MutationBatchResult),
    WriteRejected { batch_id: BatchId, error: StatusError },
    OnlineStateChanged(OnlineState),
}

struct ListenMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    remote_keys: &'a dyn RemoteKeysProvider,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn get_remote_keys_for_target(
        &self,
        target_id: TargetId,
    ) -> DocumentKeySet {
        self.remote_keys.remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(
        &self,
        target_id: TargetId,
    ) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

pub(crate) struct RemoteStore {
    /// Targets to (re-)register whenever the watch stream opens.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Batches sent or about to be sent, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    watch_stream: PersistentStream<WatchStreamSpec>,
    write_stream: PersistentStream<WriteStreamSpec>,
    /// Present while the watch stream is started.
    aggregator: Option<WatchChangeAggregator>,
    online_state_tracker: OnlineStateTracker,
    timers: TimerQueue<TimerId>,
    network_enabled: bool,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
    max_pending_writes: usize,
    outbox: Vec<RemoteStoreEvent>,
}

impl RemoteStore {
    pub(crate) fn new(
        context: StreamContext,
        config: &SyncConfig,
    ) -> Self {
        let remote = &config.remote;
        Self {
            listen_targets: BTreeMap::new(),
            write_pipeline: VecDeque::new(),
            watch_stream: PersistentStream::new(
                context.clone(),
                config.retry.watch_stream,
                remote.watch_idle_timeout(),
                remote.health_check_delay(),
            ),
            write_stream: PersistentStream::new(
                context,
                config.retry.write_stream,
                remote.write_idle_timeout(),
                remote.health_check_delay(),
            ),
            aggregator: None,
            online_state_tracker: OnlineStateTracker::new(remote.online_state_timeout()),
            timers: TimerQueue::new(),
            network_enabled: true,
            handshake_complete: false,
            last_stream_token: Vec::new(),
            max_pending_writes: remote.max_pending_writes,
            outbox: Vec::new(),
        }
    }

    /// Results produced since the last call, in order.
    pub(crate) fn take_events(&mut self) -> Vec<RemoteStoreEvent> {
        std::mem::take(&mut self.outbox)
    }

    #[cfg(test)]
    pub(crate) fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub(crate) fn can_use_network(&self) -> bool {
        self.network_enabled
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    #[cfg(test)]
    pub(crate) fn write_pipeline_len(&self) -> usize {
        self.write_pipeline.len()
    }

    #[cfg(test)]
    pub(crate) fn is_listening(
        &self,
        target_id: TargetId,
    ) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    pub(crate) fn enable_network(
        &mut self,
        local_store: &LocalStore,
    ) {
        self.network_enabled = true;
        self.resume_streams(local_store);
    }

    /// Stops both streams and reports the client offline until
    /// [`enable_network`](Self::enable_network).
    pub(crate) fn disable_network(&mut self) {
        self.network_enabled = false;
        self.suspend_streams();
        self.set_online_state(OnlineState::Offline);
    }

    /// Tears the streams down, e.g. before switching users.
    pub(crate) fn suspend_streams(&mut self) {
        self.write_stream.stop(&mut self.timers);
        self.watch_stream.stop(&mut self.timers);
        if !self.write_pipeline.is_empty() {
            debug!(
                "[RemoteStore] stopping write stream with {} pending batches",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.aggregator = None;
    }

    pub(crate) fn resume_streams(
        &mut self,
        local_store: &LocalStore,
    ) {
        if !self.can_use_network() {
            return;
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else {
            self.set_online_state(OnlineState::Unknown);
        }
        self.fill_write_pipeline(local_store);
    }

    /// Restarts both streams with fresh credentials.
    pub(crate) fn handle_credential_change_start(&mut self) {
        info!("[RemoteStore] credentials changed, restarting streams");
        let could_use_network = self.can_use_network();
        self.suspend_streams();
        if could_use_network {
            self.set_online_state(OnlineState::Unknown);
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.network_enabled = false;
        self.suspend_streams();
        self.timers.clear();
        self.listen_targets.clear();
    }

    // -
    // Watch

    /// Starts listening to `target_data`, unless already listening.
    pub(crate) fn listen(
        &mut self,
        target_data: TargetData,
        remote_keys: &dyn RemoteKeysProvider,
    ) {
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        debug!("[RemoteStore] listen target_id={}", target_id);
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else if self.watch_stream.is_open() {
            self.send_watch_request(target_data, remote_keys);
        }
    }

    pub(crate) fn unlisten(
        &mut self,
        target_id: TargetId,
    ) {
        if self.listen_targets.remove(&target_id).is_none() {
            warn!("[RemoteStore] unlisten of unknown target_id={}", target_id);
            return;
        }
        debug!("[RemoteStore] unlisten target_id={}", target_id);
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }

        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle(&mut self.timers);
            } else if self.can_use_network() {
                // Without targets nothing can prove the stream healthy.
                self.set_online_state(OnlineState::Unknown);
            }
        }
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self) {
        self.aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start(&mut self.timers);
        let change = self
            .online_state_tracker
            .handle_watch_stream_start(&mut self.timers);
        self.broadcast(change);
    }

    fn send_watch_request(
        &mut self,
        target_data: TargetData,
        remote_keys: &dyn RemoteKeysProvider,
    ) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let resuming = !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min();
        let expected_count = if resuming {
            Some(remote_keys.remote_keys_for_target(target_id).len() as i32)
        } else {
            None
        };
        let read_time = if target_data.resume_token.is_empty() && !target_data.snapshot_version.is_min() {
            Some(target_data.snapshot_version)
        } else {
            None
        };
        trace!(
            "[RemoteStore] watching target_id={} resume_token={} bytes",
            target_id,
            target_data.resume_token.len()
        );
        self.watch_stream.send(
            ListenRequest::AddTarget {
                target_id,
                target: target_data.target,
                resume_token: target_data.resume_token,
                read_time,
                expected_count,
            },
            &mut self.timers,
        );
    }

    fn send_unwatch_request(
        &mut self,
        target_id: TargetId,
    ) {
        if let Some(aggregator) = self.aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream
            .send(ListenRequest::RemoveTarget { target_id }, &mut self.timers);
    }

    fn on_watch_stream_open(
        &mut self,
        remote_keys: &dyn RemoteKeysProvider,
    ) {
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data, remote_keys);
        }
    }

    fn on_watch_stream_change(
        &mut self,
        change: WatchChange,
        local_store: &LocalStore,
        remote_keys: &dyn RemoteKeysProvider,
    ) {
        // Any message proves the backend reachable.
        self.set_online_state(OnlineState::Online);

        if let WatchChange::Target(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed {
                if let Some(cause) = &target_change.cause {
                    self.handle_target_error(target_change, cause);
                    return;
                }
            }
        }

        let Some(aggregator) = self.aggregator.as_mut() else {
            warn!("[RemoteStore] watch change without an active aggregator");
            return;
        };
        let metadata = ListenMetadata {
            listen_targets: &self.listen_targets,
            remote_keys,
        };
        match &change {
            WatchChange::Document(document_change) => aggregator.handle_document_change(document_change, &metadata),
            WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(filter, &metadata),
            WatchChange::Target(target_change) => aggregator.handle_target_change(target_change, &metadata),
        }

        let snapshot_version = change.snapshot_version();
        if !snapshot_version.is_min() && snapshot_version >= local_store.get_last_remote_snapshot_version() {
            self.raise_watch_snapshot(snapshot_version, remote_keys);
        }
    }

    fn raise_watch_snapshot(
        &mut self,
        snapshot_version: SnapshotVersion,
        remote_keys: &dyn RemoteKeysProvider,
    ) {
        let Some(aggregator) = self.aggregator.as_mut() else {
            return;
        };
        let metadata = ListenMetadata {
            listen_targets: &self.listen_targets,
            remote_keys,
        };
        let event = aggregator.create_remote_event(snapshot_version, &metadata);

        // In-memory tokens; the local store persists them with the event.
        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data = target_data
                    .clone()
                    .with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        // Re-listen to mismatched targets from scratch.
        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            self.listen_targets.insert(
                *target_id,
                target_data
                    .clone()
                    .with_resume_token(Vec::new(), target_data.snapshot_version),
            );
            self.send_unwatch_request(*target_id);
            // The purpose only tags this request, not the stored target.
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(request, remote_keys);
        }

        self.outbox.push(RemoteStoreEvent::RemoteEvent(event));
    }

    fn handle_target_error(
        &mut self,
        change: &WatchTargetChange,
        cause: &StatusError,
    ) {
        for target_id in &change.target_ids {
            if self.listen_targets.remove(target_id).is_some() {
                warn!("[RemoteStore] target_id={} rejected: {}", target_id, cause);
                if let Some(aggregator) = self.aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
                self.outbox.push(RemoteStoreEvent::RejectListen {
                    target_id: *target_id,
                    error: cause.clone(),
                });
            }
        }
    }

    fn on_watch_stream_close(
        &mut self,
        error: Option<StatusError>,
    ) {
        if error.is_none() && self.should_start_watch_stream() {
            warn!("[RemoteStore] watch stream stopped while still needed");
        }
        self.aggregator = None;

        if self.should_start_watch_stream() {
            let change = self
                .online_state_tracker
                .handle_watch_stream_failure(error.as_ref(), &mut self.timers);
            self.broadcast(change);
            self.start_watch_stream();
        } else {
            self.set_online_state(OnlineState::Unknown);
        }
    }

    // -
    // Write

    /// Moves queued batches into the write pipeline up to its cap.
    pub(crate) fn fill_write_pipeline(
        &mut self,
        local_store: &LocalStore,
    ) {
        let mut last_batch_id = self
            .write_pipeline
            .back()
            .map(|b| b.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);
        while self.can_add_to_write_pipeline() {
            let Some(batch) = local_store.next_mutation_batch(last_batch_id) else {
                if self.write_pipeline.is_empty() {
                    self.write_stream.mark_idle(&mut self.timers);
                }
                break;
            };
            last_batch_id = batch.batch_id;
            self.add_to_write_pipeline(batch);
        }

        if self.should_start_write_stream() {
            self.start_write_stream();
        }
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn add_to_write_pipeline(
        &mut self,
        batch: MutationBatch,
    ) {
        trace!("[RemoteStore] batch_id={} enters the write pipeline", batch.batch_id);
        if self.write_stream.is_open() && self.handshake_complete {
            self.send_mutations(&batch);
        }
        self.write_pipeline.push_back(batch);
    }

    fn send_mutations(
        &mut self,
        batch: &MutationBatch,
    ) {
        self.write_stream.send(
            WriteRequest::Mutations {
                stream_token: self.last_stream_token.clone(),
                writes: batch.mutations.clone(),
            },
            &mut self.timers,
        );
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn start_write_stream(&mut self) {
        self.handshake_complete = false;
        self.write_stream.start(&mut self.timers);
    }

    fn on_write_stream_open(
        &mut self,
        local_store: &LocalStore,
    ) {
        self.last_stream_token = local_store.get_last_stream_token();
        self.write_stream.send(
            WriteRequest::Handshake {
                stream_token: self.last_stream_token.clone(),
            },
            &mut self.timers,
        );
    }

    fn on_write_response(
        &mut self,
        response: WriteResponse,
        local_store: &mut LocalStore,
    ) -> Result<()> {
        self.last_stream_token = response.stream_token.clone();

        if !self.handshake_complete {
            self.handshake_complete = true;
            local_store.set_last_stream_token(response.stream_token)?;
            let pending: Vec<MutationBatch> = self.write_pipeline.iter().cloned().collect();
            debug!(
                "[RemoteStore] write handshake complete, sending {} batches",
                pending.len()
            );
            for batch in &pending {
                self.send_mutations(batch);
            }
            return Ok(());
        }

        self.write_stream.reset_backoff();
        let Some(batch) = self.write_pipeline.pop_front() else {
            return Err(Error::internal("write response without a pending batch"));
        };
        let Some(commit_version) = response.commit_version else {
            return Err(Error::internal(format!(
                "write response for batch {} carries no commit version",
                batch.batch_id
            )));
        };
        let result = MutationBatchResult::from(batch, commit_version, response.mutation_results, response.stream_token)?;
        self.outbox.push(RemoteStoreEvent::WriteAcknowledged(result));
        Ok(())
    }

    fn on_write_stream_close(
        &mut self,
        error: Option<StatusError>,
        local_store: &mut LocalStore,
    ) -> Result<()> {
        if error.is_none() && self.should_start_write_stream() {
            warn!("[RemoteStore] write stream stopped while still needed");
        }

        if let Some(error) = error {
            if !self.write_pipeline.is_empty() {
                if self.handshake_complete {
                    self.handle_write_error(error);
                } else {
                    self.handle_handshake_error(error, local_store)?;
                }
            }
        }

        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    fn handle_write_error(
        &mut self,
        error: StatusError,
    ) {
        if !error.code.is_permanent_write_error() {
            debug!("[RemoteStore] transient write error, retrying: {}", error);
            return;
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return;
        };
        warn!("[RemoteStore] batch_id={} rejected: {}", batch.batch_id, error);
        // The request was bad, not the backend; retry the rest right away.
        self.write_stream.inhibit_backoff();
        self.outbox.push(RemoteStoreEvent::WriteRejected {
            batch_id: batch.batch_id,
            error,
        });
    }

    fn handle_handshake_error(
        &mut self,
        error: StatusError,
        local_store: &mut LocalStore,
    ) -> Result<()> {
        if error.code.is_permanent_error() {
            debug!("[RemoteStore] resetting stream token after handshake error: {}", error);
            self.last_stream_token = Vec::new();
            local_store.set_last_stream_token(Vec::new())?;
        }
        Ok(())
    }

    // -
    // Events and timers

    pub(crate) fn handle_stream_event(
        &mut self,
        event: RemoteStreamEvent,
        local_store: &mut LocalStore,
        remote_keys: &dyn RemoteKeysProvider,
    ) -> Result<()> {
        match event {
            RemoteStreamEvent::Watch { generation, event } => {
                match self.watch_stream.handle_event(generation, event, &mut self.timers) {
                    None => {}
                    Some(StreamOutput::Open) => self.on_watch_stream_open(remote_keys),
                    Some(StreamOutput::Message(change)) => {
                        self.watch_stream.reset_backoff();
                        self.on_watch_stream_change(change, local_store, remote_keys);
                    }
                    Some(StreamOutput::Closed(status)) => self.on_watch_stream_close(Some(status)),
                }
                Ok(())
            }
            RemoteStreamEvent::Write { generation, event } => {
                match self.write_stream.handle_event(generation, event, &mut self.timers) {
                    None => Ok(()),
                    Some(StreamOutput::Open) => {
                        self.on_write_stream_open(local_store);
                        Ok(())
                    }
                    Some(StreamOutput::Message(response)) => self.on_write_response(response, local_store),
                    Some(StreamOutput::Closed(status)) => self.on_write_stream_close(Some(status), local_store),
                }
            }
        }
    }

    /// Fires every timer due at `now`.
    pub(crate) fn handle_timers(
        &mut self,
        now: Instant,
        local_store: &mut LocalStore,
    ) -> Result<()> {
        for timer in self.timers.take_expired(now) {
            trace!("[RemoteStore] timer {:?} fired", timer);
            match timer {
                TimerId::WatchBackoff => self.watch_stream.handle_backoff_timer(&mut self.timers),
                TimerId::WriteBackoff => self.write_stream.handle_backoff_timer(&mut self.timers),
                TimerId::WatchHealthCheck => self.watch_stream.handle_health_check_timer(),
                TimerId::WriteHealthCheck => self.write_stream.handle_health_check_timer(),
                TimerId::WatchIdle => {
                    if self.watch_stream.handle_idle_timer(&mut self.timers) {
                        self.on_watch_stream_close(None);
                    }
                }
                TimerId::WriteIdle => {
                    if self.write_stream.handle_idle_timer(&mut self.timers) {
                        self.on_write_stream_close(None, local_store)?;
                    }
                }
                TimerId::OnlineStateTimeout => {
                    let change = self.online_state_tracker.handle_online_state_timeout();
                    self.broadcast(change);
                }
            }
        }
        Ok(())
    }

    fn set_online_state(
        &mut self,
        state: OnlineState,
    ) {
        let change = self.online_state_tracker.set(state, &mut self.timers);
        self.broadcast(change);
    }

    fn broadcast(
        &mut self,
        change: Option<OnlineState>,
    ) {
        if let Some(state) = change {
            self.outbox.push(RemoteStoreEvent::OnlineStateChanged(state));
        }
    }
}
