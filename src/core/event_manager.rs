//! Fans view snapshots out to query listeners.
//!
//! Several listeners can share one query; the sync engine only hears about
//! the first listen and the last unlisten of each query.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;

use super::ChangeType;
use super::Query;
use super::ViewSnapshot;
use crate::network::OnlineState;
use crate::Error;
use crate::Result;
use crate::StatusError;

pub(crate) type ListenerId = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is `from_cache` or
    /// `has_pending_writes`.
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot while the client may still be online
    /// and the results are not yet synced.
    pub wait_for_sync_when_online: bool,
}

/// One subscriber of a query.
#[derive(Debug)]
pub(crate) struct QueryListener {
    id: ListenerId,
    query: Query,
    options: ListenOptions,
    sender: mpsc::UnboundedSender<Result<ViewSnapshot>>,
    raised_initial_event: bool,
    snap: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub(crate) fn new(
        id: ListenerId,
        query: Query,
        options: ListenOptions,
        sender: mpsc::UnboundedSender<Result<ViewSnapshot>>,
    ) -> Self {
        Self {
            id,
            query,
            options,
            sender,
            raised_initial_event: false,
            snap: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub(crate) fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether an event was raised.
    pub(crate) fn on_view_snapshot(
        &mut self,
        snap: ViewSnapshot,
    ) -> bool {
        let snap = if self.options.include_metadata_changes {
            snap
        } else {
            let doc_changes = snap
                .doc_changes
                .into_iter()
                .filter(|change| change.change_type != ChangeType::Metadata)
                .collect();
            ViewSnapshot {
                doc_changes,
                excludes_metadata_changes: true,
                ..snap
            }
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snap, self.online_state) {
                self.raise_initial_event(&snap);
                raised = true;
            }
        } else if self.should_raise_event(&snap) {
            self.raise(snap.clone());
            raised = true;
        }
        self.snap = Some(snap);
        raised
    }

    pub(crate) fn on_error(
        &mut self,
        error: StatusError,
    ) {
        let _ = self.sender.send(Err(Error::Status(error)));
    }

    pub(crate) fn apply_online_state_change(
        &mut self,
        online_state: OnlineState,
    ) -> bool {
        self.online_state = online_state;
        let Some(snap) = self.snap.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snap, online_state) {
            self.raise_initial_event(&snap);
            return true;
        }
        false
    }

    fn should_raise_initial_event(
        &self,
        snap: &ViewSnapshot,
        online_state: OnlineState,
    ) -> bool {
        if !snap.from_cache {
            return true;
        }
        // Unknown counts as online.
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snap.docs.is_empty() || snap.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(
        &self,
        snap: &ViewSnapshot,
    ) -> bool {
        if !snap.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snap
            .as_ref()
            .is_some_and(|prev| prev.has_pending_writes() != snap.has_pending_writes());
        if snap.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(
        &mut self,
        snap: &ViewSnapshot,
    ) {
        let initial = ViewSnapshot::from_initial_documents(
            snap.query.clone(),
            snap.docs.clone(),
            snap.mutated_keys.clone(),
            snap.from_cache,
            snap.has_cached_results,
        );
        self.raised_initial_event = true;
        self.raise(initial);
    }

    fn raise(
        &self,
        snap: ViewSnapshot,
    ) {
        if self.sender.send(Ok(snap)).is_err() {
            trace!("[QueryListener] listener {} dropped its receiver", self.id);
        }
    }
}

#[derive(Debug, Default)]
struct QueryListenersInfo {
    view_snap: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

#[derive(Debug, Default)]
pub(crate) struct EventManager {
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

impl EventManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers `listener`. Returns true when it is the first listener of
    /// its query, in which case the caller must start listening.
    pub(crate) fn add_listener(
        &mut self,
        mut listener: QueryListener,
    ) -> bool {
        let canonical_id = listener.query().canonical_id();
        let first_listen = !self.queries.contains_key(&canonical_id);
        let info = self.queries.entry(canonical_id).or_default();

        listener.apply_online_state_change(self.online_state);
        if let Some(snap) = &info.view_snap {
            listener.on_view_snapshot(snap.clone());
        }
        debug!(
            "[EventManager] listener {} added to {} (first={})",
            listener.id(),
            listener.query().canonical_id(),
            first_listen
        );
        info.listeners.push(listener);
        first_listen
    }

    /// Unregisters a listener. Returns true when it was the last one of its
    /// query, in which case the caller must stop listening.
    pub(crate) fn remove_listener(
        &mut self,
        query: &Query,
        listener_id: ListenerId,
    ) -> bool {
        let canonical_id = query.canonical_id();
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return false;
        };
        let before = info.listeners.len();
        info.listeners.retain(|l| l.id() != listener_id);
        if info.listeners.len() == before {
            return false;
        }
        if info.listeners.is_empty() {
            self.queries.remove(&canonical_id);
            return true;
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn has_listeners(
        &self,
        query: &Query,
    ) -> bool {
        self.queries.contains_key(&query.canonical_id())
    }

    pub(crate) fn on_watch_change(
        &mut self,
        snapshots: Vec<ViewSnapshot>,
    ) {
        for snap in snapshots {
            let Some(info) = self.queries.get_mut(&snap.query.canonical_id()) else {
                continue;
            };
            for listener in &mut info.listeners {
                listener.on_view_snapshot(snap.clone());
            }
            info.view_snap = Some(snap);
        }
    }

    /// Fails every listener of `query` and forgets the query.
    pub(crate) fn on_watch_error(
        &mut self,
        query: &Query,
        error: StatusError,
    ) {
        if let Some(mut info) = self.queries.remove(&query.canonical_id()) {
            debug!(
                "[EventManager] failing {} listeners of {}: {}",
                info.listeners.len(),
                query.canonical_id(),
                error
            );
            for listener in &mut info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    pub(crate) fn on_online_state_change(
        &mut self,
        online_state: OnlineState,
    ) {
        self.online_state = online_state;
        for info in self.queries.values_mut() {
            for listener in &mut info.listeners {
                listener.apply_online_state_change(online_state);
            }
        }
    }
}
