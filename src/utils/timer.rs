use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Deadline bookkeeping for timers that run on the serial worker.
///
/// Each timer id has at most one pending deadline. Scheduling an id that is
/// already pending replaces it, cancelling is a plain removal; since the worker
/// is the only caller there is no race between a timer firing and it being
/// cancelled.
#[derive(Debug)]
pub(crate) struct TimerQueue<K> {
    deadlines: BTreeMap<K, Instant>,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self {
            deadlines: BTreeMap::new(),
        }
    }
}

impl<K> TimerQueue<K>
where K: Copy + Ord + Debug
{
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule(
        &mut self,
        id: K,
        delay: Duration,
    ) {
        trace!("schedule timer {:?} in {:?}", id, delay);
        self.deadlines.insert(id, Instant::now() + delay);
    }

    pub(crate) fn cancel(
        &mut self,
        id: K,
    ) -> bool {
        self.deadlines.remove(&id).is_some()
    }

    pub(crate) fn is_scheduled(
        &self,
        id: K,
    ) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Removes and returns every timer due at `now`, earliest first.
    pub(crate) fn take_expired(
        &mut self,
        now: Instant,
    ) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*deadline, *id))
            .collect();
        due.sort();
        for (_, id) in &due {
            self.deadlines.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.deadlines.clear();
    }
}
