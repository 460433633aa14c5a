use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::utils::time::get_duration_since_epoch;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Wall-clock instant with nanosecond precision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    seconds: i64,
    nanos: i32,
}

impl Timestamp {
    pub fn new(
        seconds: i64,
        nanos: i32,
    ) -> Self {
        let total = seconds as i128 * NANOS_PER_SECOND as i128 + nanos as i128;
        Self::from_nanos(total)
    }

    pub fn now() -> Self {
        let elapsed = get_duration_since_epoch();
        Self {
            seconds: elapsed.as_secs() as i64,
            nanos: elapsed.subsec_nanos() as i32,
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::from_nanos(millis as i128 * 1_000_000)
    }

    fn from_nanos(total: i128) -> Self {
        let per_second = NANOS_PER_SECOND as i128;
        Self {
            seconds: total.div_euclid(per_second) as i64,
            nanos: total.rem_euclid(per_second) as i32,
        }
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn nanos(&self) -> i32 {
        self.nanos
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + (self.nanos / 1000) as i64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Timestamp(seconds={}, nanos={})", self.seconds, self.nanos)
    }
}

/// Version of a document or a remote snapshot, as assigned by the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub const MIN: SnapshotVersion = SnapshotVersion(Timestamp { seconds: 0, nanos: 0 });

    pub fn from_timestamp(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "SnapshotVersion({})", self.0)
    }
}
