//! Per-actor snapshot-frequency policy: decides when to write a new
//! snapshot on read vs write.
use serde::{Deserialize, Serialize};

/// Controls when a repository takes a new snapshot.
///
/// Defaults mirror the source this crate is ported from: a snapshot every
/// 20 events, never on read, always on write, and partition-safe writes
/// allowed by default (a hint forwarded to the storage back-end — the
/// contract only carries the flag, it has no opinion on partition
/// semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// How many events must accumulate before the next snapshot.
    pub frequency: u64,
    /// Whether a snapshot may be written as a side effect of `fetch`.
    pub during_read: bool,
    /// Whether a snapshot may be written as a side effect of `handle`.
    pub during_write: bool,
    /// Hint forwarded to storage: are snapshot writes safe under network
    /// partition semantics for this actor.
    pub during_partition: bool,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            frequency: 20,
            during_read: false,
            during_write: true,
            during_partition: true,
        }
    }
}

impl SnapshotPolicy {
    /// Creates a policy with the default frequency of 20.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the snapshot frequency.
    #[must_use]
    pub fn with_frequency(mut self, frequency: u64) -> Self {
        self.frequency = frequency;
        self
    }

    /// Enables or disables snapshotting as a side effect of `fetch`.
    #[must_use]
    pub fn with_during_read(mut self, enabled: bool) -> Self {
        self.during_read = enabled;
        self
    }

    /// Enables or disables snapshotting as a side effect of `handle`.
    #[must_use]
    pub fn with_during_write(mut self, enabled: bool) -> Self {
        self.during_write = enabled;
        self
    }

    /// Sets the partition-safety hint forwarded to storage.
    #[must_use]
    pub fn with_during_partition(mut self, enabled: bool) -> Self {
        self.during_partition = enabled;
        self
    }

    /// Whether a read-side snapshot should be taken, given how many events
    /// were applied during this fetch.
    #[must_use]
    pub fn should_snapshot_on_read(&self, events_applied_this_fetch: u64) -> bool {
        self.during_read && events_applied_this_fetch > self.frequency
    }

    /// Whether a write-side snapshot should be taken, given the running
    /// count of events accumulated since the last snapshot.
    #[must_use]
    pub fn should_snapshot_on_write(&self, events_since_snapshot: u64) -> bool {
        self.during_write && events_since_snapshot >= self.frequency
    }
}
