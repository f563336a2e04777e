//! Pool counters and the snapshot exposed to monitoring.

use serde::Serialize;

/// Cumulative event counters, updated under the pool lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub(crate) created: u64,
    pub(crate) destroyed: u64,
    pub(crate) borrowed: u64,
    pub(crate) returned: u64,
    pub(crate) wait_count: u64,
    pub(crate) exhausted: u64,
    pub(crate) validation_failures: u64,
    pub(crate) abandoned: u64,
    pub(crate) evicted: u64,
}

/// Point-in-time view of a pool.
///
/// Gauges (`active`, `idle`, `pending`, `waiting`, `size`) describe the pool
/// right now; everything else counts events since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    /// Connections handed out to borrowers.
    pub active: usize,
    pub idle: usize,
    /// Connections being created, validated or destroyed.
    pub pending: usize,
    /// Borrowers currently queued.
    pub waiting: usize,
    /// `active + idle + pending`, never above `max_active`.
    pub size: usize,
    pub max_active: usize,

    pub created: u64,
    pub destroyed: u64,
    pub borrowed: u64,
    pub returned: u64,
    /// Borrows that had to queue.
    pub wait_count: u64,
    /// Borrows that failed with `PoolExhausted`.
    pub exhausted: u64,
    pub validation_failures: u64,
    pub abandoned: u64,
    pub evicted: u64,
}

impl PoolStats {
    pub(crate) fn apply(mut self, counters: &Counters) -> Self {
        self.created = counters.created;
        self.destroyed = counters.destroyed;
        self.borrowed = counters.borrowed;
        self.returned = counters.returned;
        self.wait_count = counters.wait_count;
        self.exhausted = counters.exhausted;
        self.validation_failures = counters.validation_failures;
        self.abandoned = counters.abandoned;
        self.evicted = counters.evicted;
        self
    }

    /// Open physical connections: created minus destroyed.
    pub fn open(&self) -> u64 {
        self.created.saturating_sub(self.destroyed)
    }
}

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Idle connections probed.
    pub validated: usize,
    /// Idle connections destroyed after a failed probe.
    pub invalid: usize,
    /// Idle connections closed for idle time, age or the idle ceiling.
    pub evicted: usize,
    /// Connections opened to restore `min_idle`.
    pub replenished: usize,
    /// Busy connections reclaimed as abandoned.
    pub abandoned: usize,
    /// Busy connections logged as suspect.
    pub suspect: usize,
}

impl SweepReport {
    pub fn merge(self, other: SweepReport) -> Self {
        Self {
            validated: self.validated + other.validated,
            invalid: self.invalid + other.invalid,
            evicted: self.evicted + other.evicted,
            replenished: self.replenished + other.replenished,
            abandoned: self.abandoned + other.abandoned,
            suspect: self.suspect + other.suspect,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether the pass closed, opened or reported anything. Probes that
    /// all passed do not count.
    pub fn changed(&self) -> bool {
        self.invalid + self.evicted + self.replenished + self.abandoned + self.suspect > 0
    }
}
