//! Public types for the delivery worker.

use std::sync::atomic::{AtomicU64, Ordering};

/// Delivery worker lifecycle state.
///
/// One pass of the loop walks `RecoverPending → ReadNew → Persist → Ack`.
/// Use [`super::DeliveryWorker::subscribe()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, loop not started
    Created,
    /// Re-claiming entries left pending by an earlier pass (or a crashed run)
    RecoverPending,
    /// Claiming entries past the group cursor
    ReadNew,
    /// Writing the batch to the sink
    Persist,
    /// Acknowledging settled entries
    Ack,
    /// Waiting out a sink or buffer failure
    BackingOff,
    /// Drain requested; final pending pass in progress
    Draining,
    /// Loop exited
    Stopped,
}

impl WorkerState {
    /// Numeric value for the state gauge
    #[must_use]
    pub fn as_gauge(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::RecoverPending => 1,
            Self::ReadNew => 2,
            Self::Persist => 3,
            Self::Ack => 4,
            Self::BackingOff => 5,
            Self::Draining => 6,
            Self::Stopped => 7,
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::RecoverPending => write!(f, "recover_pending"),
            Self::ReadNew => write!(f, "read_new"),
            Self::Persist => write!(f, "persist"),
            Self::Ack => write!(f, "ack"),
            Self::BackingOff => write!(f, "backing_off"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Which claims an iteration makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Recover pending, then read new entries with the remaining capacity
    Normal,
    /// Recover pending only (final pass while draining)
    PendingOnly,
}

/// Which backend made an iteration fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationFailure {
    Buffer,
    Sink,
}

/// Outcome of one `RecoverPending → ReadNew → Persist → Ack` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Entries re-delivered from the pending set
    pub recovered: usize,
    /// Entries claimed past the cursor
    pub claimed_new: usize,
    /// Events written to the sink
    pub persisted: usize,
    /// Undecodable entries dropped
    pub malformed: usize,
    /// Events the sink refused permanently and were dropped
    pub dropped: usize,
    /// Entries the buffer confirmed as acknowledged
    pub acked: usize,
    pub failure: Option<IterationFailure>,
}

impl IterationReport {
    #[must_use]
    pub fn claimed(&self) -> usize {
        self.recovered + self.claimed_new
    }

    /// Entries settled this pass (written or dropped), whether or not the ack landed.
    #[must_use]
    pub fn settled(&self) -> usize {
        self.persisted + self.malformed + self.dropped
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Point-in-time copy of the worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub iterations: u64,
    pub claimed: u64,
    pub recovered: u64,
    pub persisted: u64,
    pub malformed_dropped: u64,
    pub permanent_dropped: u64,
    pub sink_failures: u64,
    pub buffer_failures: u64,
}

impl WorkerStats {
    /// Entries lost on purpose (malformed or permanently refused)
    #[must_use]
    pub fn total_dropped(&self) -> u64 {
        self.malformed_dropped + self.permanent_dropped
    }
}

/// Running counters, shared with observers while the worker owns the loop.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub(super) iterations: AtomicU64,
    pub(super) claimed: AtomicU64,
    pub(super) recovered: AtomicU64,
    pub(super) persisted: AtomicU64,
    pub(super) malformed_dropped: AtomicU64,
    pub(super) permanent_dropped: AtomicU64,
    pub(super) sink_failures: AtomicU64,
    pub(super) buffer_failures: AtomicU64,
}

impl WorkerCounters {
    pub(super) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            iterations: self.iterations.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            permanent_dropped: self.permanent_dropped.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            buffer_failures: self.buffer_failures.load(Ordering::Relaxed),
        }
    }
}
