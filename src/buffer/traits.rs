use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{EntryId, Envelope};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Backend unreachable or timed out. Callers may retry.
    #[error("buffer unavailable: {0}")]
    Unavailable(String),
    /// Backlog reached the configured capacity; nothing was appended.
    #[error("buffer full: {len} entries (max {capacity})")]
    Full { len: u64, capacity: u64 },
    #[error("buffer backend error: {0}")]
    Backend(String),
}

/// An ordered, durable append log with consumer-group bookkeeping.
///
/// Implementations own ordering per claim and the pending set; the delivery
/// worker only consumes these primitives. Acknowledging an id also trims the
/// envelope from the log, so a log is expected to serve a single consumer group.
#[async_trait]
pub trait DurableBuffer: Send + Sync {
    /// Create the log and the consumer group if they don't exist yet.
    /// A new group starts reading from the beginning of the log.
    async fn ensure_group(&self, group: &str) -> Result<(), BufferError>;

    /// Append a payload to the tail of the log.
    async fn append(&self, payload: &[u8]) -> Result<EntryId, BufferError>;

    /// Re-deliver entries already pending for `consumer`, oldest first.
    async fn claim_pending(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<Envelope>, BufferError>;

    /// Claim entries past the group cursor, moving them into the pending set.
    /// Waits up to `block` when nothing is available; `Duration::ZERO` returns immediately.
    async fn claim_new(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Envelope>, BufferError>;

    /// Remove ids from the pending set. Ids that aren't pending are ignored.
    /// Returns how many ids were actually acknowledged.
    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize, BufferError>;

    /// Number of entries claimed but not yet acknowledged across the group.
    async fn pending_count(&self, group: &str) -> Result<u64, BufferError>;
}
