// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ingress acceptor.
//!
//! Serializes a validated [`Event`] and appends it to the durable buffer. A
//! successful return means the buffer has the event, not that it reached
//! permanent storage; delivery is the worker's job from here on.
//!
//! The acceptor never waits on the sink and never holds events in process:
//! if the buffer is down, full or the relay is draining, the caller gets a
//! [`Rejection`] and is expected to retry later.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::traits::{BufferError, DurableBuffer};
use crate::event::{EntryId, Event};

/// Why an event was not accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Buffer unreachable, timed out or at capacity
    #[error("event buffer unavailable")]
    BufferUnavailable,
    /// Drain in progress; no new work is taken
    #[error("service is shutting down")]
    ShuttingDown,
    /// The event could not be parsed or serialized
    #[error("invalid event: {0}")]
    Validation(String),
}

impl Rejection {
    /// Suggested HTTP status code
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::BufferUnavailable | Self::ShuttingDown => 503,
            Self::Validation(_) => 400,
        }
    }

    /// Suggested Retry-After header value (seconds)
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::BufferUnavailable => Some(1),
            Self::ShuttingDown => Some(5),
            Self::Validation(_) => None,
        }
    }

    /// Label for metrics
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::BufferUnavailable => "buffer_unavailable",
            Self::ShuttingDown => "shutting_down",
            Self::Validation(_) => "validation",
        }
    }
}

/// Acceptance counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptorStats {
    pub accepted: u64,
    pub rejected: u64,
}

pub struct Acceptor {
    buffer: Arc<dyn DurableBuffer>,
    drain: CancellationToken,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl Acceptor {
    /// `drain` is the shared shutdown signal; once cancelled every call is rejected.
    pub fn new(buffer: Arc<dyn DurableBuffer>, drain: CancellationToken) -> Self {
        Self {
            buffer,
            drain,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Append the event to the buffer.
    ///
    /// A single append, no read-modify-write: concurrent callers never race.
    pub async fn accept(&self, event: &Event) -> Result<EntryId, Rejection> {
        if self.drain.is_cancelled() {
            return Err(self.reject(Rejection::ShuttingDown));
        }

        let payload = event
            .encode()
            .map_err(|e| self.reject(Rejection::Validation(e.to_string())))?;

        let start = Instant::now();
        match self.buffer.append(&payload).await {
            Ok(id) => {
                crate::metrics::record_append_latency(start.elapsed());
                crate::metrics::record_accepted();
                self.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(id = %id, user_id = event.user_id, "Event accepted");
                Ok(id)
            }
            Err(e) => {
                match &e {
                    BufferError::Full { len, capacity } => {
                        warn!(len, capacity, "Buffer at capacity, rejecting event");
                    }
                    other => warn!(error = %other, "Buffer append failed, rejecting event"),
                }
                Err(self.reject(Rejection::BufferUnavailable))
            }
        }
    }

    /// Count a request whose body never parsed into an [`Event`].
    pub fn reject_invalid(&self, reason: impl Into<String>) -> Rejection {
        self.reject(Rejection::Validation(reason.into()))
    }

    /// Whether new events are still taken.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !self.drain.is_cancelled()
    }

    #[must_use]
    pub fn stats(&self) -> AcceptorStats {
        AcceptorStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, rejection: Rejection) -> Rejection {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_rejected(rejection.reason());
        rejection
    }
}
