use async_trait::async_trait;
use thiserror::Error;

use crate::event::Event;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Connection, timeout or pool exhaustion. The whole batch may be retried later.
    #[error("transient sink failure: {0}")]
    Transient(String),
    /// The store refused the data itself (constraint violation, bad value).
    /// Retrying the same rows cannot succeed.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl SinkError {
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Label for metrics and logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }
}

/// Permanent storage for events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Write all events in one transaction: either every row lands or none does.
    /// Returns the number of rows written.
    ///
    /// Duplicate rows are possible when a batch is retried; the sink does not dedupe.
    async fn write(&self, events: &[Event]) -> Result<usize, SinkError>;
}
