use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{EventSink, SinkError};
use crate::event::Event;

/// In-memory sink with failure injection.
///
/// - `fail_next` queues errors returned by the next writes, in order
/// - `set_available(false)` fails every write as transient until restored
/// - `reject_user` makes any batch containing that user fail permanently
///
/// Writes are all-or-nothing, like a transaction.
pub struct InMemorySink {
    rows: Mutex<Vec<Event>>,
    scripted: Mutex<VecDeque<Option<SinkError>>>,
    rejected_users: Mutex<HashSet<i64>>,
    available: AtomicBool,
    attempts: AtomicU64,
}

impl InMemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            rejected_users: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
            attempts: AtomicU64::new(0),
        }
    }

    /// Return `error` from the next write (queued after any earlier scripted errors).
    pub fn fail_next(&self, error: SinkError) {
        self.scripted.lock().push_back(Some(error));
    }

    /// Let the next write behave normally, keeping later scripted errors queued.
    pub fn pass_next(&self) {
        self.scripted.lock().push_back(None);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn reject_user(&self, user_id: i64) {
        self.rejected_users.lock().insert(user_id);
    }

    /// All rows written so far, in write order.
    #[must_use]
    pub fn rows(&self) -> Vec<Event> {
        self.rows.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `write` calls, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for InMemorySink {
    async fn write(&self, events: &[Event]) -> Result<usize, SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(Some(error)) = self.scripted.lock().pop_front() {
            return Err(error);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(SinkError::Transient("connection refused".into()));
        }
        {
            let rejected = self.rejected_users.lock();
            if let Some(bad) = events.iter().find(|e| rejected.contains(&e.user_id)) {
                return Err(SinkError::Permanent(format!(
                    "check constraint violated for user_id {}",
                    bad.user_id
                )));
            }
        }

        self.rows.lock().extend_from_slice(events);
        Ok(events.len())
    }
}
