//! In-process durable buffer.
//!
//! Implements the full consumer-group contract (cursor, pending set with
//! delivery counts, blocking claims, capacity) without a server. Nothing here
//! survives the process, so it stands in for Redis in tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::traits::{BufferError, DurableBuffer};
use crate::event::{EntryId, Envelope};

/// Bookkeeping for one claimed-but-unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub consumer: String,
    pub delivery_count: u32,
    pub last_delivered: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Last id handed out by `claim_new`
    cursor: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct LogState {
    entries: BTreeMap<EntryId, Vec<u8>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

pub struct InMemoryBuffer {
    state: Mutex<LogState>,
    appended: Notify,
    available: AtomicBool,
    capacity: Option<u64>,
}

impl InMemoryBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Create a buffer that rejects appends once `capacity` entries are stored.
    #[must_use]
    pub fn with_capacity(capacity: Option<u64>) -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
            capacity,
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Entries currently stored in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending ids for a group, in log order.
    #[must_use]
    pub fn pending_ids(&self, group: &str) -> Vec<EntryId> {
        self.state
            .lock()
            .groups
            .get(group)
            .map(|g| g.pending.keys().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn pending_entry(&self, group: &str, id: EntryId) -> Option<PendingEntry> {
        self.state
            .lock()
            .groups
            .get(group)
            .and_then(|g| g.pending.get(&id).cloned())
    }

    fn check_available(&self) -> Result<(), BufferError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BufferError::Unavailable("in-memory buffer offline".into()))
        }
    }

    fn no_group(group: &str) -> BufferError {
        BufferError::Backend(format!("NOGROUP no such consumer group '{}'", group))
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Move up to `max_count` entries past the cursor into the pending set.
    fn claim_new_locked(
        state: &mut LogState,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<Envelope>, BufferError> {
        let LogState { entries, groups, .. } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| Self::no_group(group))?;

        let claimed: Vec<Envelope> = entries
            .range((std::ops::Bound::Excluded(group_state.cursor), std::ops::Bound::Unbounded))
            .take(max_count)
            .map(|(id, payload)| Envelope::new(*id, payload.clone()))
            .collect();

        let now = Instant::now();
        for envelope in &claimed {
            group_state.pending.insert(
                envelope.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    last_delivered: now,
                },
            );
        }
        if let Some(last) = claimed.last() {
            group_state.cursor = last.id;
        }
        Ok(claimed)
    }
}

impl Default for InMemoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableBuffer for InMemoryBuffer {
    async fn ensure_group(&self, group: &str) -> Result<(), BufferError> {
        self.check_available()?;
        self.state.lock().groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn append(&self, payload: &[u8]) -> Result<EntryId, BufferError> {
        self.check_available()?;
        let id = {
            let mut state = self.state.lock();
            let len = state.entries.len() as u64;
            if let Some(capacity) = self.capacity {
                if len >= capacity {
                    return Err(BufferError::Full { len, capacity });
                }
            }
            let id = state.last_id.successor(Self::now_millis());
            state.last_id = id;
            state.entries.insert(id, payload.to_vec());
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn claim_pending(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<Envelope>, BufferError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let LogState { entries, groups, .. } = &mut *state;
        let group_state = groups.get_mut(group).ok_or_else(|| Self::no_group(group))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= max_count {
                break;
            }
            if pending.consumer != consumer {
                continue;
            }
            // Trimmed out from under us: re-deliver with an empty payload so the
            // worker classifies it as malformed and acks it away.
            let payload = entries.get(id).cloned().unwrap_or_default();
            pending.delivery_count += 1;
            pending.last_delivered = now;
            claimed.push(Envelope::new(*id, payload));
        }
        Ok(claimed)
    }

    async fn claim_new(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Envelope>, BufferError> {
        let deadline = Instant::now() + block;
        loop {
            self.check_available()?;

            // Register interest before looking so an append between the check
            // and the wait still wakes us.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claimed = {
                let mut state = self.state.lock();
                Self::claim_new_locked(&mut state, group, consumer, max_count)?
            };
            if !claimed.is_empty() || block.is_zero() {
                return Ok(claimed);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize, BufferError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let LogState { entries, groups, .. } = &mut *state;
        let group_state = groups.get_mut(group).ok_or_else(|| Self::no_group(group))?;

        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(id).is_some() {
                acked += 1;
                entries.remove(id);
            }
        }
        Ok(acked)
    }

    async fn pending_count(&self, group: &str) -> Result<u64, BufferError> {
        self.check_available()?;
        let state = self.state.lock();
        let group_state = state.groups.get(group).ok_or_else(|| Self::no_group(group))?;
        Ok(group_state.pending.len() as u64)
    }
}
