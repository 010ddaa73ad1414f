// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delivery worker.
//!
//! Moves events from the durable buffer into the sink with at-least-once
//! semantics. Each pass of the loop:
//!
//! ```text
//! RecoverPending ──► ReadNew ──► Persist ──► Ack ──┐
//!       ▲                                          │
//!       └──────────────── (backoff on failure) ◄───┘
//! ```
//!
//! An entry is acknowledged only after it has been written to the sink, or
//! after it has been classified as unrecoverable (malformed payload or a
//! permanent sink rejection). Anything else stays pending and is recovered on
//! the next pass, so a crash anywhere between claim and ack loses nothing.
//!
//! Drain is cooperative: the signal is checked at iteration boundaries and
//! during backoff sleeps. The batch in flight always finishes, then one final
//! pending-only pass runs before the worker reports [`WorkerState::Stopped`].

pub mod types;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::traits::{BufferError, DurableBuffer};
use crate::config::RelayConfig;
use crate::event::{EntryId, Envelope, Event};
use crate::resilience::retry::{Backoff, RetryConfig};
use crate::sink::traits::{EventSink, SinkError};

pub use types::{
    ClaimMode, IterationFailure, IterationReport, WorkerCounters, WorkerState, WorkerStats,
};

/// Knobs for one worker, usually taken from [`RelayConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub backoff: RetryConfig,
}

impl WorkerSettings {
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            batch_size: config.batch_size.max(1),
            block: config.block(),
            backoff: config.backoff(),
        }
    }
}

pub struct DeliveryWorker {
    buffer: Arc<dyn DurableBuffer>,
    sink: Arc<dyn EventSink>,
    settings: WorkerSettings,
    backoff: Backoff,
    state: watch::Sender<WorkerState>,
    counters: Arc<WorkerCounters>,
}

impl DeliveryWorker {
    pub fn new(
        buffer: Arc<dyn DurableBuffer>,
        sink: Arc<dyn EventSink>,
        settings: WorkerSettings,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Created);
        let backoff = Backoff::new(settings.backoff.clone());
        Self {
            buffer,
            sink,
            settings,
            backoff,
            state,
            counters: Arc::new(WorkerCounters::default()),
        }
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Counters stay readable after the worker moves into its task.
    #[must_use]
    pub fn counters(&self) -> Arc<WorkerCounters> {
        self.counters.clone()
    }

    #[must_use]
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Run until `drain` fires, then finish pending work and stop.
    ///
    /// No failure ends the loop; sink and buffer errors only pause it.
    #[tracing::instrument(skip(self, drain), fields(group = %self.settings.group, consumer = %self.settings.consumer))]
    pub async fn run(mut self, drain: CancellationToken) -> WorkerStats {
        info!(
            batch_size = self.settings.batch_size,
            block_ms = self.settings.block.as_millis() as u64,
            "Delivery worker running"
        );

        while !drain.is_cancelled() {
            let report = self.run_iteration(ClaimMode::Normal).await;

            if report.is_success() {
                if self.backoff.attempts() > 0 {
                    info!(failures = self.backoff.attempts(), "Delivery recovered");
                    self.backoff.reset();
                    crate::metrics::set_backoff(Duration::ZERO);
                }
                continue;
            }

            let delay = self.backoff.next_delay();
            warn!(
                failure = ?report.failure,
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Delivery iteration failed, backing off"
            );
            crate::metrics::set_backoff(delay);
            self.set_state(WorkerState::BackingOff);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = drain.cancelled() => {}
            }
        }

        self.drain_pending().await;
        self.set_state(WorkerState::Stopped);

        let stats = self.counters.snapshot();
        info!(
            persisted = stats.persisted,
            dropped = stats.total_dropped(),
            "Delivery worker stopped"
        );
        stats
    }

    /// Final pending-only passes. Stops as soon as a pass settles nothing or
    /// fails; whatever is left stays pending for the next run.
    async fn drain_pending(&mut self) {
        self.set_state(WorkerState::Draining);
        info!("Draining pending entries");

        loop {
            let report = self.run_iteration(ClaimMode::PendingOnly).await;
            if report.claimed() == 0 {
                break;
            }
            if !report.is_success() || report.settled() == 0 {
                let left = self.buffer.pending_count(&self.settings.group).await.ok();
                warn!(
                    failure = ?report.failure,
                    pending = ?left,
                    "Drain incomplete, entries stay pending for the next run"
                );
                break;
            }
        }
    }

    /// One `RecoverPending → ReadNew → Persist → Ack` pass.
    ///
    /// Recovered entries always come first in the batch. New entries only
    /// fill the remaining capacity, and the claim blocks only when nothing
    /// was recovered.
    pub async fn run_iteration(&mut self, mode: ClaimMode) -> IterationReport {
        WorkerCounters::add(&self.counters.iterations, 1);
        let mut report = IterationReport::default();
        let batch_size = self.settings.batch_size;

        self.enter(WorkerState::RecoverPending, mode);
        let mut batch = match self
            .buffer
            .claim_pending(&self.settings.group, &self.settings.consumer, batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                self.buffer_failure("claim_pending", &e);
                report.failure = Some(IterationFailure::Buffer);
                return report;
            }
        };
        report.recovered = batch.len();

        if mode == ClaimMode::Normal && batch.len() < batch_size {
            self.enter(WorkerState::ReadNew, mode);
            let wait = if batch.is_empty() { self.settings.block } else { Duration::ZERO };
            match self
                .buffer
                .claim_new(
                    &self.settings.group,
                    &self.settings.consumer,
                    batch_size - batch.len(),
                    wait,
                )
                .await
            {
                Ok(new) => {
                    report.claimed_new = new.len();
                    batch.extend(new);
                }
                Err(e) => {
                    // Recovered entries, if any, are still worth persisting
                    self.buffer_failure("claim_new", &e);
                    report.failure = Some(IterationFailure::Buffer);
                }
            }
        }

        WorkerCounters::add(&self.counters.recovered, report.recovered);
        WorkerCounters::add(&self.counters.claimed, report.claimed_new);
        crate::metrics::record_claimed(report.claimed_new, report.recovered);

        if batch.is_empty() {
            return report;
        }
        if report.recovered > 0 {
            debug!(recovered = report.recovered, "Recovered pending entries");
        }

        self.enter(WorkerState::Persist, mode);
        let settled = self.persist(&batch, &mut report).await;

        // Ack in claim order
        let ack_ids: Vec<EntryId> = batch
            .iter()
            .map(|envelope| envelope.id)
            .filter(|id| settled.contains(id))
            .collect();
        if ack_ids.is_empty() {
            return report;
        }

        self.enter(WorkerState::Ack, mode);
        match self.buffer.ack(&self.settings.group, &ack_ids).await {
            Ok(acked) => {
                report.acked = acked;
                if acked < ack_ids.len() {
                    debug!(expected = ack_ids.len(), acked, "Some entries were already acknowledged");
                }
            }
            Err(e) => {
                // Settled entries stay pending and will be written again
                self.buffer_failure("ack", &e);
                report.failure = Some(IterationFailure::Buffer);
            }
        }

        report
    }

    /// Decode and write a batch. Returns the ids that are settled and may be acked.
    async fn persist(&self, batch: &[Envelope], report: &mut IterationReport) -> HashSet<EntryId> {
        let mut settled = HashSet::with_capacity(batch.len());
        let mut ids = Vec::with_capacity(batch.len());
        let mut events = Vec::with_capacity(batch.len());

        for envelope in batch {
            match envelope.decode() {
                Ok(event) => {
                    ids.push(envelope.id);
                    events.push(event);
                }
                Err(e) => {
                    error!(id = %envelope.id, error = %e, "Dropping malformed entry");
                    report.malformed += 1;
                    settled.insert(envelope.id);
                }
            }
        }
        if report.malformed > 0 {
            WorkerCounters::add(&self.counters.malformed_dropped, report.malformed);
            crate::metrics::record_dropped("malformed", report.malformed);
        }

        if events.is_empty() {
            return settled;
        }

        crate::metrics::record_batch_size(events.len());
        let result = {
            let _timer = crate::metrics::SinkTimer::start();
            self.sink.write(&events).await
        };

        match result {
            Ok(_) => {
                report.persisted += events.len();
                settled.extend(ids.iter().copied());
                WorkerCounters::add(&self.counters.persisted, events.len());
                crate::metrics::record_persisted(events.len());
                debug!(count = events.len(), "Persisted batch");
            }
            Err(e @ SinkError::Transient(_)) => {
                self.sink_failure(&e);
                warn!(error = %e, count = events.len(), "Sink write failed, batch stays pending");
                report.failure = Some(IterationFailure::Sink);
            }
            Err(e @ SinkError::Permanent(_)) => {
                self.sink_failure(&e);
                warn!(error = %e, count = events.len(), "Sink refused batch, isolating events");
                self.isolate(&ids, &events, &mut settled, report).await;
            }
        }

        settled
    }

    /// Write events one at a time to find the ones the sink refuses.
    async fn isolate(
        &self,
        ids: &[EntryId],
        events: &[Event],
        settled: &mut HashSet<EntryId>,
        report: &mut IterationReport,
    ) {
        for (id, event) in ids.iter().zip(events) {
            match self.sink.write(std::slice::from_ref(event)).await {
                Ok(_) => {
                    report.persisted += 1;
                    settled.insert(*id);
                    WorkerCounters::add(&self.counters.persisted, 1);
                    crate::metrics::record_persisted(1);
                }
                Err(SinkError::Permanent(reason)) => {
                    error!(id = %id, user_id = event.user_id, reason = %reason, "Dropping event refused by sink");
                    report.dropped += 1;
                    settled.insert(*id);
                    WorkerCounters::add(&self.counters.permanent_dropped, 1);
                    crate::metrics::record_dropped("permanent", 1);
                }
                Err(e @ SinkError::Transient(_)) => {
                    self.sink_failure(&e);
                    warn!(error = %e, id = %id, "Sink failed during isolation, remaining events stay pending");
                    report.failure = Some(IterationFailure::Sink);
                    return;
                }
            }
        }
    }

    fn enter(&self, state: WorkerState, mode: ClaimMode) {
        // The final pass reports as draining throughout
        if mode == ClaimMode::Normal {
            self.set_state(state);
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
        crate::metrics::set_worker_state(state.as_gauge());
    }

    fn buffer_failure(&self, operation: &str, err: &BufferError) {
        warn!(operation, error = %err, "Buffer call failed");
        WorkerCounters::add(&self.counters.buffer_failures, 1);
        crate::metrics::record_buffer_failure(operation);
    }

    fn sink_failure(&self, err: &SinkError) {
        WorkerCounters::add(&self.counters.sink_failures, 1);
        crate::metrics::record_sink_failure(err.kind());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::memory::InMemoryBuffer;
    use crate::sink::memory::InMemorySink;
    use chrono::Utc;
    use serde_json::Map;

    const GROUP: &str = "writers";
    const CONSUMER: &str = "worker-1";

    fn settings(batch_size: usize) -> WorkerSettings {
        WorkerSettings {
            group: GROUP.into(),
            consumer: CONSUMER.into(),
            batch_size,
            block: Duration::from_millis(20),
            backoff: RetryConfig::delivery(Duration::from_millis(5), Duration::from_millis(20)),
        }
    }

    async fn setup(batch_size: usize) -> (Arc<InMemoryBuffer>, Arc<InMemorySink>, DeliveryWorker) {
        let buffer = Arc::new(InMemoryBuffer::new());
        buffer.ensure_group(GROUP).await.unwrap();
        let sink = Arc::new(InMemorySink::new());
        let worker = DeliveryWorker::new(buffer.clone(), sink.clone(), settings(batch_size));
        (buffer, sink, worker)
    }

    async fn append_users(buffer: &InMemoryBuffer, users: &[i64]) -> Vec<EntryId> {
        let mut ids = vec![];
        for user in users {
            let payload = Event::new(*user, Utc::now(), Map::new()).encode().unwrap();
            ids.push(buffer.append(&payload).await.unwrap());
        }
        ids
    }

    fn users(sink: &InMemorySink) -> Vec<i64> {
        sink.rows().iter().map(|e| e.user_id).collect()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_iteration_persists_and_acks() {
        let (buffer, sink, mut worker) = setup(10).await;
        append_users(&buffer, &[1, 2, 3]).await;

        let report = worker.run_iteration(ClaimMode::Normal).await;

        assert!(report.is_success());
        assert_eq!(report.claimed_new, 3);
        assert_eq!(report.persisted, 3);
        assert_eq!(report.acked, 3);
        assert_eq!(users(&sink), vec![1, 2, 3]);
        assert!(buffer.pending_ids(GROUP).is_empty());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_batch_pending() {
        let (buffer, sink, mut worker) = setup(10).await;
        let ids = append_users(&buffer, &[1, 2, 3]).await;
        sink.fail_next(SinkError::Transient("connection reset".into()));

        let report = worker.run_iteration(ClaimMode::Normal).await;
        assert_eq!(report.failure, Some(IterationFailure::Sink));
        assert_eq!(report.acked, 0);
        assert_eq!(buffer.pending_ids(GROUP), ids);
        assert!(sink.is_empty());

        let report = worker.run_iteration(ClaimMode::Normal).await;
        assert!(report.is_success());
        assert_eq!(report.recovered, 3);
        assert_eq!(users(&sink), vec![1, 2, 3]);
        assert!(buffer.pending_ids(GROUP).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_acked_even_when_sink_fails() {
        let (buffer, sink, mut worker) = setup(10).await;
        let garbage = buffer.append(b"{not json").await.unwrap();
        let valid = append_users(&buffer, &[7]).await;
        sink.fail_next(SinkError::Transient("timeout".into()));

        let report = worker.run_iteration(ClaimMode::Normal).await;

        assert_eq!(report.malformed, 1);
        assert_eq!(report.acked, 1);
        assert_eq!(buffer.pending_ids(GROUP), valid);
        assert!(buffer.pending_entry(GROUP, garbage).is_none());
        assert_eq!(worker.counters().snapshot().malformed_dropped, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_isolates_bad_event() {
        let (buffer, sink, mut worker) = setup(10).await;
        append_users(&buffer, &[1, 13, 2]).await;
        sink.reject_user(13);

        let report = worker.run_iteration(ClaimMode::Normal).await;

        assert!(report.is_success());
        assert_eq!(report.persisted, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.acked, 3);
        assert_eq!(users(&sink), vec![1, 2]);
        assert!(buffer.pending_ids(GROUP).is_empty());

        let stats = worker.counters().snapshot();
        assert_eq!(stats.permanent_dropped, 1);
        assert_eq!(stats.sink_failures, 1);
    }

    #[tokio::test]
    async fn test_transient_during_isolation_stops_and_keeps_rest_pending() {
        let (buffer, sink, mut worker) = setup(10).await;
        let ids = append_users(&buffer, &[1, 2, 3]).await;
        sink.fail_next(SinkError::Permanent("bad row".into()));
        // Event 1 goes through alone, event 2 hits an outage
        sink.pass_next();
        sink.fail_next(SinkError::Transient("connection lost".into()));

        let report = worker.run_iteration(ClaimMode::Normal).await;

        assert_eq!(report.failure, Some(IterationFailure::Sink));
        assert_eq!(report.persisted, 1);
        assert_eq!(report.acked, 1);
        assert_eq!(users(&sink), vec![1]);
        assert_eq!(buffer.pending_ids(GROUP), ids[1..].to_vec());
    }

    #[tokio::test]
    async fn test_transient_on_first_isolated_write_keeps_batch_pending() {
        let (buffer, sink, mut worker) = setup(10).await;
        let ids = append_users(&buffer, &[1, 2, 3]).await;
        sink.fail_next(SinkError::Permanent("bad row".into()));
        sink.fail_next(SinkError::Transient("connection lost".into()));

        let report = worker.run_iteration(ClaimMode::Normal).await;

        assert_eq!(report.failure, Some(IterationFailure::Sink));
        assert_eq!(report.persisted, 0);
        assert_eq!(buffer.pending_ids(GROUP), ids);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_isolation_acks_written_prefix() {
        let (buffer, sink, mut worker) = setup(10).await;
        let ids = append_users(&buffer, &[1, 2, 3]).await;
        sink.fail_next(SinkError::Permanent("bad row".into()));
        sink.reject_user(2);

        let report = worker.run_iteration(ClaimMode::Normal).await;

        assert_eq!(report.persisted, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.acked, ids.len());
        assert_eq!(users(&sink), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_recovered_entries_come_before_new_ones() {
        let (buffer, sink, mut worker) = setup(5).await;
        append_users(&buffer, &[1, 2]).await;
        // A previous run claimed these and died before acking
        buffer.claim_new(GROUP, CONSUMER, 2, Duration::ZERO).await.unwrap();
        append_users(&buffer, &[3, 4]).await;

        let report = worker.run_iteration(ClaimMode::Normal).await;

        assert_eq!(report.recovered, 2);
        assert_eq!(report.claimed_new, 2);
        assert_eq!(users(&sink), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_full_recovery_batch_skips_read_new() {
        let (buffer, sink, mut worker) = setup(2).await;
        append_users(&buffer, &[1, 2, 3]).await;
        buffer.claim_new(GROUP, CONSUMER, 2, Duration::ZERO).await.unwrap();

        let report = worker.run_iteration(ClaimMode::Normal).await;

        assert_eq!(report.recovered, 2);
        assert_eq!(report.claimed_new, 0);
        assert_eq!(users(&sink), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_pending_only_mode_ignores_new_entries() {
        let (buffer, sink, mut worker) = setup(10).await;
        append_users(&buffer, &[1]).await;
        buffer.claim_new(GROUP, CONSUMER, 1, Duration::ZERO).await.unwrap();
        append_users(&buffer, &[2]).await;

        let report = worker.run_iteration(ClaimMode::PendingOnly).await;

        assert_eq!(report.recovered, 1);
        assert_eq!(report.claimed_new, 0);
        assert_eq!(users(&sink), vec![1]);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_buffer_outage_is_reported_not_fatal() {
        let (buffer, _sink, mut worker) = setup(10).await;
        buffer.set_available(false);

        let report = worker.run_iteration(ClaimMode::Normal).await;
        assert_eq!(report.failure, Some(IterationFailure::Buffer));
        assert_eq!(worker.counters().snapshot().buffer_failures, 1);

        buffer.set_available(true);
        assert!(worker.run_iteration(ClaimMode::Normal).await.is_success());
    }

    #[tokio::test]
    async fn test_run_delivers_then_stops_on_drain() {
        let (buffer, sink, worker) = setup(3).await;
        let mut state = worker.subscribe();
        let drain = CancellationToken::new();
        let handle = tokio::spawn(worker.run(drain.clone()));

        append_users(&buffer, &[1, 2, 3, 4, 5]).await;
        let observed = sink.clone();
        wait_until(|| observed.len() == 5).await;

        drain.cancel();
        let stats = handle.await.unwrap();

        assert_eq!(stats.persisted, 5);
        assert_eq!(users(&sink), vec![1, 2, 3, 4, 5]);
        assert_eq!(*state.borrow_and_update(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_run_backs_off_and_recovers_from_sink_outage() {
        let (buffer, sink, worker) = setup(10).await;
        sink.set_available(false);
        append_users(&buffer, &[1, 2]).await;

        let drain = CancellationToken::new();
        let handle = tokio::spawn(worker.run(drain.clone()));

        let observed = sink.clone();
        wait_until(|| observed.attempts() >= 3).await;
        assert!(sink.is_empty());

        sink.set_available(true);
        wait_until(|| observed.len() == 2).await;

        drain.cancel();
        let stats = handle.await.unwrap();
        assert!(stats.sink_failures >= 3);
        assert_eq!(stats.persisted, 2);
        assert!(buffer.pending_ids(GROUP).is_empty());
    }

    #[tokio::test]
    async fn test_drain_finishes_pending_but_reads_nothing_new() {
        let (buffer, sink, worker) = setup(10).await;
        append_users(&buffer, &[1, 2]).await;
        buffer.claim_new(GROUP, CONSUMER, 2, Duration::ZERO).await.unwrap();
        append_users(&buffer, &[3]).await;

        let drain = CancellationToken::new();
        drain.cancel();
        let stats = worker.run(drain).await;

        assert_eq!(stats.recovered, 2);
        assert_eq!(users(&sink), vec![1, 2]);
        // Entry 3 was never claimed and waits for the next run
        assert_eq!(buffer.len(), 1);
        assert!(buffer.pending_ids(GROUP).is_empty());
    }

    #[tokio::test]
    async fn test_drain_leaves_entries_pending_when_sink_is_down() {
        let (buffer, sink, worker) = setup(10).await;
        let ids = append_users(&buffer, &[1, 2]).await;
        buffer.claim_new(GROUP, CONSUMER, 2, Duration::ZERO).await.unwrap();
        sink.set_available(false);

        let drain = CancellationToken::new();
        drain.cancel();
        let stats = worker.run(drain).await;

        assert_eq!(stats.persisted, 0);
        assert_eq!(buffer.pending_ids(GROUP), ids);
    }
}
