// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the relay.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `ingest_relay_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `reason`: why an event was rejected or dropped
//! - `kind`: sink failure kind (transient, permanent)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// INGRESS
// ═══════════════════════════════════════════════════════════════════════════

/// Record an event appended to the buffer
pub fn record_accepted() {
    counter!("ingest_relay_events_accepted_total").increment(1);
}

/// Record an event turned away at the door
pub fn record_rejected(reason: &str) {
    counter!(
        "ingest_relay_events_rejected_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record buffer append latency
pub fn record_append_latency(duration: Duration) {
    histogram!("ingest_relay_append_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// DELIVERY
// ═══════════════════════════════════════════════════════════════════════════

/// Record entries claimed in one iteration (recovered = re-delivered from pending)
pub fn record_claimed(new: usize, recovered: usize) {
    counter!("ingest_relay_entries_claimed_total").increment(new as u64);
    counter!("ingest_relay_entries_recovered_total").increment(recovered as u64);
}

/// Record batch size handed to the sink
pub fn record_batch_size(count: usize) {
    histogram!("ingest_relay_batch_size").record(count as f64);
}

/// Record sink write latency
pub fn record_sink_latency(duration: Duration) {
    histogram!("ingest_relay_sink_write_seconds").record(duration.as_secs_f64());
}

/// Record events written to the sink
pub fn record_persisted(count: usize) {
    counter!("ingest_relay_entries_persisted_total").increment(count as u64);
}

/// Record entries dropped without being persisted (loss accounting)
pub fn record_dropped(reason: &str, count: usize) {
    counter!(
        "ingest_relay_entries_dropped_total",
        "reason" => reason.to_string()
    )
    .increment(count as u64);
}

/// Record a failed sink write
pub fn record_sink_failure(kind: &str) {
    counter!(
        "ingest_relay_sink_failures_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a failed buffer call from the worker
pub fn record_buffer_failure(operation: &str) {
    counter!(
        "ingest_relay_buffer_failures_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set the current delivery backoff in seconds (0 when healthy)
pub fn set_backoff(delay: Duration) {
    gauge!("ingest_relay_backoff_seconds").set(delay.as_secs_f64());
}

/// Set worker state (see `WorkerState::as_gauge`)
pub fn set_worker_state(state: u8) {
    gauge!("ingest_relay_worker_state").set(state as f64);
}

/// Timer that records sink latency on drop.
pub struct SinkTimer {
    start: Instant,
}

impl SinkTimer {
    #[must_use]
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }
}

impl Drop for SinkTimer {
    fn drop(&mut self) {
        record_sink_latency(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder installed: every call must be a cheap no-op, never a panic.
    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_accepted();
        record_rejected("buffer_unavailable");
        record_append_latency(Duration::from_millis(1));
        record_claimed(3, 1);
        record_batch_size(4);
        record_persisted(4);
        record_dropped("malformed", 1);
        record_sink_failure("transient");
        record_buffer_failure("ack");
        set_backoff(Duration::from_millis(500));
        set_worker_state(2);
        drop(SinkTimer::start());
    }
}
