// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay lifecycle: wire the buffer, sink, acceptor and worker together.
//!
//! ```rust,no_run
//! use ingest_relay::{Relay, RelayConfig};
//!
//! # async fn example() -> Result<(), ingest_relay::RelayError> {
//! let relay = Relay::start(RelayConfig::default()).await?;
//! let app = relay.router();
//! // ... serve `app` until a signal arrives ...
//! let report = relay.shutdown().await;
//! println!("drain: {:?}", report.outcome);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::buffer::redis::RedisStreamBuffer;
use crate::buffer::traits::{BufferError, DurableBuffer};
use crate::config::RelayConfig;
use crate::ingress::{Acceptor, AcceptorStats};
use crate::resilience::retry::{retry, RetryConfig};
use crate::server::{build_router, AppState};
use crate::shutdown::{DrainOutcome, ShutdownCoordinator};
use crate::sink::postgres::PostgresSink;
use crate::sink::traits::{EventSink, SinkError};
use crate::worker::{DeliveryWorker, WorkerCounters, WorkerSettings, WorkerState, WorkerStats};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// What [`Relay::shutdown`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub outcome: DrainOutcome,
    /// `None` when the worker had to be aborted
    pub worker: Option<WorkerStats>,
    pub acceptor: AcceptorStats,
}

pub struct Relay {
    acceptor: Arc<Acceptor>,
    buffer: Arc<dyn DurableBuffer>,
    group: String,
    worker_state: watch::Receiver<WorkerState>,
    counters: Arc<WorkerCounters>,
    coordinator: ShutdownCoordinator,
    worker: JoinHandle<WorkerStats>,
}

impl Relay {
    /// Connect to Redis and Postgres, then start delivering.
    #[tracing::instrument(skip(config), fields(stream = %config.stream_key, consumer = %config.consumer_name))]
    pub async fn start(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate().map_err(RelayError::Config)?;

        let buffer = RedisStreamBuffer::connect(&config.redis_url, config.stream_key.clone())
            .await?
            .with_capacity(config.buffer_max_len)
            .with_op_timeout(config.buffer_timeout());
        let sink = PostgresSink::connect(&config.database_url).await?;

        Self::with_backends(config, Arc::new(buffer), Arc::new(sink)).await
    }

    /// Start on already-constructed backends. The consumer group is created if missing.
    pub async fn with_backends(
        config: RelayConfig,
        buffer: Arc<dyn DurableBuffer>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, RelayError> {
        config.validate().map_err(RelayError::Config)?;

        retry("buffer_ensure_group", &RetryConfig::startup(), || {
            buffer.ensure_group(&config.consumer_group)
        })
        .await?;

        let coordinator = ShutdownCoordinator::new(config.shutdown_grace());
        let acceptor = Arc::new(Acceptor::new(buffer.clone(), coordinator.drain_signal()));

        let worker = DeliveryWorker::new(buffer.clone(), sink, WorkerSettings::from_config(&config));
        let worker_state = worker.subscribe();
        let counters = worker.counters();
        let worker = coordinator.spawn(worker.run(coordinator.drain_signal()));

        info!(
            group = %config.consumer_group,
            consumer = %config.consumer_name,
            batch_size = config.batch_size,
            "Relay started"
        );

        Ok(Self {
            acceptor,
            buffer,
            group: config.consumer_group,
            worker_state,
            counters,
            coordinator,
            worker,
        })
    }

    #[must_use]
    pub fn router(&self) -> axum::Router {
        build_router(AppState {
            acceptor: self.acceptor.clone(),
            worker_state: self.worker_state.clone(),
        })
    }

    #[must_use]
    pub fn acceptor(&self) -> Arc<Acceptor> {
        self.acceptor.clone()
    }

    /// Cancelling this token starts the drain (same as [`Relay::shutdown`] without waiting).
    #[must_use]
    pub fn drain_signal(&self) -> CancellationToken {
        self.coordinator.drain_signal()
    }

    #[must_use]
    pub fn worker_state(&self) -> WorkerState {
        *self.worker_state.borrow()
    }

    #[must_use]
    pub fn worker_stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub async fn pending_count(&self) -> Result<u64, BufferError> {
        self.buffer.pending_count(&self.group).await
    }

    /// Stop accepting, let the worker finish its batch and the pending pass,
    /// then stop. Bounded by the configured grace period.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(self) -> ShutdownReport {
        let outcome = self.coordinator.shutdown().await;

        let worker = match outcome {
            DrainOutcome::Completed => match self.worker.await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(error = %e, "Delivery worker ended abnormally");
                    None
                }
            },
            DrainOutcome::TimedOut => {
                // Whatever it held stays pending in the buffer for the next run
                self.worker.abort();
                None
            }
        };

        let report = ShutdownReport {
            outcome,
            worker,
            acceptor: self.acceptor.stats(),
        };
        info!(?report, "Relay stopped");
        report
    }
}
