// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Provides configurable retry behavior for transient failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use ingest_relay::{Backoff, RetryConfig};
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Daemon: never give up on reconnection
//! let daemon = RetryConfig::daemon();
//! assert_eq!(daemon.max_retries, None); // Infinite
//!
//! // Delivery loop: bounded exponential pauses between failed iterations
//! let mut backoff = Backoff::new(RetryConfig::delivery(
//!     Duration::from_millis(100),
//!     Duration::from_millis(300),
//! ));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(200));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(300));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(300));
//! backoff.reset();
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! ```

use std::time::Duration;
use tokio::time::sleep;
use tracing::{warn, info};
use std::future::Future;

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::daemon()`] - Infinite retry for runtime reconnection
/// - [`RetryConfig::delivery()`] - Pauses between failed delivery iterations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    /// Use this during startup to detect configuration errors quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Infinite retry for long-running daemon (never give up!).
    /// Retries forever with exponential backoff capped at 5 minutes.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None, // Infinite
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // Cap at 5 minutes
            factor: 2.0,
        }
    }

    /// Backoff for the delivery loop: infinite, doubling from `initial` up to `max`.
    /// Entries stay pending in the buffer while the loop waits, so nothing is lost
    /// by waiting longer.
    #[must_use]
    pub fn delivery(initial: Duration, max: Duration) -> Self {
        Self {
            max_retries: None,
            initial_delay: initial,
            max_delay: max.max(initial),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Bounded exponential backoff state.
///
/// Each call to [`next_delay`](Backoff::next_delay) returns the current delay
/// and grows the next one by `factor`, capped at `max_delay`.
/// [`reset`](Backoff::reset) goes back to `initial_delay` after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
    attempts: usize,
}

impl Backoff {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current, attempts: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts += 1;
        self.current = self.current.mul_f64(self.config.factor).min(self.config.max_delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }

    /// Consecutive delays handed out since the last reset.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config.clone());

    loop {
        match operation().await {
            Ok(val) => {
                if backoff.attempts() > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, backoff.attempts());
                }
                return Ok(val);
            }
            Err(err) => {
                let attempts = backoff.attempts() + 1;

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                let delay = backoff.next_delay();
                match config.max_retries {
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}
