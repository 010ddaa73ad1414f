// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Postgres sink for delivered events.
//!
//! Schema:
//! ```sql
//! CREATE TABLE events (
//!   id        BIGSERIAL PRIMARY KEY,
//!   user_id   BIGINT      NOT NULL,
//!   timestamp TIMESTAMPTZ NOT NULL,
//!   metadata  JSONB       NOT NULL
//! )
//! ```
//!
//! A batch is written as multi-row parameterized `INSERT`s inside a single
//! transaction. Metadata is bound as a JSONB parameter, never spliced into
//! the statement text.
//!
//! ## Error classification
//!
//! SQLSTATE classes `22` (data exception) and `23` (integrity constraint
//! violation) are permanent: the same rows will fail the same way forever.
//! Everything else (I/O, pool timeouts, server restarts, unknown codes) is
//! treated as transient and retried.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use super::traits::{EventSink, SinkError};
use crate::event::Event;
use crate::resilience::retry::{retry, RetryConfig};

/// Postgres allows 65535 bind parameters per statement; each row uses 3.
const MAX_ROWS_PER_STATEMENT: usize = 5_000;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    metadata JSONB NOT NULL
)
"#;

pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    /// Connect with startup retry and make sure the events table exists.
    pub async fn connect(connection_string: &str) -> Result<Self, SinkError> {
        let pool = retry("postgres_connect", &RetryConfig::startup(), || async {
            PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(5))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
        })
        .await
        .map_err(classify)?;

        let sink = Self::from_pool(pool);
        sink.init_schema().await?;
        info!("Connected to Postgres sink");
        Ok(sink)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub async fn init_schema(&self) -> Result<(), SinkError> {
        retry("postgres_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(CREATE_TABLE).execute(&self.pool).await
        })
        .await
        .map_err(classify)?;
        Ok(())
    }
}

/// Map a sqlx error onto the sink taxonomy.
pub(crate) fn classify(err: sqlx::Error) -> SinkError {
    let permanent = match &err {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("22") || code.starts_with("23")),
        sqlx::Error::Encode(_) => true,
        _ => false,
    };
    if permanent {
        SinkError::Permanent(err.to_string())
    } else {
        SinkError::Transient(err.to_string())
    }
}

#[async_trait]
impl EventSink for PostgresSink {
    async fn write(&self, events: &[Event]) -> Result<usize, SinkError> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(classify)?;

        for chunk in events.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO events (user_id, timestamp, metadata) ");
            builder.push_values(chunk, |mut row, event| {
                row.push_bind(event.user_id)
                    .push_bind(event.timestamp)
                    .push_bind(Json(event.metadata.clone()));
            });
            // Dropping `tx` on error rolls the whole batch back
            builder.build().execute(&mut *tx).await.map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        debug!(rows = events.len(), "Committed event batch");
        Ok(events.len())
    }
}
