// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams backend for the durable buffer.
//!
//! Every event is one stream entry with a single field:
//!
//! ```text
//! XADD events * payload '{"user_id":42,"timestamp":"2024-05-01T12:00:00Z","metadata":{...}}'
//! ```
//!
//! Consumer-group primitives map directly onto stream commands:
//!
//! | Operation       | Command                                                        |
//! |-----------------|----------------------------------------------------------------|
//! | `ensure_group`  | `XGROUP CREATE <key> <group> 0 MKSTREAM` (BUSYGROUP tolerated) |
//! | `claim_pending` | `XREADGROUP GROUP <group> <consumer> COUNT n STREAMS <key> 0`  |
//! | `claim_new`     | `XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS <key> >` |
//! | `ack`           | `MULTI; XACK ...; XDEL ...; EXEC`                               |
//! | `pending_count` | `XPENDING <key> <group>`                                       |
//!
//! When a capacity is configured, appends go through a small Lua script that
//! checks `XLEN` and appends in one atomic step, so concurrent acceptors can't
//! overshoot the limit.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, RedisError, Script};
use tracing::{debug, info};

use super::traits::{BufferError, DurableBuffer};
use crate::event::{EntryId, Envelope};
use crate::resilience::retry::{retry, RetryConfig};

/// Stream entry field holding the serialized event.
pub const PAYLOAD_FIELD: &str = "payload";

const BOUNDED_APPEND_SCRIPT: &str = r#"
local len = redis.call('XLEN', KEYS[1])
if len >= tonumber(ARGV[1]) then
    return false
end
return redis.call('XADD', KEYS[1], '*', ARGV[2], ARGV[3])
"#;

/// Extra time allowed for a blocking claim to come back beyond its BLOCK window.
const BLOCK_GRACE: Duration = Duration::from_secs(2);

/// Raw `XREADGROUP` reply: `[[stream, [[id, [field, value, ...] | nil], ...]]]`,
/// or nil when a blocking read times out. Field maps are nil for pending
/// entries whose data was deleted from the stream.
type ReadGroupReply = Option<Vec<(String, Vec<(String, Option<Vec<(String, Vec<u8>)>>)>)>>;

pub struct RedisStreamBuffer {
    connection: ConnectionManager,
    /// Blocking reads park a multiplexed connection, so they get their own
    reader: ConnectionManager,
    stream_key: String,
    capacity: Option<u64>,
    op_timeout: Duration,
    bounded_append: Script,
}

impl RedisStreamBuffer {
    /// Connect with startup retry (fails fast if the URL is wrong).
    pub async fn connect(
        connection_string: &str,
        stream_key: impl Into<String>,
    ) -> Result<Self, BufferError> {
        let client = Client::open(connection_string)
            .map_err(|e| BufferError::Backend(e.to_string()))?;

        let connection = Self::open(&client).await?;
        let reader = Self::open(&client).await?;

        let stream_key = stream_key.into();
        info!(stream = %stream_key, "Connected to Redis stream buffer");

        let mut buffer = Self::from_connection(connection, stream_key);
        buffer.reader = reader;
        Ok(buffer)
    }

    async fn open(client: &Client) -> Result<ConnectionManager, BufferError> {
        retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: RedisError| BufferError::Unavailable(e.to_string()))
    }

    /// Use one connection for everything. Blocking claims will then delay
    /// appends issued on the same connection.
    pub fn from_connection(connection: ConnectionManager, stream_key: impl Into<String>) -> Self {
        Self {
            reader: connection.clone(),
            connection,
            stream_key: stream_key.into(),
            capacity: None,
            op_timeout: Duration::from_secs(1),
            bounded_append: Script::new(BOUNDED_APPEND_SCRIPT),
        }
    }

    /// Reject appends once the stream holds `capacity` entries.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Option<u64>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Upper bound on a single non-blocking command round trip.
    #[must_use]
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Run a command future under a deadline, mapping errors into the buffer taxonomy.
    async fn bounded<T, F>(&self, limit: Duration, fut: F) -> Result<T, BufferError>
    where
        F: std::future::Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(BufferError::Unavailable(format!(
                "redis command timed out after {:?}",
                limit
            ))),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Option<Duration>,
        start: &str,
    ) -> Result<Vec<Envelope>, BufferError> {
        let mut conn = if block.is_some() {
            self.reader.clone()
        } else {
            self.connection.clone()
        };
        let mut command = cmd("XREADGROUP");
        command
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max_count);
        if let Some(block) = block {
            command.arg("BLOCK").arg(block.as_millis() as u64);
        }
        command.arg("STREAMS").arg(&self.stream_key).arg(start);

        let limit = block.map_or(self.op_timeout, |b| b + BLOCK_GRACE);
        let reply: ReadGroupReply = self
            .bounded(limit, async move { command.query_async(&mut conn).await })
            .await?;

        let mut envelopes = Vec::new();
        for (_stream, entries) in reply.unwrap_or_default() {
            for (raw_id, fields) in entries {
                let id: EntryId = raw_id
                    .parse()
                    .map_err(|e| BufferError::Backend(format!("{}", e)))?;
                // Missing field or deleted entry: hand over an empty payload and
                // let the worker treat it as malformed.
                let payload = fields
                    .unwrap_or_default()
                    .into_iter()
                    .find(|(field, _)| field == PAYLOAD_FIELD)
                    .map(|(_, value)| value)
                    .unwrap_or_default();
                envelopes.push(Envelope::new(id, payload));
            }
        }
        Ok(envelopes)
    }
}

/// Map a Redis error onto the buffer taxonomy.
fn classify(err: RedisError) -> BufferError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        BufferError::Unavailable(err.to_string())
    } else {
        BufferError::Backend(err.to_string())
    }
}

#[async_trait]
impl DurableBuffer for RedisStreamBuffer {
    async fn ensure_group(&self, group: &str) -> Result<(), BufferError> {
        let mut conn = self.connection.clone();
        let result: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.stream_key, group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                info!(stream = %self.stream_key, group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn append(&self, payload: &[u8]) -> Result<EntryId, BufferError> {
        let mut conn = self.connection.clone();
        let raw_id: String = match self.capacity {
            None => {
                let mut command = cmd("XADD");
                command.arg(&self.stream_key).arg("*").arg(PAYLOAD_FIELD).arg(payload);
                self.bounded(self.op_timeout, async move { command.query_async(&mut conn).await })
                    .await?
            }
            Some(capacity) => {
                let mut invocation = self.bounded_append.key(&self.stream_key);
                invocation.arg(capacity).arg(PAYLOAD_FIELD).arg(payload);
                let appended: Option<String> = self
                    .bounded(self.op_timeout, async move { invocation.invoke_async(&mut conn).await })
                    .await?;
                match appended {
                    Some(id) => id,
                    None => {
                        return Err(BufferError::Full { len: capacity, capacity });
                    }
                }
            }
        };
        raw_id.parse().map_err(|e| BufferError::Backend(format!("{}", e)))
    }

    async fn claim_pending(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<Envelope>, BufferError> {
        self.read_group(group, consumer, max_count, None, "0").await
    }

    async fn claim_new(
        &self,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<Envelope>, BufferError> {
        // BLOCK 0 means "forever" to Redis, so a zero block omits the option entirely
        let block = (!block.is_zero()).then_some(block);
        self.read_group(group, consumer, max_count, block, ">").await
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize, BufferError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let raw_ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut conn = self.connection.clone();

        let mut pipeline = pipe();
        pipeline
            .atomic()
            .cmd("XACK")
            .arg(&self.stream_key)
            .arg(group)
            .arg(&raw_ids)
            .cmd("XDEL")
            .arg(&self.stream_key)
            .arg(&raw_ids);

        let (acked, deleted): (usize, usize) = self
            .bounded(self.op_timeout, async move { pipeline.query_async(&mut conn).await })
            .await?;
        debug!(acked, deleted, "Acknowledged stream entries");
        Ok(acked)
    }

    async fn pending_count(&self, group: &str) -> Result<u64, BufferError> {
        let mut conn = self.connection.clone();
        let mut command = cmd("XPENDING");
        command.arg(&self.stream_key).arg(group);

        // [count, smallest id, greatest id, [[consumer, count], ...]]
        let (count, _, _, _): (u64, Option<String>, Option<String>, Option<Vec<(String, String)>>) = self
            .bounded(self.op_timeout, async move { command.query_async(&mut conn).await })
            .await?;
        Ok(count)
    }
}
