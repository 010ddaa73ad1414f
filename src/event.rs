// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event and envelope types.
//!
//! An [`Event`] is what clients submit. Once accepted it is serialized to JSON
//! and stored in the durable buffer inside an [`Envelope`], addressed by an
//! [`EntryId`].
//!
//! # Example
//!
//! ```
//! use ingest_relay::Event;
//! use serde_json::json;
//!
//! let body = br#"{"user_id": 42, "timestamp": "2024-05-01T12:00:00Z", "metadata": {"page": "/home"}}"#;
//! let event = Event::decode(body).unwrap();
//! assert_eq!(event.user_id, 42);
//! assert_eq!(event.metadata["page"], json!("/home"));
//!
//! let bytes = event.encode().unwrap();
//! assert_eq!(Event::decode(&bytes).unwrap(), event);
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("empty event payload")]
    Empty,
}

/// A single client event.
///
/// The timestamp accepts any RFC 3339 offset (`Z`, `+02:00`, ...) and is
/// normalized to UTC. Metadata must be a JSON object; it is stored as an opaque
/// document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub user_id: i64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl Event {
    pub fn new(user_id: i64, timestamp: DateTime<Utc>, metadata: Map<String, Value>) -> Self {
        Self { user_id, timestamp, metadata }
    }

    /// Serialize to the buffer payload format.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a buffer payload (or a request body) back into an event.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        if bytes.is_empty() {
            return Err(EventError::Empty);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Position of an entry in the durable buffer.
///
/// Mirrors the Redis stream id layout `<millis>-<seq>`. Ids are totally
/// ordered: later appends always compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { millis: 0, seq: 0 };

    #[must_use]
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The smallest id strictly greater than `self` for a clock reading of `now_millis`.
    #[must_use]
    pub fn successor(&self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid entry id: {0:?}")]
pub struct ParseEntryIdError(String);

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseEntryIdError(s.to_string());
        let (millis, seq) = s.split_once('-').ok_or_else(err)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| err())?,
            seq: seq.parse().map_err(|_| err())?,
        })
    }
}

impl Serialize for EntryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A buffered entry: id plus the raw serialized event.
///
/// The payload is kept as bytes; decoding happens in the delivery worker so a
/// malformed entry can be identified and dropped on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: EntryId,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(id: EntryId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn decode(&self) -> Result<Event, EventError> {
        Event::decode(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_event() -> Event {
        let metadata = json!({"page": "/checkout", "items": [1, 2, 3]});
        Event::new(
            7,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            metadata.as_object().unwrap().clone(),
        )
    }

    #[test]
    fn test_encode_decode() {
        let event = sample_event();
        let bytes = event.encode().unwrap();
        assert_eq!(Event::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_decode_normalizes_offset_to_utc() {
        let body = br#"{"user_id": 1, "timestamp": "2024-05-01T14:00:00+02:00", "metadata": {}}"#;
        let event = Event::decode(body).unwrap();
        assert_eq!(event.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let body = br#"{"user_id": 1, "timestamp": "2024-05-01T12:00:00Z", "metadata": {}, "extra": true}"#;
        assert!(Event::decode(body).is_ok());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(Event::decode(b""), Err(EventError::Empty)));
        assert!(matches!(Event::decode(b"not json"), Err(EventError::Malformed(_))));
        // metadata must be an object
        let body = br#"{"user_id": 1, "timestamp": "2024-05-01T12:00:00Z", "metadata": [1]}"#;
        assert!(Event::decode(body).is_err());
        // timestamp without an offset is not an instant
        let body = br#"{"user_id": 1, "timestamp": "2024-05-01T12:00:00", "metadata": {}}"#;
        assert!(Event::decode(body).is_err());
        // user_id must be an integer
        let body = br#"{"user_id": "abc", "timestamp": "2024-05-01T12:00:00Z", "metadata": {}}"#;
        assert!(Event::decode(body).is_err());
    }

    #[test]
    fn test_entry_id_parse_and_display() {
        let id: EntryId = "1700000000000-3".parse().unwrap();
        assert_eq!(id, EntryId::new(1_700_000_000_000, 3));
        assert_eq!(id.to_string(), "1700000000000-3");

        assert!("".parse::<EntryId>().is_err());
        assert!("123".parse::<EntryId>().is_err());
        assert!("a-1".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_entry_id_ordering() {
        let a = EntryId::new(10, 5);
        let b = EntryId::new(11, 0);
        let c = EntryId::new(11, 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_successor_is_strictly_greater() {
        let id = EntryId::new(100, 4);
        // clock moved forward
        assert_eq!(id.successor(200), EntryId::new(200, 0));
        // same millisecond
        assert_eq!(id.successor(100), EntryId::new(100, 5));
        // clock went backwards
        assert_eq!(id.successor(50), EntryId::new(100, 5));
    }
}
