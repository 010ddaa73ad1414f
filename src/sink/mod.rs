// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Permanent storage for delivered events.
//!
//! - [`postgres::PostgresSink`]: transactional bulk inserts into Postgres
//! - [`memory::InMemorySink`]: records rows in memory, with scriptable failures

pub mod traits;
pub mod memory;
pub mod postgres;
