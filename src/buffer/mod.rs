// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable buffer backends.
//!
//! - [`redis::RedisStreamBuffer`]: Redis Streams with a consumer group (production)
//! - [`memory::InMemoryBuffer`]: in-process log with the same semantics (tests, local runs)

pub mod traits;
pub mod memory;
pub mod redis;
