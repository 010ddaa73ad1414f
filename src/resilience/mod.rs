//! Retry and backoff helpers shared by backend connections and the delivery loop.

pub mod retry;
