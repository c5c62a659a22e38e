//! Caching and shared-counter backends: Redis rate-limit counters and an L1
//! client-record cache.

#![warn(clippy::unwrap_used)]

pub mod client;
pub mod local;

pub use client::RedisCounterStore;
pub use local::CachedClientDirectory;
