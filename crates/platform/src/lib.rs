//! Request guards for the public and operator surfaces: per-token rate
//! limiting and queue-trigger authentication.

#![warn(clippy::unwrap_used)]

pub mod auth;
pub mod rate_limit;

pub use auth::TriggerAuth;
pub use rate_limit::{CounterStore, EndpointClass, LocalCounterStore, RateLimitResult, RateLimiter, WindowCount};
