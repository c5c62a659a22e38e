//! Shared domain model, configuration, errors and event plumbing for the
//! campaign email automation engine.

#![warn(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod event_bus;
pub mod templates;
pub mod types;

pub use config::AppConfig;
pub use error::{EngineError, EngineResult};
