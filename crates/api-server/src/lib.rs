#![warn(clippy::unwrap_used)]

pub mod campaign_rest;
pub mod error;
pub mod middleware;
pub mod portal_rest;
pub mod queue_rest;
pub mod rest;
pub mod server;
pub mod swagger;

pub use rest::{AppState, EngineParts};
pub use server::{router, ApiServer};
pub use swagger::ApiDoc;
