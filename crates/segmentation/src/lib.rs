//! Campaign targeting: evaluates whether clients qualify for a campaign's
//! life-stage, client-type and prior-service criteria.

#![warn(clippy::unwrap_used)]

pub mod builder;
pub mod matcher;
pub mod predicates;

pub use builder::TargetingBuilder;
pub use matcher::{eligible, matching_campaigns};
