//! Subscriber journeys for email campaigns: storage contract, enrollment,
//! sequencing and campaign lifecycle management.

#![warn(clippy::unwrap_used)]

pub mod catalog;
pub mod directory;
pub mod enrollment;
pub mod sequencer;
pub mod state_machine;
pub mod store;

pub use catalog::{CampaignCatalog, NewCampaign, NewTemplate};
pub use directory::{ClientDirectory, MemoryClientDirectory};
pub use enrollment::{BatchEnrollment, EnrollOutcome, EnrollmentManager};
pub use sequencer::{SequenceStep, Sequencer};
pub use store::{CampaignStore, EngagementWrite, MemoryStore};
