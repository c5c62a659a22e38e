//! Email delivery side of the engine: mail transports, the send-queue
//! processor and engagement tracking.

#![warn(clippy::unwrap_used)]

pub mod email;
pub mod engagement;
pub mod processor;

pub use email::{DryRunTransport, MailTransport, OutboundEmail, RecordingTransport, SendGridTransport};
pub use engagement::{EngagementInput, EngagementTracker, SendGridEvent, WebhookSummary};
pub use processor::{ItemOutcome, ProcessSummary, ProcessorSettings, QueueProcessor};
