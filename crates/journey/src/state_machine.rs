use drip_core::error::{EngineError, EngineResult};
use drip_core::types::{CampaignStatus, QueueStatus, SubscriberStatus};
use std::fmt::Debug;

/// Describes a single valid state transition.
#[derive(Debug, Clone, Copy)]
pub struct StateTransition<S> {
    pub from: S,
    pub to: S,
    pub trigger: &'static str,
}

/// Guards an entity lifecycle by enforcing a finite set of valid transitions.
#[derive(Debug)]
pub struct StateMachine<S: 'static> {
    pub entity: &'static str,
    pub transitions: &'static [StateTransition<S>],
}

impl<S: Copy + PartialEq + Debug> StateMachine<S> {
    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: S, to: S) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Returns the trigger name for a permitted transition, or a validation
    /// error.
    pub fn check(&self, from: S, to: S) -> EngineResult<&'static str> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .map(|t| t.trigger)
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "invalid {} state transition from {:?} to {:?}",
                    self.entity, from, to
                ))
            })
    }
}

pub static CAMPAIGN_LIFECYCLE: StateMachine<CampaignStatus> = StateMachine {
    entity: "campaign",
    transitions: &[
        // Draft ->
        StateTransition { from: CampaignStatus::Draft, to: CampaignStatus::Active, trigger: "activate" },
        StateTransition { from: CampaignStatus::Draft, to: CampaignStatus::Archived, trigger: "archive" },
        // Active ->
        StateTransition { from: CampaignStatus::Active, to: CampaignStatus::Paused, trigger: "pause" },
        StateTransition { from: CampaignStatus::Active, to: CampaignStatus::Archived, trigger: "archive" },
        // Paused ->
        StateTransition { from: CampaignStatus::Paused, to: CampaignStatus::Active, trigger: "resume" },
        StateTransition { from: CampaignStatus::Paused, to: CampaignStatus::Archived, trigger: "archive" },
    ],
};

pub static SUBSCRIBER_LIFECYCLE: StateMachine<SubscriberStatus> = StateMachine {
    entity: "subscriber",
    transitions: &[
        // Active ->
        StateTransition { from: SubscriberStatus::Active, to: SubscriberStatus::Paused, trigger: "pause" },
        StateTransition { from: SubscriberStatus::Active, to: SubscriberStatus::Completed, trigger: "sequence_complete" },
        StateTransition { from: SubscriberStatus::Active, to: SubscriberStatus::Unsubscribed, trigger: "unenroll" },
        // Paused ->
        StateTransition { from: SubscriberStatus::Paused, to: SubscriberStatus::Active, trigger: "resume" },
        StateTransition { from: SubscriberStatus::Paused, to: SubscriberStatus::Completed, trigger: "campaign_archived" },
        StateTransition { from: SubscriberStatus::Paused, to: SubscriberStatus::Unsubscribed, trigger: "unenroll" },
        // Completed ->
        StateTransition { from: SubscriberStatus::Completed, to: SubscriberStatus::Unsubscribed, trigger: "opt_out" },
    ],
};

pub static QUEUE_LIFECYCLE: StateMachine<QueueStatus> = StateMachine {
    entity: "queue item",
    transitions: &[
        // Pending ->
        StateTransition { from: QueueStatus::Pending, to: QueueStatus::Processing, trigger: "claim" },
        StateTransition { from: QueueStatus::Pending, to: QueueStatus::Cancelled, trigger: "unenroll" },
        // Processing ->
        StateTransition { from: QueueStatus::Processing, to: QueueStatus::Pending, trigger: "retry" },
        StateTransition { from: QueueStatus::Processing, to: QueueStatus::Sent, trigger: "delivered" },
        StateTransition { from: QueueStatus::Processing, to: QueueStatus::Failed, trigger: "attempts_exhausted" },
        StateTransition { from: QueueStatus::Processing, to: QueueStatus::Cancelled, trigger: "subscriber_inactive" },
    ],
};
