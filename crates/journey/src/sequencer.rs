//! Sequencer: picks a subscriber's next email step and queues it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use drip_core::error::EngineResult;
use drip_core::event_bus::{make_event, EngineEventType, EventSink};
use drip_core::types::{
    Campaign, EmailTemplate, QueueItem, QueueStatus, Subscriber, SubscriberStatus,
};

use crate::store::{CampaignStore, QueueInsert};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SequenceStep {
    /// A new queue item was created for the next step.
    Scheduled { item: QueueItem },
    /// The next step was already queued; nothing was written.
    AlreadyQueued { queue_item_id: Uuid },
    /// No step remains (or the email cap is reached); the subscriber is done.
    Completed { subscriber: Subscriber },
    /// The subscriber left the sequence concurrently; nothing was written.
    Halted { status: SubscriberStatus },
}

/// Lowest-ordered template strictly after `position`.
pub fn next_template(templates: &[EmailTemplate], position: u32) -> Option<&EmailTemplate> {
    templates
        .iter()
        .filter(|t| t.sequence_order > position)
        .min_by_key(|t| t.sequence_order)
}

/// Send time for a step: the later of the anchor and `now`, plus the delay.
pub fn scheduled_time(anchor: DateTime<Utc>, now: DateTime<Utc>, delay_days: u32) -> DateTime<Utc> {
    anchor.max(now) + Duration::days(i64::from(delay_days))
}

pub struct Sequencer {
    store: Arc<dyn CampaignStore>,
    event_sink: Arc<dyn EventSink>,
}

impl Sequencer {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self {
            store,
            event_sink: drip_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Queue the step after the subscriber's current position.
    ///
    /// `anchor` is the previous step's send time, or the enrollment time for
    /// the first step. Calling twice for the same position yields
    /// `AlreadyQueued` on the second call.
    pub async fn schedule_next(
        &self,
        subscriber: &Subscriber,
        campaign: &Campaign,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<SequenceStep> {
        let templates = self
            .store
            .list_templates(subscriber.tenant_id, subscriber.campaign_id)
            .await?;

        let capped = subscriber.emails_sent >= campaign.max_emails_per_campaign;
        let next = next_template(&templates, subscriber.current_sequence_position);

        let template = match next {
            Some(t) if !capped => t,
            _ => return self.complete(subscriber, capped, now).await,
        };

        let item = QueueItem {
            id: Uuid::new_v4(),
            tenant_id: subscriber.tenant_id,
            campaign_id: subscriber.campaign_id,
            subscriber_id: subscriber.id,
            template_id: template.id,
            sequence_order: template.sequence_order,
            scheduled_for: scheduled_time(anchor, now, template.send_delay_days),
            status: QueueStatus::Pending,
            attempt_count: 0,
            last_error: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_queue_item(item).await? {
            QueueInsert::Inserted(item) => {
                debug!(
                    subscriber_id = %subscriber.id,
                    step = item.sequence_order,
                    scheduled_for = %item.scheduled_for,
                    "Step queued"
                );
                metrics::counter!("queue.items_enqueued").increment(1);
                self.event_sink.emit(
                    make_event(
                        EngineEventType::EmailQueued,
                        subscriber.tenant_id,
                        Some(subscriber.campaign_id),
                        Some(subscriber.id),
                    )
                    .with_queue_item(item.id),
                );
                Ok(SequenceStep::Scheduled { item })
            }
            QueueInsert::Duplicate { existing_id } => {
                debug!(subscriber_id = %subscriber.id, queue_item_id = %existing_id, "Step already queued");
                Ok(SequenceStep::AlreadyQueued {
                    queue_item_id: existing_id,
                })
            }
            QueueInsert::SubscriberClosed { status } => {
                debug!(subscriber_id = %subscriber.id, status = ?status, "Subscriber closed, step not queued");
                metrics::counter!("queue.enqueue_skipped").increment(1);
                Ok(SequenceStep::Halted { status })
            }
        }
    }

    async fn complete(
        &self,
        subscriber: &Subscriber,
        capped: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<SequenceStep> {
        if !subscriber.status.is_open() {
            return Ok(SequenceStep::Completed {
                subscriber: subscriber.clone(),
            });
        }

        let subscriber = self
            .store
            .transition_subscriber(subscriber.id, SubscriberStatus::Completed, now)
            .await?;
        info!(
            subscriber_id = %subscriber.id,
            campaign_id = %subscriber.campaign_id,
            emails_sent = subscriber.emails_sent,
            capped,
            "Subscriber completed sequence"
        );
        metrics::counter!("enrollment.completed").increment(1);
        self.event_sink.emit(make_event(
            EngineEventType::SubscriberCompleted,
            subscriber.tenant_id,
            Some(subscriber.campaign_id),
            Some(subscriber.id),
        ));
        Ok(SequenceStep::Completed { subscriber })
    }
}
