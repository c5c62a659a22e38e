//! Enrollment manager: subscriber creation, opt-out, pause/resume and batch
//! auto-enrollment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use drip_core::error::{EngineError, EngineResult};
use drip_core::event_bus::{make_event, EngineEventType, EventSink};
use drip_core::types::{
    Campaign, CampaignStatus, Client, EnrollmentSource, Subscriber, SubscriberStatus,
};
use drip_segmentation::matcher;

use crate::directory::ClientDirectory;
use crate::sequencer::{SequenceStep, Sequencer};
use crate::store::{CampaignStore, SubscriberInsert};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrollOutcome {
    Enrolled {
        subscriber: Subscriber,
        first_step: SequenceStep,
    },
    /// The client already holds an active or paused subscription.
    Conflict { existing_subscriber_id: Uuid },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BatchEnrollment {
    pub enrolled: usize,
    pub skipped: usize,
}

pub struct EnrollmentManager {
    store: Arc<dyn CampaignStore>,
    directory: Arc<dyn ClientDirectory>,
    sequencer: Arc<Sequencer>,
    event_sink: Arc<dyn EventSink>,
}

impl EnrollmentManager {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        directory: Arc<dyn ClientDirectory>,
        sequencer: Arc<Sequencer>,
    ) -> Self {
        Self {
            store,
            directory,
            sequencer,
            event_sink: drip_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Enroll one client. A concurrent duplicate loses with
    /// [`EnrollOutcome::Conflict`] rather than an error.
    pub async fn enroll(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        client_id: Uuid,
        source: EnrollmentSource,
    ) -> EngineResult<EnrollOutcome> {
        require_id("tenant_id", tenant_id)?;
        require_id("campaign_id", campaign_id)?;
        require_id("client_id", client_id)?;

        let campaign = self.active_campaign(tenant_id, campaign_id).await?;
        let client = self
            .directory
            .get_client(tenant_id, client_id)
            .await?
            .ok_or_else(|| EngineError::not_found("client", client_id))?;

        self.enroll_resolved(&campaign, &client, source, Utc::now())
            .await
    }

    async fn enroll_resolved(
        &self,
        campaign: &Campaign,
        client: &Client,
        source: EnrollmentSource,
        now: DateTime<Utc>,
    ) -> EngineResult<EnrollOutcome> {
        let candidate = Subscriber::new(campaign.tenant_id, campaign.id, client.id, source, now);

        let subscriber = match self.store.insert_subscriber(candidate).await? {
            SubscriberInsert::Inserted(s) => s,
            SubscriberInsert::Duplicate { existing_id } => {
                debug!(
                    campaign_id = %campaign.id,
                    client_id = %client.id,
                    existing_subscriber_id = %existing_id,
                    "Client already enrolled"
                );
                metrics::counter!("enrollment.conflicts").increment(1);
                return Ok(EnrollOutcome::Conflict {
                    existing_subscriber_id: existing_id,
                });
            }
        };

        info!(
            subscriber_id = %subscriber.id,
            campaign_id = %campaign.id,
            client_id = %client.id,
            source = source.as_str(),
            "Client enrolled"
        );
        metrics::counter!("enrollment.created", "source" => source.as_str()).increment(1);
        self.event_sink.emit(
            make_event(
                EngineEventType::SubscriberEnrolled,
                subscriber.tenant_id,
                Some(subscriber.campaign_id),
                Some(subscriber.id),
            )
            .with_detail(source.as_str()),
        );

        let first_step = self
            .sequencer
            .schedule_next(&subscriber, campaign, subscriber.enrolled_at, now)
            .await?;
        let subscriber = match &first_step {
            SequenceStep::Completed { subscriber } => subscriber.clone(),
            _ => subscriber,
        };

        Ok(EnrollOutcome::Enrolled {
            subscriber,
            first_step,
        })
    }

    /// Opt a subscriber out of its campaign and cancel everything still
    /// pending. Repeating the call on an unsubscribed subscriber only sweeps
    /// the queue again.
    pub async fn unenroll(&self, tenant_id: Uuid, subscriber_id: Uuid) -> EngineResult<Subscriber> {
        let subscriber = self.subscriber(tenant_id, subscriber_id).await?;
        if subscriber.status == SubscriberStatus::Unsubscribed {
            let cancelled = self.store.cancel_pending_items(subscriber_id, Utc::now()).await?;
            if cancelled > 0 {
                warn!(subscriber_id = %subscriber_id, cancelled_items = cancelled, "Cancelled items left behind by an earlier unenroll");
                metrics::counter!("queue.items_cancelled").increment(cancelled as u64);
            }
            return Ok(subscriber);
        }

        let now = Utc::now();
        let subscriber = self
            .store
            .transition_subscriber(subscriber_id, SubscriberStatus::Unsubscribed, now)
            .await?;
        let cancelled = self.store.cancel_pending_items(subscriber_id, now).await?;

        info!(
            subscriber_id = %subscriber_id,
            campaign_id = %subscriber.campaign_id,
            cancelled_items = cancelled,
            "Subscriber unenrolled"
        );
        metrics::counter!("enrollment.unsubscribed").increment(1);
        metrics::counter!("queue.items_cancelled").increment(cancelled as u64);
        self.event_sink.emit(
            make_event(
                EngineEventType::SubscriberUnsubscribed,
                subscriber.tenant_id,
                Some(subscriber.campaign_id),
                Some(subscriber.id),
            )
            .with_detail(format!("cancelled {cancelled} pending items")),
        );
        Ok(subscriber)
    }

    pub async fn pause(&self, tenant_id: Uuid, subscriber_id: Uuid) -> EngineResult<Subscriber> {
        self.subscriber(tenant_id, subscriber_id).await?;
        let subscriber = self
            .store
            .transition_subscriber(subscriber_id, SubscriberStatus::Paused, Utc::now())
            .await?;
        info!(subscriber_id = %subscriber_id, "Subscriber paused");
        self.event_sink.emit(make_event(
            EngineEventType::SubscriberPaused,
            subscriber.tenant_id,
            Some(subscriber.campaign_id),
            Some(subscriber.id),
        ));
        Ok(subscriber)
    }

    pub async fn resume(&self, tenant_id: Uuid, subscriber_id: Uuid) -> EngineResult<Subscriber> {
        self.subscriber(tenant_id, subscriber_id).await?;
        let subscriber = self
            .store
            .transition_subscriber(subscriber_id, SubscriberStatus::Active, Utc::now())
            .await?;
        info!(subscriber_id = %subscriber_id, "Subscriber resumed");
        self.event_sink.emit(make_event(
            EngineEventType::SubscriberResumed,
            subscriber.tenant_id,
            Some(subscriber.campaign_id),
            Some(subscriber.id),
        ));
        Ok(subscriber)
    }

    /// Active campaigns the client qualifies for and is not already in.
    pub async fn find_matching_campaigns(
        &self,
        tenant_id: Uuid,
        client_id: Uuid,
    ) -> EngineResult<Vec<Campaign>> {
        let client = self
            .directory
            .get_client(tenant_id, client_id)
            .await?
            .ok_or_else(|| EngineError::not_found("client", client_id))?;
        let campaigns = self.store.list_campaigns(tenant_id).await?;
        let open = self
            .store
            .open_campaigns_for_client(tenant_id, client_id)
            .await?;

        Ok(matcher::matching_campaigns(&client, &campaigns)
            .into_iter()
            .filter(|c| !open.contains(&c.id))
            .cloned()
            .collect())
    }

    /// Enroll every eligible client from `client_ids`, or from the whole
    /// tenant when `None`. Per-client failures are logged and skipped.
    pub async fn enroll_matching(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        client_ids: Option<Vec<Uuid>>,
    ) -> EngineResult<BatchEnrollment> {
        let campaign = self.active_campaign(tenant_id, campaign_id).await?;
        let mut result = BatchEnrollment::default();

        let clients = match client_ids {
            None => self.directory.list_clients(tenant_id).await?,
            Some(ids) => {
                let mut found = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.directory.get_client(tenant_id, id).await {
                        Ok(Some(client)) => found.push(client),
                        Ok(None) => {
                            debug!(client_id = %id, "Batch enrollment: unknown client");
                            result.skipped += 1;
                        }
                        Err(e) => {
                            warn!(client_id = %id, error = %e, "Batch enrollment: client lookup failed");
                            result.skipped += 1;
                        }
                    }
                }
                found
            }
        };

        for client in &clients {
            if !matcher::eligible(client, &campaign) {
                debug!(
                    client_id = %client.id,
                    campaign_id = %campaign_id,
                    failed = ?matcher::failed_dimensions(client, &campaign.targeting),
                    "Client outside campaign targeting"
                );
                result.skipped += 1;
                continue;
            }
            match self
                .enroll_resolved(&campaign, client, EnrollmentSource::Auto, Utc::now())
                .await
            {
                Ok(EnrollOutcome::Enrolled { .. }) => result.enrolled += 1,
                Ok(EnrollOutcome::Conflict { .. }) => result.skipped += 1,
                Err(e) => {
                    warn!(client_id = %client.id, campaign_id = %campaign_id, error = %e, "Batch enrollment failed for client");
                    result.skipped += 1;
                }
            }
        }

        info!(
            campaign_id = %campaign_id,
            enrolled = result.enrolled,
            skipped = result.skipped,
            "Batch enrollment finished"
        );
        Ok(result)
    }

    async fn active_campaign(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Campaign> {
        let campaign = self
            .store
            .get_campaign(tenant_id, campaign_id)
            .await?
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))?;
        if campaign.status != CampaignStatus::Active {
            return Err(EngineError::Validation(format!(
                "campaign {campaign_id} is not active"
            )));
        }
        Ok(campaign)
    }

    async fn subscriber(&self, tenant_id: Uuid, subscriber_id: Uuid) -> EngineResult<Subscriber> {
        self.store
            .get_subscriber(subscriber_id)
            .await?
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or_else(|| EngineError::not_found("subscriber", subscriber_id))
    }
}

fn require_id(field: &str, id: Uuid) -> EngineResult<()> {
    if id.is_nil() {
        return Err(EngineError::Validation(format!("{field} must not be nil")));
    }
    Ok(())
}
