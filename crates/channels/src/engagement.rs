//! Delivery and engagement tracking.
//!
//! Events land on the [`EmailHistory`] row of the message they refer to.
//! Each field is written once; later duplicates are acknowledged but change
//! nothing.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use drip_core::error::{EngineError, EngineResult};
use drip_core::event_bus::{make_event, EngineEventType, EventSink};
use drip_core::types::{CampaignMetrics, EmailHistory, EngagementEvent};
use drip_journey::{CampaignStore, EngagementWrite, EnrollmentManager};

/// One engagement event as posted to the public endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EngagementInput {
    pub event: EngagementEvent,
    pub email_history_id: Uuid,
    /// Defaults to the time of receipt.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A SendGrid event webhook entry. Custom args sent with the message are
/// flattened into the event by SendGrid.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SendGridEvent {
    pub event: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    #[serde(default)]
    pub email_history_id: Option<String>,
}

impl SendGridEvent {
    /// Engagement event this webhook entry maps to, if any.
    pub fn engagement(&self) -> Option<EngagementEvent> {
        match self.event.as_str() {
            "delivered" => Some(EngagementEvent::Delivered),
            "open" => Some(EngagementEvent::Opened),
            "click" => Some(EngagementEvent::Clicked),
            "bounce" | "dropped" => Some(EngagementEvent::Bounced),
            "unsubscribe" | "group_unsubscribe" | "spamreport" => Some(EngagementEvent::Unsubscribed),
            _ => None,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.timestamp
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WebhookSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub errors: usize,
}

pub struct EngagementTracker {
    store: Arc<dyn CampaignStore>,
    enrollment: Arc<EnrollmentManager>,
    event_sink: Arc<dyn EventSink>,
}

impl EngagementTracker {
    pub fn new(store: Arc<dyn CampaignStore>, enrollment: Arc<EnrollmentManager>) -> Self {
        Self {
            store,
            enrollment,
            event_sink: drip_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Record one event. An `unsubscribed` event also unenrolls the
    /// subscriber from this campaign, including on redelivery, so a retry
    /// after a failed unenroll still takes effect.
    pub async fn ingest(
        &self,
        event: EngagementEvent,
        email_history_id: Uuid,
        at: DateTime<Utc>,
    ) -> EngineResult<EngagementWrite> {
        let write = self
            .store
            .record_engagement(email_history_id, event, at)
            .await?
            .ok_or_else(|| EngineError::not_found("email history", email_history_id))?;

        if !write.recorded {
            debug!(history_id = %email_history_id, event = event.as_str(), "Duplicate engagement ignored");
            metrics::counter!("engagement.duplicates", "event" => event.as_str()).increment(1);
            if event == EngagementEvent::Unsubscribed && write.history.unsubscribed {
                self.unenroll(&write.history).await?;
            }
            return Ok(write);
        }

        let history = &write.history;
        debug!(history_id = %history.id, event = event.as_str(), "Engagement recorded");
        metrics::counter!("engagement.recorded", "event" => event.as_str()).increment(1);
        self.event_sink.emit(
            make_event(
                EngineEventType::EngagementRecorded,
                history.tenant_id,
                Some(history.campaign_id),
                Some(history.subscriber_id),
            )
            .with_queue_item(history.queue_item_id)
            .with_detail(event.as_str()),
        );

        if event == EngagementEvent::Unsubscribed {
            info!(
                subscriber_id = %history.subscriber_id,
                campaign_id = %history.campaign_id,
                "Unsubscribe event received"
            );
            self.unenroll(history).await?;
        }
        Ok(write)
    }

    async fn unenroll(&self, history: &EmailHistory) -> EngineResult<()> {
        self.enrollment
            .unenroll(history.tenant_id, history.subscriber_id)
            .await?;
        Ok(())
    }

    /// Map a SendGrid webhook batch onto [`Self::ingest`]. Unknown event
    /// types and entries without a history id are ignored.
    pub async fn ingest_sendgrid(&self, events: &[SendGridEvent]) -> WebhookSummary {
        let mut summary = WebhookSummary::default();
        for ev in events {
            let Some(kind) = ev.engagement() else {
                summary.ignored += 1;
                continue;
            };
            let Some(history_id) = ev
                .email_history_id
                .as_deref()
                .and_then(|id| Uuid::parse_str(id).ok())
            else {
                debug!(event = %ev.event, sg_message_id = ?ev.sg_message_id, "Webhook event without email_history_id");
                summary.ignored += 1;
                continue;
            };
            match self.ingest(kind, history_id, ev.occurred_at()).await {
                Ok(write) if write.recorded => summary.accepted += 1,
                Ok(_) => summary.duplicates += 1,
                Err(e) => {
                    warn!(history_id = %history_id, event = %ev.event, error = %e, "Webhook event rejected");
                    summary.errors += 1;
                }
            }
        }
        summary
    }

    pub async fn compute_metrics(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<CampaignMetrics> {
        self.store
            .get_campaign(tenant_id, campaign_id)
            .await?
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))?;
        let history = self.store.campaign_history(tenant_id, campaign_id).await?;
        Ok(metrics_from_history(campaign_id, &history))
    }
}

/// Aggregate a campaign's history into counts and percentage rates.
pub fn metrics_from_history(campaign_id: Uuid, history: &[EmailHistory]) -> CampaignMetrics {
    let count = |f: fn(&EmailHistory) -> bool| history.iter().filter(|h| f(h)).count() as u64;

    let sent = history.len() as u64;
    let delivered = count(|h| h.delivered_at.is_some());
    let opens = count(|h| h.opened_at.is_some());
    let clicks = count(|h| h.clicked_at.is_some());
    let conversions = count(|h| h.converted_at.is_some());
    let bounces = count(|h| h.bounced);
    let unsubscribes = count(|h| h.unsubscribed);

    let rate = |n: u64| if sent == 0 { 0.0 } else { n as f64 / sent as f64 * 100.0 };

    CampaignMetrics {
        campaign_id,
        sent,
        delivered,
        opens,
        clicks,
        conversions,
        bounces,
        unsubscribes,
        delivery_rate: rate(delivered),
        open_rate: rate(opens),
        click_rate: rate(clicks),
        conversion_rate: rate(conversions),
        bounce_rate: rate(bounces),
        unsubscribe_rate: rate(unsubscribes),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use drip_core::types::{
        Campaign, CampaignStatus, Client, EnrollmentSource, EmailTemplate, QueueStatus,
        SubscriberStatus, TargetingCriteria,
    };
    use drip_journey::{EnrollOutcome, MemoryClientDirectory, MemoryStore, Sequencer};
    use std::collections::{BTreeSet, HashMap};

    fn history(campaign_id: Uuid) -> EmailHistory {
        EmailHistory {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            campaign_id,
            subscriber_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            queue_item_id: Uuid::new_v4(),
            to_email: "quinn@example.com".into(),
            subject: "Hello".into(),
            provider_message_id: None,
            sent_at: Utc::now(),
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            converted_at: None,
            bounced: false,
            unsubscribed: false,
        }
    }

    #[test]
    fn test_rates_zero_when_nothing_sent() {
        let m = metrics_from_history(Uuid::new_v4(), &[]);
        assert_eq!(m.sent, 0);
        assert_eq!(m.open_rate, 0.0);
        assert_eq!(m.click_rate, 0.0);
    }

    #[test]
    fn test_rates_are_percentages() {
        let campaign_id = Uuid::new_v4();
        let mut rows: Vec<EmailHistory> = (0..4).map(|_| history(campaign_id)).collect();
        for h in rows.iter_mut() {
            h.apply(EngagementEvent::Opened, Utc::now());
        }
        rows[0].apply(EngagementEvent::Clicked, Utc::now());

        let m = metrics_from_history(campaign_id, &rows);
        assert_eq!(m.opens, 4);
        assert_eq!(m.open_rate, 100.0);
        assert_eq!(m.click_rate, 25.0);
        assert_eq!(m.bounce_rate, 0.0);
    }

    #[test]
    fn test_sendgrid_event_mapping() {
        let ev = |name: &str| SendGridEvent {
            event: name.into(),
            email: None,
            timestamp: Some(1_700_000_000),
            sg_message_id: None,
            email_history_id: None,
        };
        assert_eq!(ev("open").engagement(), Some(EngagementEvent::Opened));
        assert_eq!(ev("dropped").engagement(), Some(EngagementEvent::Bounced));
        assert_eq!(ev("spamreport").engagement(), Some(EngagementEvent::Unsubscribed));
        assert_eq!(ev("processed").engagement(), None);
        assert_eq!(ev("open").occurred_at().timestamp(), 1_700_000_000);
    }

    async fn enrolled_history() -> (Arc<MemoryStore>, EngagementTracker, EmailHistory) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryClientDirectory::new());
        let manager = Arc::new(EnrollmentManager::new(
            store.clone(),
            directory.clone(),
            Arc::new(Sequencer::new(store.clone())),
        ));
        let tracker = EngagementTracker::new(store.clone(), manager.clone());

        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Renewals".into(),
            description: None,
            status: CampaignStatus::Active,
            targeting: TargetingCriteria::default(),
            max_emails_per_campaign: 3,
            created_at: now,
            updated_at: now,
        };
        store.insert_campaign(campaign.clone()).await.unwrap();
        store
            .insert_template(EmailTemplate {
                id: Uuid::new_v4(),
                tenant_id: campaign.tenant_id,
                campaign_id: campaign.id,
                name: "first".into(),
                sequence_order: 1,
                send_delay_days: 3,
                subject: "Renew".into(),
                body_html: "<p>Renew</p>".into(),
                body_text: None,
                created_at: now,
            })
            .await
            .unwrap();
        let client = Client {
            id: Uuid::new_v4(),
            tenant_id: campaign.tenant_id,
            name: "Quinn Ashby".into(),
            email: "quinn@example.com".into(),
            life_stage: None,
            client_type: None,
            prior_services: BTreeSet::new(),
            attributes: HashMap::new(),
        };
        directory.upsert(client.clone());
        let EnrollOutcome::Enrolled { subscriber, .. } = manager
            .enroll(campaign.tenant_id, campaign.id, client.id, EnrollmentSource::Portal)
            .await
            .unwrap()
        else {
            panic!("expected enrollment");
        };

        let mut h = history(campaign.id);
        h.tenant_id = campaign.tenant_id;
        h.subscriber_id = subscriber.id;
        h.client_id = client.id;
        store.insert_history(h.clone()).await.unwrap();
        (store, tracker, h)
    }

    #[tokio::test]
    async fn test_first_event_wins() {
        let (store, tracker, h) = enrolled_history().await;
        let first = Utc::now();

        let a = tracker.ingest(EngagementEvent::Opened, h.id, first).await.unwrap();
        let b = tracker
            .ingest(EngagementEvent::Opened, h.id, first + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(a.recorded);
        assert!(!b.recorded);
        let stored = store.get_history(h.id).await.unwrap().unwrap();
        assert_eq!(stored.opened_at, Some(first));
        assert!(stored.clicked_at.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_event_unenrolls() {
        let (store, tracker, h) = enrolled_history().await;

        tracker
            .ingest(EngagementEvent::Unsubscribed, h.id, Utc::now())
            .await
            .unwrap();
        let sub = store.get_subscriber(h.subscriber_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriberStatus::Unsubscribed);
        let metrics = tracker.compute_metrics(h.tenant_id, h.campaign_id).await.unwrap();
        assert_eq!(metrics.unsubscribes, 1);
        assert_eq!(metrics.unsubscribe_rate, 100.0);
    }

    #[tokio::test]
    async fn test_redelivered_unsubscribe_still_unenrolls() {
        let (store, tracker, h) = enrolled_history().await;
        let now = Utc::now();

        // The flag landed but the unenroll never ran.
        let first = store
            .record_engagement(h.id, EngagementEvent::Unsubscribed, now)
            .await
            .unwrap()
            .unwrap();
        assert!(first.recorded);
        let sub = store.get_subscriber(h.subscriber_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriberStatus::Active);

        let retry = tracker
            .ingest(EngagementEvent::Unsubscribed, h.id, now)
            .await
            .unwrap();
        assert!(!retry.recorded);
        let sub = store.get_subscriber(h.subscriber_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriberStatus::Unsubscribed);
        let items = store.list_queue_items(h.subscriber_id).await.unwrap();
        assert!(items.iter().all(|i| i.status == QueueStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_unknown_history_is_not_found() {
        let (_, tracker, _) = enrolled_history().await;
        let err = tracker
            .ingest(EngagementEvent::Clicked, Uuid::new_v4(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_webhook_batch_summary() {
        let (_, tracker, h) = enrolled_history().await;
        let ev = |name: &str, id: Option<String>| SendGridEvent {
            event: name.into(),
            email: Some("quinn@example.com".into()),
            timestamp: Some(Utc::now().timestamp()),
            sg_message_id: Some("sg-1".into()),
            email_history_id: id,
        };
        let id = Some(h.id.to_string());
        let batch = vec![
            ev("delivered", id.clone()),
            ev("open", id.clone()),
            ev("open", id.clone()),
            ev("processed", id.clone()),
            ev("click", None),
            ev("click", Some(Uuid::new_v4().to_string())),
        ];

        let summary = tracker.ingest_sendgrid(&batch).await;
        assert_eq!(
            summary,
            WebhookSummary {
                accepted: 2,
                duplicates: 1,
                ignored: 2,
                errors: 1,
            }
        );
    }
}
