//! Send-queue processor.
//!
//! One call to [`QueueProcessor::run`] drains up to `batch_size` due items.
//! Each item is claimed before anything is sent, so overlapping runs never
//! deliver the same item twice. A failure on one item is recorded on that
//! item and never aborts the batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use drip_core::config::AppConfig;
use drip_core::error::{EngineError, EngineResult};
use drip_core::event_bus::{make_event, EngineEventType, EventSink};
use drip_core::templates::TemplateRenderer;
use drip_core::types::{
    Campaign, CampaignStatus, Client, EmailHistory, QueueItem, QueueStatus, Subscriber,
    SubscriberStatus,
};
use drip_journey::{CampaignStore, ClientDirectory, Sequencer};

use crate::email::{MailTransport, OutboundEmail};

/// Upper bound for a single retry delay.
const MAX_BACKOFF_SECS: i64 = 24 * 3600;

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_backoff_secs: u64,
    /// Add up to 10% random jitter to retry delays.
    pub jitter: bool,
    pub public_base_url: String,
}

impl ProcessorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.queue.batch_size,
            max_attempts: config.queue.max_attempts,
            retry_backoff_secs: config.queue.retry_backoff_secs,
            jitter: true,
            public_base_url: config.api.public_base_url.clone(),
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Totals for one processor run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProcessSummary {
    pub processed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Terminal failures plus items that hit a storage error mid-flight.
    pub errors: usize,
    pub duration_ms: u64,
}

/// What happened to one claimed item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Sent { history_id: Uuid },
    Retried { attempt: u32, next_attempt_at: DateTime<Utc> },
    Failed { error: String },
    Cancelled { reason: String },
    /// Subscriber or campaign is paused; the item went back to pending.
    Released,
    /// Another run claimed the item first.
    Skipped,
}

pub struct QueueProcessor {
    store: Arc<dyn CampaignStore>,
    directory: Arc<dyn ClientDirectory>,
    transport: Arc<dyn MailTransport>,
    sequencer: Arc<Sequencer>,
    settings: ProcessorSettings,
    event_sink: Arc<dyn EventSink>,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        directory: Arc<dyn ClientDirectory>,
        transport: Arc<dyn MailTransport>,
        sequencer: Arc<Sequencer>,
        settings: ProcessorSettings,
    ) -> Self {
        info!(
            transport = transport.name(),
            batch_size = settings.batch_size,
            max_attempts = settings.max_attempts,
            "Queue processor initialized"
        );
        Self {
            store,
            directory,
            transport,
            sequencer,
            settings,
            event_sink: drip_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    /// Process due items as of `now`. Only the initial selection can fail.
    pub async fn run(&self, now: DateTime<Utc>) -> EngineResult<ProcessSummary> {
        let start = std::time::Instant::now();
        let due = self
            .store
            .due_queue_items(now, self.settings.batch_size)
            .await?;
        let mut summary = ProcessSummary::default();

        for item in due {
            let item_id = item.id;
            match self.process_item(item, now).await {
                Ok(ItemOutcome::Skipped) => {}
                Ok(outcome) => {
                    summary.processed += 1;
                    match outcome {
                        ItemOutcome::Sent { .. } => summary.sent += 1,
                        ItemOutcome::Retried { .. } => summary.retried += 1,
                        ItemOutcome::Failed { .. } => {
                            summary.failed += 1;
                            summary.errors += 1;
                        }
                        ItemOutcome::Cancelled { .. } => summary.cancelled += 1,
                        ItemOutcome::Released | ItemOutcome::Skipped => {}
                    }
                }
                Err(e) => {
                    error!(queue_item_id = %item_id, error = %e, "Queue item processing error");
                    metrics::counter!("queue.item_errors").increment(1);
                    summary.processed += 1;
                    summary.errors += 1;
                }
            }
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        metrics::histogram!("queue.run_duration_ms").record(summary.duration_ms as f64);
        info!(
            processed = summary.processed,
            sent = summary.sent,
            retried = summary.retried,
            failed = summary.failed,
            cancelled = summary.cancelled,
            errors = summary.errors,
            duration_ms = summary.duration_ms,
            "Queue run finished"
        );
        Ok(summary)
    }

    /// Claim and process one item.
    pub async fn process_item(&self, item: QueueItem, now: DateTime<Utc>) -> EngineResult<ItemOutcome> {
        let Some(mut item) = self.store.claim_queue_item(item.id, now).await? else {
            debug!(queue_item_id = %item.id, "Queue item already claimed");
            return Ok(ItemOutcome::Skipped);
        };

        let subscriber = match self.store.get_subscriber(item.subscriber_id).await? {
            Some(s) => s,
            None => return self.cancel(item, "subscriber missing", now).await,
        };
        match subscriber.status {
            SubscriberStatus::Active => {}
            SubscriberStatus::Paused => return self.release(item, now).await,
            SubscriberStatus::Completed | SubscriberStatus::Unsubscribed => {
                return self.cancel(item, "subscriber no longer active", now).await;
            }
        }

        let campaign = match self
            .store
            .get_campaign(item.tenant_id, item.campaign_id)
            .await?
        {
            Some(c) => c,
            None => return self.cancel(item, "campaign missing", now).await,
        };
        match campaign.status {
            CampaignStatus::Active => {}
            CampaignStatus::Archived => return self.cancel(item, "campaign archived", now).await,
            CampaignStatus::Draft | CampaignStatus::Paused => return self.release(item, now).await,
        }

        let Some(template) = self.store.get_template(item.template_id).await? else {
            return self.fail(item, "template missing".into(), now).await;
        };

        let client = match self
            .directory
            .get_client(subscriber.tenant_id, subscriber.client_id)
            .await
        {
            Ok(Some(c)) => c,
            Ok(None) => return self.fail(item, "client not found".into(), now).await,
            Err(e) => return self.attempt_failed(item, e.to_string(), true, now).await,
        };

        let renderer = TemplateRenderer::with_variables(self.variables(&client, &campaign, &subscriber));
        let rendered = match renderer.render(&template) {
            Ok(r) => r,
            Err(e) => {
                metrics::counter!("queue.render_errors").increment(1);
                return self.fail(item, e.to_string(), now).await;
            }
        };

        let history_id = Uuid::new_v4();
        let mut custom_args = BTreeMap::new();
        custom_args.insert("email_history_id".to_string(), history_id.to_string());
        custom_args.insert("tenant_id".to_string(), item.tenant_id.to_string());
        custom_args.insert("campaign_id".to_string(), item.campaign_id.to_string());
        custom_args.insert("subscriber_id".to_string(), item.subscriber_id.to_string());

        let email = OutboundEmail {
            to_email: client.email.clone(),
            to_name: Some(client.name.clone()),
            subject: rendered.subject,
            html: rendered.html,
            text: rendered.text,
            custom_args,
        };

        let receipt = match self.transport.send(&email).await {
            Ok(r) => r,
            Err(EngineError::Transport { message, retryable }) => {
                return self.attempt_failed(item, message, retryable, now).await;
            }
            Err(e) => return self.attempt_failed(item, e.to_string(), true, now).await,
        };

        // The email is out. Storage errors from here on are logged and the
        // subscriber still advances.
        item.status = QueueStatus::Sent;
        item.sent_at = Some(now);
        item.attempt_count += 1;
        item.last_error = None;
        item.updated_at = now;

        let history = EmailHistory {
            id: history_id,
            tenant_id: item.tenant_id,
            campaign_id: item.campaign_id,
            subscriber_id: item.subscriber_id,
            client_id: client.id,
            template_id: item.template_id,
            queue_item_id: item.id,
            to_email: email.to_email,
            subject: email.subject,
            provider_message_id: receipt.provider_message_id,
            sent_at: now,
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            converted_at: None,
            bounced: false,
            unsubscribed: false,
        };
        if let Err(e) = self.store.insert_history(history).await {
            error!(
                queue_item_id = %item.id,
                history_id = %history_id,
                error = %e,
                "Failed to record email history after send"
            );
            metrics::counter!("queue.history_errors").increment(1);
        }

        let item = match self.store.finish_queue_item(item.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(queue_item_id = %item.id, error = %e, "Failed to mark queue item sent");
                metrics::counter!("queue.finish_errors").increment(1);
                item
            }
        };

        info!(
            queue_item_id = %item.id,
            subscriber_id = %item.subscriber_id,
            step = item.sequence_order,
            "Email sent"
        );
        metrics::counter!("queue.items_sent").increment(1);
        self.event_sink.emit(
            make_event(
                EngineEventType::EmailSent,
                item.tenant_id,
                Some(item.campaign_id),
                Some(item.subscriber_id),
            )
            .with_queue_item(item.id),
        );

        // The item is already sent; a failure to queue the next step must not
        // turn it into a retry.
        if let Err(e) = self.advance(&item, &campaign, now).await {
            error!(
                subscriber_id = %item.subscriber_id,
                error = %e,
                "Failed to schedule next step after send"
            );
            metrics::counter!("queue.advance_errors").increment(1);
        }

        Ok(ItemOutcome::Sent { history_id })
    }

    async fn advance(&self, item: &QueueItem, campaign: &Campaign, now: DateTime<Utc>) -> EngineResult<()> {
        let subscriber = self
            .store
            .record_subscriber_send(item.subscriber_id, item.sequence_order, now)
            .await?;
        if subscriber.status != SubscriberStatus::Active {
            return Ok(());
        }
        self.sequencer
            .schedule_next(&subscriber, campaign, now, now)
            .await?;
        Ok(())
    }

    /// Template variables for one recipient. Client attributes come first so
    /// the built-in names always win.
    pub fn variables(&self, client: &Client, campaign: &Campaign, subscriber: &Subscriber) -> HashMap<String, String> {
        let mut vars = client.attributes.clone();
        vars.insert("client_name".into(), client.name.clone());
        vars.insert("first_name".into(), client.first_name().to_string());
        vars.insert("email".into(), client.email.clone());
        vars.insert("life_stage".into(), client.life_stage.clone().unwrap_or_default());
        vars.insert("client_type".into(), client.client_type.clone().unwrap_or_default());
        vars.insert("campaign_name".into(), campaign.name.clone());
        vars.insert(
            "unsubscribe_url".into(),
            format!(
                "{}/v1/portal/tenants/{}/subscribers/{}/unsubscribe",
                self.settings.public_base_url.trim_end_matches('/'),
                subscriber.tenant_id,
                subscriber.id
            ),
        );
        vars
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at one day.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_backoff_secs as i64;
        let exp = attempt.saturating_sub(1).min(16);
        let secs = base.saturating_mul(1i64 << exp).min(MAX_BACKOFF_SECS);
        let jitter = if self.settings.jitter && secs >= 10 {
            rand::thread_rng().gen_range(0..=secs / 10)
        } else {
            0
        };
        Duration::seconds(secs + jitter)
    }

    async fn attempt_failed(
        &self,
        mut item: QueueItem,
        message: String,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<ItemOutcome> {
        item.attempt_count += 1;
        if !retryable || item.attempt_count >= self.settings.max_attempts {
            return self.fail(item, message, now).await;
        }

        let next_attempt_at = now + self.backoff(item.attempt_count);
        item.status = QueueStatus::Pending;
        item.scheduled_for = next_attempt_at;
        item.last_error = Some(message.clone());
        item.updated_at = now;
        let item = self.store.finish_queue_item(item).await?;

        warn!(
            queue_item_id = %item.id,
            attempt = item.attempt_count,
            next_attempt_at = %next_attempt_at,
            error = %message,
            "Email send failed, will retry"
        );
        metrics::counter!("queue.items_retried").increment(1);
        self.event_sink.emit(
            make_event(
                EngineEventType::EmailRetried,
                item.tenant_id,
                Some(item.campaign_id),
                Some(item.subscriber_id),
            )
            .with_queue_item(item.id)
            .with_detail(message),
        );
        Ok(ItemOutcome::Retried {
            attempt: item.attempt_count,
            next_attempt_at,
        })
    }

    async fn fail(&self, mut item: QueueItem, message: String, now: DateTime<Utc>) -> EngineResult<ItemOutcome> {
        item.status = QueueStatus::Failed;
        item.last_error = Some(message.clone());
        item.updated_at = now;
        let item = self.store.finish_queue_item(item).await?;

        error!(
            queue_item_id = %item.id,
            subscriber_id = %item.subscriber_id,
            attempts = item.attempt_count,
            error = %message,
            "Email permanently failed"
        );
        metrics::counter!("queue.items_failed").increment(1);
        self.event_sink.emit(
            make_event(
                EngineEventType::EmailFailed,
                item.tenant_id,
                Some(item.campaign_id),
                Some(item.subscriber_id),
            )
            .with_queue_item(item.id)
            .with_detail(message.clone()),
        );

        if let Err(e) = self.close_after_failure(&item, now).await {
            error!(
                subscriber_id = %item.subscriber_id,
                error = %e,
                "Failed to close subscriber after permanent failure"
            );
            metrics::counter!("queue.close_errors").increment(1);
        }
        Ok(ItemOutcome::Failed { error: message })
    }

    /// A step that can never be delivered ends the sequence: the subscriber
    /// is completed, which frees its enrollment slot, and anything still
    /// queued for it is cancelled.
    async fn close_after_failure(&self, item: &QueueItem, now: DateTime<Utc>) -> EngineResult<()> {
        let Some(subscriber) = self.store.get_subscriber(item.subscriber_id).await? else {
            return Ok(());
        };
        if !subscriber.status.is_open() {
            return Ok(());
        }

        let subscriber = self
            .store
            .transition_subscriber(subscriber.id, SubscriberStatus::Completed, now)
            .await?;
        let cancelled = self.store.cancel_pending_items(subscriber.id, now).await?;

        warn!(
            subscriber_id = %subscriber.id,
            campaign_id = %subscriber.campaign_id,
            failed_step = item.sequence_order,
            cancelled_items = cancelled,
            "Subscriber closed after undeliverable step"
        );
        metrics::counter!("enrollment.closed_on_failure").increment(1);
        self.event_sink.emit(
            make_event(
                EngineEventType::SubscriberCompleted,
                subscriber.tenant_id,
                Some(subscriber.campaign_id),
                Some(subscriber.id),
            )
            .with_queue_item(item.id)
            .with_detail("send failed"),
        );
        Ok(())
    }

    async fn cancel(&self, mut item: QueueItem, reason: &str, now: DateTime<Utc>) -> EngineResult<ItemOutcome> {
        item.status = QueueStatus::Cancelled;
        item.updated_at = now;
        let item = self.store.finish_queue_item(item).await?;

        debug!(queue_item_id = %item.id, reason, "Queue item cancelled");
        metrics::counter!("queue.items_cancelled").increment(1);
        self.event_sink.emit(
            make_event(
                EngineEventType::EmailCancelled,
                item.tenant_id,
                Some(item.campaign_id),
                Some(item.subscriber_id),
            )
            .with_queue_item(item.id)
            .with_detail(reason),
        );
        Ok(ItemOutcome::Cancelled {
            reason: reason.to_string(),
        })
    }

    async fn release(&self, item: QueueItem, now: DateTime<Utc>) -> EngineResult<ItemOutcome> {
        self.store.release_queue_item(item.id, now).await?;
        debug!(queue_item_id = %item.id, "Queue item released");
        Ok(ItemOutcome::Released)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::email::RecordingTransport;
    use async_trait::async_trait;
    use drip_core::types::{EmailTemplate, EngagementEvent, EnrollmentSource, TargetingCriteria};
    use drip_journey::store::{QueueInsert, SubscriberInsert};
    use drip_journey::{EngagementWrite, EnrollOutcome, EnrollmentManager, MemoryClientDirectory, MemoryStore};
    use std::collections::{BTreeSet, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Memory store with switchable faults.
    struct FaultyStore {
        inner: Arc<MemoryStore>,
        fail_next_history: AtomicBool,
        /// Unsubscribe this subscriber the next time templates are listed,
        /// which lands between the sender's status check and the insert of
        /// the next step.
        unsubscribe_on_list: Mutex<Option<Uuid>>,
    }

    impl FaultyStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                fail_next_history: AtomicBool::new(false),
                unsubscribe_on_list: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl CampaignStore for FaultyStore {
        async fn insert_campaign(&self, campaign: Campaign) -> EngineResult<()> {
            self.inner.insert_campaign(campaign).await
        }
        async fn get_campaign(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Option<Campaign>> {
            self.inner.get_campaign(tenant_id, campaign_id).await
        }
        async fn list_campaigns(&self, tenant_id: Uuid) -> EngineResult<Vec<Campaign>> {
            self.inner.list_campaigns(tenant_id).await
        }
        async fn update_campaign_status(
            &self,
            tenant_id: Uuid,
            campaign_id: Uuid,
            status: CampaignStatus,
            now: DateTime<Utc>,
        ) -> EngineResult<Campaign> {
            self.inner.update_campaign_status(tenant_id, campaign_id, status, now).await
        }
        async fn insert_template(&self, template: EmailTemplate) -> EngineResult<()> {
            self.inner.insert_template(template).await
        }
        async fn list_templates(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Vec<EmailTemplate>> {
            let target = self.unsubscribe_on_list.lock().unwrap().take();
            if let Some(subscriber_id) = target {
                let now = Utc::now();
                self.inner
                    .transition_subscriber(subscriber_id, SubscriberStatus::Unsubscribed, now)
                    .await?;
                self.inner.cancel_pending_items(subscriber_id, now).await?;
            }
            self.inner.list_templates(tenant_id, campaign_id).await
        }
        async fn get_template(&self, template_id: Uuid) -> EngineResult<Option<EmailTemplate>> {
            self.inner.get_template(template_id).await
        }
        async fn insert_subscriber(&self, subscriber: Subscriber) -> EngineResult<SubscriberInsert> {
            self.inner.insert_subscriber(subscriber).await
        }
        async fn get_subscriber(&self, subscriber_id: Uuid) -> EngineResult<Option<Subscriber>> {
            self.inner.get_subscriber(subscriber_id).await
        }
        async fn list_subscribers(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Vec<Subscriber>> {
            self.inner.list_subscribers(tenant_id, campaign_id).await
        }
        async fn open_campaigns_for_client(&self, tenant_id: Uuid, client_id: Uuid) -> EngineResult<HashSet<Uuid>> {
            self.inner.open_campaigns_for_client(tenant_id, client_id).await
        }
        async fn transition_subscriber(
            &self,
            subscriber_id: Uuid,
            to: SubscriberStatus,
            now: DateTime<Utc>,
        ) -> EngineResult<Subscriber> {
            self.inner.transition_subscriber(subscriber_id, to, now).await
        }
        async fn record_subscriber_send(
            &self,
            subscriber_id: Uuid,
            sequence_order: u32,
            now: DateTime<Utc>,
        ) -> EngineResult<Subscriber> {
            self.inner.record_subscriber_send(subscriber_id, sequence_order, now).await
        }
        async fn insert_queue_item(&self, item: QueueItem) -> EngineResult<QueueInsert> {
            self.inner.insert_queue_item(item).await
        }
        async fn get_queue_item(&self, item_id: Uuid) -> EngineResult<Option<QueueItem>> {
            self.inner.get_queue_item(item_id).await
        }
        async fn list_queue_items(&self, subscriber_id: Uuid) -> EngineResult<Vec<QueueItem>> {
            self.inner.list_queue_items(subscriber_id).await
        }
        async fn due_queue_items(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<QueueItem>> {
            self.inner.due_queue_items(now, limit).await
        }
        async fn claim_queue_item(&self, item_id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<QueueItem>> {
            self.inner.claim_queue_item(item_id, now).await
        }
        async fn finish_queue_item(&self, item: QueueItem) -> EngineResult<QueueItem> {
            self.inner.finish_queue_item(item).await
        }
        async fn release_queue_item(&self, item_id: Uuid, now: DateTime<Utc>) -> EngineResult<QueueItem> {
            self.inner.release_queue_item(item_id, now).await
        }
        async fn cancel_pending_items(&self, subscriber_id: Uuid, now: DateTime<Utc>) -> EngineResult<usize> {
            self.inner.cancel_pending_items(subscriber_id, now).await
        }
        async fn insert_history(&self, history: EmailHistory) -> EngineResult<()> {
            if self.fail_next_history.swap(false, Ordering::SeqCst) {
                return Err(EngineError::Storage("history table unavailable".into()));
            }
            self.inner.insert_history(history).await
        }
        async fn get_history(&self, history_id: Uuid) -> EngineResult<Option<EmailHistory>> {
            self.inner.get_history(history_id).await
        }
        async fn record_engagement(
            &self,
            history_id: Uuid,
            event: EngagementEvent,
            at: DateTime<Utc>,
        ) -> EngineResult<Option<EngagementWrite>> {
            self.inner.record_engagement(history_id, event, at).await
        }
        async fn campaign_history(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Vec<EmailHistory>> {
            self.inner.campaign_history(tenant_id, campaign_id).await
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        faults: Arc<FaultyStore>,
        directory: Arc<MemoryClientDirectory>,
        transport: Arc<RecordingTransport>,
        manager: EnrollmentManager,
        processor: QueueProcessor,
        campaign: Campaign,
    }

    async fn harness(subjects: &[&str], delays: &[u32], max_attempts: u32) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let directory = Arc::new(MemoryClientDirectory::new());
        let transport = Arc::new(RecordingTransport::new());
        let sequencer = Arc::new(Sequencer::new(faults.clone()));
        let manager = EnrollmentManager::new(faults.clone(), directory.clone(), sequencer.clone());
        let processor = QueueProcessor::new(
            faults.clone(),
            directory.clone(),
            transport.clone(),
            sequencer,
            ProcessorSettings {
                batch_size: 50,
                max_attempts,
                retry_backoff_secs: 300,
                jitter: false,
                public_base_url: "https://app.example.com".into(),
            },
        );

        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Maintenance reminders".into(),
            description: None,
            status: CampaignStatus::Active,
            targeting: TargetingCriteria::default(),
            max_emails_per_campaign: 10,
            created_at: now,
            updated_at: now,
        };
        store.insert_campaign(campaign.clone()).await.unwrap();
        for (i, (subject, delay)) in subjects.iter().zip(delays).enumerate() {
            store
                .insert_template(EmailTemplate {
                    id: Uuid::new_v4(),
                    tenant_id: campaign.tenant_id,
                    campaign_id: campaign.id,
                    name: format!("step {}", i + 1),
                    sequence_order: i as u32 + 1,
                    send_delay_days: *delay,
                    subject: subject.to_string(),
                    body_html: "<p>{{first_name}}, <a href=\"{{unsubscribe_url}}\">unsubscribe</a></p>".into(),
                    body_text: None,
                    created_at: now,
                })
                .await
                .unwrap();
        }

        Harness {
            store,
            faults,
            directory,
            transport,
            manager,
            processor,
            campaign,
        }
    }

    impl Harness {
        async fn enroll(&self) -> Subscriber {
            let client = Client {
                id: Uuid::new_v4(),
                tenant_id: self.campaign.tenant_id,
                name: "Morgan Hale".into(),
                email: "morgan@example.com".into(),
                life_stage: Some("lapsed".into()),
                client_type: None,
                prior_services: BTreeSet::new(),
                attributes: [("property".to_string(), "12 Elm St".to_string())].into(),
            };
            self.directory.upsert(client.clone());
            match self
                .manager
                .enroll(self.campaign.tenant_id, self.campaign.id, client.id, EnrollmentSource::Manual)
                .await
                .unwrap()
            {
                EnrollOutcome::Enrolled { subscriber, .. } => subscriber,
                other => panic!("expected enrollment, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_sends_and_advances() {
        let h = harness(&["Hi {{first_name}}", "About {{property}}"], &[0, 2], 3).await;
        let sub = h.enroll().await;
        let now = Utc::now() + Duration::seconds(1);

        let summary = h.processor.run(now).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.errors, 0);

        let sent = h.transport.sent();
        assert_eq!(sent[0].subject, "Hi Morgan");
        assert!(sent[0].html.contains(&format!("/subscribers/{}/unsubscribe", sub.id)));
        assert!(sent[0].custom_args.contains_key("email_history_id"));

        let sub = h.store.get_subscriber(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.current_sequence_position, 1);
        assert_eq!(sub.emails_sent, 1);

        let items = h.store.list_queue_items(sub.id).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].status, QueueStatus::Sent);
        assert_eq!(items[1].status, QueueStatus::Pending);
        assert_eq!(items[1].scheduled_for, now + Duration::days(2));

        // Nothing else is due yet.
        let idle = h.processor.run(now).await.unwrap();
        assert_eq!(idle.processed, 0);
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_completes_after_last_step() {
        let h = harness(&["One", "Two"], &[0, 1], 3).await;
        let sub = h.enroll().await;
        let t1 = Utc::now() + Duration::seconds(1);

        h.processor.run(t1).await.unwrap();
        let t2 = t1 + Duration::days(1);
        let summary = h.processor.run(t2).await.unwrap();
        assert_eq!(summary.sent, 1);

        let sub = h.store.get_subscriber(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriberStatus::Completed);
        assert_eq!(sub.emails_sent, 2);
        assert_eq!(h.transport.sent_count(), 2);
        assert!(h.store.due_queue_items(t2 + Duration::days(30), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_item_fails_exactly_once() {
        let h = harness(&["One"], &[0], 3).await;
        let sub = h.enroll().await;
        h.transport.fail_always(true, true);

        let mut now = Utc::now() + Duration::seconds(1);
        let first = h.processor.run(now).await.unwrap();
        assert_eq!((first.retried, first.errors), (1, 0));

        let item = h.store.list_queue_items(sub.id).await.unwrap()[0].clone();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(item.scheduled_for, now + Duration::seconds(300));

        now = item.scheduled_for;
        let second = h.processor.run(now).await.unwrap();
        assert_eq!(second.retried, 1);
        let item = h.store.get_queue_item(item.id).await.unwrap().unwrap();
        assert_eq!(item.scheduled_for, now + Duration::seconds(600));

        now = item.scheduled_for;
        let third = h.processor.run(now).await.unwrap();
        assert_eq!((third.failed, third.errors), (1, 1));

        let item = h.store.get_queue_item(item.id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.attempt_count, 3);
        assert!(item.last_error.is_some());

        let later = h.processor.run(now + Duration::days(10)).await.unwrap();
        assert_eq!(later.processed, 0);
        assert_eq!(h.transport.sent_count(), 0);

        // The undeliverable step ends the sequence and frees the slot.
        let sub = h.store.get_subscriber(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriberStatus::Completed);
        assert!(sub.completed_at.is_some());
        let open = h
            .store
            .open_campaigns_for_client(sub.tenant_id, sub.client_id)
            .await
            .unwrap();
        assert!(open.is_empty());
        let again = h
            .manager
            .enroll(sub.tenant_id, sub.campaign_id, sub.client_id, EnrollmentSource::Manual)
            .await
            .unwrap();
        assert!(matches!(again, EnrollOutcome::Enrolled { .. }));
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let h = harness(&["One"], &[0], 3).await;
        h.enroll().await;
        h.transport.fail_always(true, false);

        let summary = h.processor.run(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!((summary.failed, summary.retried), (1, 0));
    }

    #[tokio::test]
    async fn test_render_error_is_terminal() {
        let h = harness(&["Hi {{nickname}}"], &[0], 3).await;
        let sub = h.enroll().await;

        let summary = h.processor.run(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!((summary.failed, summary.errors), (1, 1));
        let item = h.store.list_queue_items(sub.id).await.unwrap()[0].clone();
        assert_eq!(item.status, QueueStatus::Failed);
        assert!(item.last_error.unwrap().contains("nickname"));
        assert_eq!(h.transport.sent_count(), 0);
        let sub = h.store.get_subscriber(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriberStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_step_cancels_later_steps() {
        let h = harness(&["One", "Two"], &[0, 3], 3).await;
        let sub = h.enroll().await;
        let now = Utc::now() + Duration::seconds(1);
        let first = h.store.list_queue_items(sub.id).await.unwrap()[0].clone();
        let second_template = h.store.list_templates(sub.tenant_id, sub.campaign_id).await.unwrap()[1].clone();
        h.store
            .insert_queue_item(QueueItem {
                id: Uuid::new_v4(),
                template_id: second_template.id,
                sequence_order: 2,
                scheduled_for: first.scheduled_for + Duration::days(3),
                ..first.clone()
            })
            .await
            .unwrap();
        h.transport.fail_always(true, false);

        let summary = h.processor.run(now).await.unwrap();
        assert_eq!(summary.failed, 1);

        let items = h.store.list_queue_items(sub.id).await.unwrap();
        assert_eq!(items[0].status, QueueStatus::Failed);
        assert_eq!(items[1].status, QueueStatus::Cancelled);
        let sub = h.store.get_subscriber(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriberStatus::Completed);
    }

    #[tokio::test]
    async fn test_history_write_failure_still_advances() {
        let h = harness(&["One", "Two"], &[0, 2], 3).await;
        let sub = h.enroll().await;
        h.faults.fail_next_history.store(true, Ordering::SeqCst);

        let now = Utc::now() + Duration::seconds(1);
        let summary = h.processor.run(now).await.unwrap();
        assert_eq!((summary.sent, summary.errors), (1, 0));
        assert_eq!(h.transport.sent_count(), 1);

        let sub = h.store.get_subscriber(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriberStatus::Active);
        assert_eq!(sub.current_sequence_position, 1);
        assert_eq!(sub.emails_sent, 1);

        let items = h.store.list_queue_items(sub.id).await.unwrap();
        assert_eq!(items[0].status, QueueStatus::Sent);
        assert_eq!(items[1].status, QueueStatus::Pending);

        let next = h.processor.run(now + Duration::days(2)).await.unwrap();
        assert_eq!(next.sent, 1);
        assert_eq!(h.transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_while_scheduling_leaves_nothing_pending() {
        let h = harness(&["One", "Two"], &[0, 2], 3).await;
        let sub = h.enroll().await;
        *h.faults.unsubscribe_on_list.lock().unwrap() = Some(sub.id);

        let now = Utc::now() + Duration::seconds(1);
        let summary = h.processor.run(now).await.unwrap();
        assert_eq!(summary.sent, 1);

        let sub = h.store.get_subscriber(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriberStatus::Unsubscribed);
        let items = h.store.list_queue_items(sub.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueStatus::Sent);
        assert!(h.store.due_queue_items(now + Duration::days(30), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unenrolled_subscriber_gets_nothing() {
        let h = harness(&["One", "Two"], &[0, 0], 3).await;
        let sub = h.enroll().await;
        h.manager.unenroll(sub.tenant_id, sub.id).await.unwrap();

        let summary = h.processor.run(Utc::now() + Duration::days(5)).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(h.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_paused_after_selection_is_released() {
        let h = harness(&["One"], &[0], 3).await;
        let sub = h.enroll().await;
        let now = Utc::now() + Duration::seconds(1);
        let due = h.store.due_queue_items(now, 10).await.unwrap();

        h.manager.pause(sub.tenant_id, sub.id).await.unwrap();
        let outcome = h.processor.process_item(due[0].clone(), now).await.unwrap();
        assert!(matches!(outcome, ItemOutcome::Released));
        let item = h.store.get_queue_item(due[0].id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_overlapping_runs_send_once() {
        let h = harness(&["One"], &[0], 3).await;
        h.enroll().await;
        let now = Utc::now() + Duration::seconds(1);
        let due = h.store.due_queue_items(now, 10).await.unwrap();

        let first = h.processor.process_item(due[0].clone(), now).await.unwrap();
        let second = h.processor.process_item(due[0].clone(), now).await.unwrap();
        assert!(matches!(first, ItemOutcome::Sent { .. }));
        assert!(matches!(second, ItemOutcome::Skipped));
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let processor_settings = ProcessorSettings {
            batch_size: 1,
            max_attempts: 30,
            retry_backoff_secs: 300,
            jitter: false,
            public_base_url: String::new(),
        };
        let store = Arc::new(MemoryStore::new());
        let processor = QueueProcessor::new(
            store.clone(),
            Arc::new(MemoryClientDirectory::new()),
            Arc::new(RecordingTransport::new()),
            Arc::new(Sequencer::new(store)),
            processor_settings,
        );
        assert_eq!(processor.backoff(1), Duration::seconds(300));
        assert_eq!(processor.backoff(2), Duration::seconds(600));
        assert_eq!(processor.backoff(3), Duration::seconds(1200));
        assert_eq!(processor.backoff(20), Duration::seconds(MAX_BACKOFF_SECS));
    }
}
