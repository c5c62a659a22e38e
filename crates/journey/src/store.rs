//! Durable storage contract for campaigns, templates, subscribers, the send
//! queue and email history, plus an in-memory implementation backed by
//! DashMap.
//!
//! Uniqueness guarantees live here rather than in callers: one open
//! subscriber per (tenant, campaign, client), one queue item per
//! (subscriber, template), one template per (campaign, sequence order).
//! A SQL backend maps each of these onto a unique index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use drip_core::error::{EngineError, EngineResult};
use drip_core::types::{
    Campaign, CampaignStatus, EmailHistory, EmailTemplate, EngagementEvent, QueueItem,
    QueueStatus, Subscriber, SubscriberStatus,
};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use crate::state_machine::{CAMPAIGN_LIFECYCLE, QUEUE_LIFECYCLE, SUBSCRIBER_LIFECYCLE};

/// Result of inserting a subscriber under the open-enrollment constraint.
#[derive(Debug, Clone)]
pub enum SubscriberInsert {
    Inserted(Subscriber),
    Duplicate { existing_id: Uuid },
}

/// Result of inserting a queue item under the (subscriber, template)
/// constraint.
#[derive(Debug, Clone)]
pub enum QueueInsert {
    Inserted(QueueItem),
    Duplicate { existing_id: Uuid },
    /// The subscriber left the sequence before the item could be written.
    SubscriberClosed { status: SubscriberStatus },
}

/// First-write-wins engagement update.
#[derive(Debug, Clone)]
pub struct EngagementWrite {
    pub history: EmailHistory,
    /// `false` when the field was already set and nothing changed.
    pub recorded: bool,
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    // ─── Campaigns ──────────────────────────────────────────────────────
    async fn insert_campaign(&self, campaign: Campaign) -> EngineResult<()>;
    async fn get_campaign(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Option<Campaign>>;
    async fn list_campaigns(&self, tenant_id: Uuid) -> EngineResult<Vec<Campaign>>;
    async fn update_campaign_status(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        status: CampaignStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<Campaign>;

    // ─── Templates ──────────────────────────────────────────────────────
    /// Fails with `Conflict` when the campaign already has a template at
    /// the same sequence order.
    async fn insert_template(&self, template: EmailTemplate) -> EngineResult<()>;
    /// Templates of a campaign ordered by `sequence_order`.
    async fn list_templates(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Vec<EmailTemplate>>;
    async fn get_template(&self, template_id: Uuid) -> EngineResult<Option<EmailTemplate>>;

    // ─── Subscribers ────────────────────────────────────────────────────
    async fn insert_subscriber(&self, subscriber: Subscriber) -> EngineResult<SubscriberInsert>;
    async fn get_subscriber(&self, subscriber_id: Uuid) -> EngineResult<Option<Subscriber>>;
    async fn list_subscribers(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Vec<Subscriber>>;
    /// Campaign ids in which the client holds an active or paused subscription.
    async fn open_campaigns_for_client(&self, tenant_id: Uuid, client_id: Uuid) -> EngineResult<HashSet<Uuid>>;
    async fn transition_subscriber(
        &self,
        subscriber_id: Uuid,
        to: SubscriberStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<Subscriber>;
    /// Advance the subscriber after a successful send. The position never
    /// moves backwards.
    async fn record_subscriber_send(
        &self,
        subscriber_id: Uuid,
        sequence_order: u32,
        now: DateTime<Utc>,
    ) -> EngineResult<Subscriber>;

    // ─── Send queue ─────────────────────────────────────────────────────
    /// Refuses items for a subscriber that is no longer open, atomically with
    /// any concurrent status change.
    async fn insert_queue_item(&self, item: QueueItem) -> EngineResult<QueueInsert>;
    async fn get_queue_item(&self, item_id: Uuid) -> EngineResult<Option<QueueItem>>;
    async fn list_queue_items(&self, subscriber_id: Uuid) -> EngineResult<Vec<QueueItem>>;
    /// Pending items due at `now` whose subscriber and campaign are active,
    /// oldest first.
    async fn due_queue_items(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<QueueItem>>;
    /// Atomically move a due item from pending to processing. `None` when
    /// another run claimed it first or it is no longer pending.
    async fn claim_queue_item(&self, item_id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<QueueItem>>;
    /// Persist the outcome of a claimed item. Only valid while the stored
    /// item is processing.
    async fn finish_queue_item(&self, item: QueueItem) -> EngineResult<QueueItem>;
    /// Return a claimed item to pending without touching its attempt count.
    async fn release_queue_item(&self, item_id: Uuid, now: DateTime<Utc>) -> EngineResult<QueueItem>;
    async fn cancel_pending_items(&self, subscriber_id: Uuid, now: DateTime<Utc>) -> EngineResult<usize>;

    // ─── History ────────────────────────────────────────────────────────
    async fn insert_history(&self, history: EmailHistory) -> EngineResult<()>;
    async fn get_history(&self, history_id: Uuid) -> EngineResult<Option<EmailHistory>>;
    async fn record_engagement(
        &self,
        history_id: Uuid,
        event: EngagementEvent,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<EngagementWrite>>;
    async fn campaign_history(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Vec<EmailHistory>>;
}

type EnrollmentKey = (Uuid, Uuid, Uuid);

/// Thread-safe in-memory store. Unique indexes are separate maps updated
/// through the entry API, so the check and the insert happen under the same
/// shard lock.
pub struct MemoryStore {
    campaigns: DashMap<Uuid, Campaign>,
    templates: DashMap<Uuid, EmailTemplate>,
    template_orders: DashMap<(Uuid, u32), Uuid>,
    subscribers: DashMap<Uuid, Subscriber>,
    open_enrollments: DashMap<EnrollmentKey, Uuid>,
    queue: DashMap<Uuid, QueueItem>,
    queue_keys: DashMap<(Uuid, Uuid), Uuid>,
    history: DashMap<Uuid, EmailHistory>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Campaign store initialized (in-memory)");
        Self {
            campaigns: DashMap::new(),
            templates: DashMap::new(),
            template_orders: DashMap::new(),
            subscribers: DashMap::new(),
            open_enrollments: DashMap::new(),
            queue: DashMap::new(),
            queue_keys: DashMap::new(),
            history: DashMap::new(),
        }
    }

    fn campaign_is_active(&self, campaign_id: &Uuid) -> bool {
        self.campaigns
            .get(campaign_id)
            .map(|c| c.status == CampaignStatus::Active)
            .unwrap_or(false)
    }

    fn subscriber_is_active(&self, subscriber_id: &Uuid) -> bool {
        self.subscribers
            .get(subscriber_id)
            .map(|s| s.status == SubscriberStatus::Active)
            .unwrap_or(false)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn insert_campaign(&self, campaign: Campaign) -> EngineResult<()> {
        match self.campaigns.entry(campaign.id) {
            Entry::Occupied(_) => Err(EngineError::Conflict(format!(
                "campaign {} already exists",
                campaign.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(campaign);
                Ok(())
            }
        }
    }

    async fn get_campaign(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Option<Campaign>> {
        Ok(self
            .campaigns
            .get(&campaign_id)
            .filter(|c| c.tenant_id == tenant_id)
            .map(|c| c.clone()))
    }

    async fn list_campaigns(&self, tenant_id: Uuid) -> EngineResult<Vec<Campaign>> {
        let mut campaigns: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|r| r.value().tenant_id == tenant_id)
            .map(|r| r.value().clone())
            .collect();
        campaigns.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(campaigns)
    }

    async fn update_campaign_status(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        status: CampaignStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<Campaign> {
        let mut entry = self
            .campaigns
            .get_mut(&campaign_id)
            .filter(|c| c.tenant_id == tenant_id)
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))?;
        CAMPAIGN_LIFECYCLE.check(entry.status, status)?;
        entry.status = status;
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn insert_template(&self, template: EmailTemplate) -> EngineResult<()> {
        match self
            .template_orders
            .entry((template.campaign_id, template.sequence_order))
        {
            Entry::Occupied(_) => Err(EngineError::Conflict(format!(
                "campaign {} already has a template at sequence order {}",
                template.campaign_id, template.sequence_order
            ))),
            Entry::Vacant(slot) => {
                slot.insert(template.id);
                self.templates.insert(template.id, template);
                Ok(())
            }
        }
    }

    async fn list_templates(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Vec<EmailTemplate>> {
        let mut templates: Vec<EmailTemplate> = self
            .templates
            .iter()
            .filter(|r| r.value().tenant_id == tenant_id && r.value().campaign_id == campaign_id)
            .map(|r| r.value().clone())
            .collect();
        templates.sort_by_key(|t| t.sequence_order);
        Ok(templates)
    }

    async fn get_template(&self, template_id: Uuid) -> EngineResult<Option<EmailTemplate>> {
        Ok(self.templates.get(&template_id).map(|t| t.clone()))
    }

    async fn insert_subscriber(&self, subscriber: Subscriber) -> EngineResult<SubscriberInsert> {
        let key = (subscriber.tenant_id, subscriber.campaign_id, subscriber.client_id);
        // Lock order: open_enrollments, then subscribers.
        match self.open_enrollments.entry(key) {
            Entry::Occupied(existing) => Ok(SubscriberInsert::Duplicate {
                existing_id: *existing.get(),
            }),
            Entry::Vacant(slot) => {
                self.subscribers.insert(subscriber.id, subscriber.clone());
                slot.insert(subscriber.id);
                Ok(SubscriberInsert::Inserted(subscriber))
            }
        }
    }

    async fn get_subscriber(&self, subscriber_id: Uuid) -> EngineResult<Option<Subscriber>> {
        Ok(self.subscribers.get(&subscriber_id).map(|s| s.clone()))
    }

    async fn list_subscribers(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Vec<Subscriber>> {
        let mut subscribers: Vec<Subscriber> = self
            .subscribers
            .iter()
            .filter(|r| r.value().tenant_id == tenant_id && r.value().campaign_id == campaign_id)
            .map(|r| r.value().clone())
            .collect();
        subscribers.sort_by_key(|s| s.enrolled_at);
        Ok(subscribers)
    }

    async fn open_campaigns_for_client(&self, tenant_id: Uuid, client_id: Uuid) -> EngineResult<HashSet<Uuid>> {
        Ok(self
            .open_enrollments
            .iter()
            .filter(|r| r.key().0 == tenant_id && r.key().2 == client_id)
            .map(|r| r.key().1)
            .collect())
    }

    async fn transition_subscriber(
        &self,
        subscriber_id: Uuid,
        to: SubscriberStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<Subscriber> {
        let key = self
            .subscribers
            .get(&subscriber_id)
            .map(|s| (s.tenant_id, s.campaign_id, s.client_id))
            .ok_or_else(|| EngineError::not_found("subscriber", subscriber_id))?;

        // Same lock order as insert_subscriber.
        let index = self.open_enrollments.entry(key);
        let updated = {
            let mut sub = self
                .subscribers
                .get_mut(&subscriber_id)
                .ok_or_else(|| EngineError::not_found("subscriber", subscriber_id))?;
            SUBSCRIBER_LIFECYCLE.check(sub.status, to)?;
            sub.status = to;
            sub.updated_at = now;
            match to {
                SubscriberStatus::Unsubscribed => sub.unsubscribed_at = Some(now),
                SubscriberStatus::Completed => sub.completed_at = Some(now),
                SubscriberStatus::Active | SubscriberStatus::Paused => {}
            }
            sub.clone()
        };

        if !to.is_open() {
            if let Entry::Occupied(slot) = index {
                if *slot.get() == subscriber_id {
                    slot.remove();
                }
            }
        }
        Ok(updated)
    }

    async fn record_subscriber_send(
        &self,
        subscriber_id: Uuid,
        sequence_order: u32,
        now: DateTime<Utc>,
    ) -> EngineResult<Subscriber> {
        let mut sub = self
            .subscribers
            .get_mut(&subscriber_id)
            .ok_or_else(|| EngineError::not_found("subscriber", subscriber_id))?;
        sub.current_sequence_position = sub.current_sequence_position.max(sequence_order);
        sub.emails_sent += 1;
        sub.updated_at = now;
        Ok(sub.clone())
    }

    async fn insert_queue_item(&self, item: QueueItem) -> EngineResult<QueueInsert> {
        // Held until the item is written so a concurrent unsubscribe either
        // sees the item in its cancel sweep or is seen here.
        let subscriber = self
            .subscribers
            .get(&item.subscriber_id)
            .ok_or_else(|| EngineError::not_found("subscriber", item.subscriber_id))?;
        if !subscriber.status.is_open() {
            return Ok(QueueInsert::SubscriberClosed {
                status: subscriber.status,
            });
        }

        match self.queue_keys.entry((item.subscriber_id, item.template_id)) {
            Entry::Occupied(existing) => Ok(QueueInsert::Duplicate {
                existing_id: *existing.get(),
            }),
            Entry::Vacant(slot) => {
                self.queue.insert(item.id, item.clone());
                slot.insert(item.id);
                Ok(QueueInsert::Inserted(item))
            }
        }
    }

    async fn get_queue_item(&self, item_id: Uuid) -> EngineResult<Option<QueueItem>> {
        Ok(self.queue.get(&item_id).map(|i| i.clone()))
    }

    async fn list_queue_items(&self, subscriber_id: Uuid) -> EngineResult<Vec<QueueItem>> {
        let mut items: Vec<QueueItem> = self
            .queue
            .iter()
            .filter(|r| r.value().subscriber_id == subscriber_id)
            .map(|r| r.value().clone())
            .collect();
        items.sort_by_key(|i| (i.sequence_order, i.created_at));
        Ok(items)
    }

    async fn due_queue_items(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<QueueItem>> {
        let candidates: Vec<QueueItem> = self
            .queue
            .iter()
            .filter(|r| r.value().status == QueueStatus::Pending && r.value().scheduled_for <= now)
            .map(|r| r.value().clone())
            .collect();

        let mut due: Vec<QueueItem> = candidates
            .into_iter()
            .filter(|i| self.subscriber_is_active(&i.subscriber_id) && self.campaign_is_active(&i.campaign_id))
            .collect();
        due.sort_by_key(|i| (i.scheduled_for, i.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_queue_item(&self, item_id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<QueueItem>> {
        let Some(mut item) = self.queue.get_mut(&item_id) else {
            return Ok(None);
        };
        if item.status != QueueStatus::Pending || item.scheduled_for > now {
            return Ok(None);
        }
        item.status = QueueStatus::Processing;
        item.updated_at = now;
        Ok(Some(item.clone()))
    }

    async fn finish_queue_item(&self, item: QueueItem) -> EngineResult<QueueItem> {
        let mut stored = self
            .queue
            .get_mut(&item.id)
            .ok_or_else(|| EngineError::not_found("queue item", item.id))?;
        if stored.status != QueueStatus::Processing {
            return Err(EngineError::Conflict(format!(
                "queue item {} is {:?}, not processing",
                item.id, stored.status
            )));
        }
        QUEUE_LIFECYCLE.check(stored.status, item.status)?;
        stored.status = item.status;
        stored.scheduled_for = item.scheduled_for;
        stored.attempt_count = item.attempt_count;
        stored.last_error = item.last_error;
        stored.sent_at = item.sent_at;
        stored.updated_at = item.updated_at;
        Ok(stored.clone())
    }

    async fn release_queue_item(&self, item_id: Uuid, now: DateTime<Utc>) -> EngineResult<QueueItem> {
        let mut stored = self
            .queue
            .get_mut(&item_id)
            .ok_or_else(|| EngineError::not_found("queue item", item_id))?;
        QUEUE_LIFECYCLE.check(stored.status, QueueStatus::Pending)?;
        stored.status = QueueStatus::Pending;
        stored.updated_at = now;
        Ok(stored.clone())
    }

    async fn cancel_pending_items(&self, subscriber_id: Uuid, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut cancelled = 0;
        for mut entry in self.queue.iter_mut() {
            let item = entry.value_mut();
            if item.subscriber_id == subscriber_id && item.status == QueueStatus::Pending {
                item.status = QueueStatus::Cancelled;
                item.updated_at = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn insert_history(&self, history: EmailHistory) -> EngineResult<()> {
        match self.history.entry(history.id) {
            Entry::Occupied(_) => Err(EngineError::Conflict(format!(
                "email history {} already exists",
                history.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(history);
                Ok(())
            }
        }
    }

    async fn get_history(&self, history_id: Uuid) -> EngineResult<Option<EmailHistory>> {
        Ok(self.history.get(&history_id).map(|h| h.clone()))
    }

    async fn record_engagement(
        &self,
        history_id: Uuid,
        event: EngagementEvent,
        at: DateTime<Utc>,
    ) -> EngineResult<Option<EngagementWrite>> {
        Ok(self.history.get_mut(&history_id).map(|mut h| {
            let recorded = h.apply(event, at);
            EngagementWrite {
                history: h.clone(),
                recorded,
            }
        }))
    }

    async fn campaign_history(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Vec<EmailHistory>> {
        Ok(self
            .history
            .iter()
            .filter(|r| r.value().tenant_id == tenant_id && r.value().campaign_id == campaign_id)
            .map(|r| r.value().clone())
            .collect())
    }
}
