use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use utoipa::ToSchema;
use uuid::Uuid;

// ─── Campaigns ──────────────────────────────────────────────────────────────

/// Operator-controlled lifecycle of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// Segment definition for a campaign. An empty set is a wildcard for that
/// dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TargetingCriteria {
    #[serde(default)]
    pub life_stages: BTreeSet<String>,
    #[serde(default)]
    pub client_types: BTreeSet<String>,
    #[serde(default)]
    pub prior_services: BTreeSet<String>,
}

impl TargetingCriteria {
    pub fn is_match_all(&self) -> bool {
        self.life_stages.is_empty() && self.client_types.is_empty() && self.prior_services.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Campaign {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: CampaignStatus,
    pub targeting: TargetingCriteria,
    pub max_emails_per_campaign: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One step of a campaign's email sequence.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub name: String,
    /// 1-based position in the sequence, unique per campaign.
    pub sequence_order: u32,
    /// Days to wait after the previous step (or enrollment, for the first step).
    pub send_delay_days: u32,
    pub subject: String,
    pub body_html: String,
    pub body_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─── Subscribers ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Active,
    Paused,
    Completed,
    Unsubscribed,
}

impl SubscriberStatus {
    /// Active and paused subscribers hold the (tenant, campaign, client) slot.
    pub fn is_open(&self) -> bool {
        matches!(self, SubscriberStatus::Active | SubscriberStatus::Paused)
    }
}

/// How a subscriber entered the campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentSource {
    Manual,
    Auto,
    Portal,
    Api,
}

impl EnrollmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentSource::Manual => "manual",
            EnrollmentSource::Auto => "auto",
            EnrollmentSource::Portal => "portal",
            EnrollmentSource::Api => "api",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Subscriber {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub client_id: Uuid,
    pub status: SubscriberStatus,
    pub source: EnrollmentSource,
    pub enrolled_at: DateTime<Utc>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Sequence order of the last successfully sent step; 0 before the first send.
    pub current_sequence_position: u32,
    pub emails_sent: u32,
    pub updated_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn new(
        tenant_id: Uuid,
        campaign_id: Uuid,
        client_id: Uuid,
        source: EnrollmentSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            campaign_id,
            client_id,
            status: SubscriberStatus::Active,
            source,
            enrolled_at: now,
            unsubscribed_at: None,
            completed_at: None,
            current_sequence_position: 0,
            emails_sent: 0,
            updated_at: now,
        }
    }
}

// ─── Send queue ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    /// Claimed by a processor run; delivery may be in flight.
    Processing,
    Sent,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueueItem {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub subscriber_id: Uuid,
    pub template_id: Uuid,
    pub sequence_order: u32,
    pub scheduled_for: DateTime<Utc>,
    pub status: QueueStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── History & engagement ───────────────────────────────────────────────────

/// Delivery and interaction signals reported for a sent email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EngagementEvent {
    Delivered,
    Opened,
    Clicked,
    Converted,
    Bounced,
    Unsubscribed,
}

impl EngagementEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementEvent::Delivered => "delivered",
            EngagementEvent::Opened => "opened",
            EngagementEvent::Clicked => "clicked",
            EngagementEvent::Converted => "converted",
            EngagementEvent::Bounced => "bounced",
            EngagementEvent::Unsubscribed => "unsubscribed",
        }
    }
}

/// One row per sent queue item. Engagement fields are written once.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmailHistory {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub subscriber_id: Uuid,
    pub client_id: Uuid,
    pub template_id: Uuid,
    pub queue_item_id: Uuid,
    pub to_email: String,
    pub subject: String,
    pub provider_message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub converted_at: Option<DateTime<Utc>>,
    pub bounced: bool,
    pub unsubscribed: bool,
}

impl EmailHistory {
    /// Applies an engagement event with first-write-wins semantics. Returns
    /// `true` when the field was previously unset.
    pub fn apply(&mut self, event: EngagementEvent, at: DateTime<Utc>) -> bool {
        fn set_once(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) -> bool {
            if slot.is_some() {
                return false;
            }
            *slot = Some(at);
            true
        }

        match event {
            EngagementEvent::Delivered => set_once(&mut self.delivered_at, at),
            EngagementEvent::Opened => set_once(&mut self.opened_at, at),
            EngagementEvent::Clicked => set_once(&mut self.clicked_at, at),
            EngagementEvent::Converted => set_once(&mut self.converted_at, at),
            EngagementEvent::Bounced => !std::mem::replace(&mut self.bounced, true),
            EngagementEvent::Unsubscribed => !std::mem::replace(&mut self.unsubscribed, true),
        }
    }
}

/// Aggregate engagement for a campaign. Rates are percentages of `sent`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CampaignMetrics {
    pub campaign_id: Uuid,
    pub sent: u64,
    pub delivered: u64,
    pub opens: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub bounces: u64,
    pub unsubscribes: u64,
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub conversion_rate: f64,
    pub bounce_rate: f64,
    pub unsubscribe_rate: f64,
}

// ─── Clients ────────────────────────────────────────────────────────────────

/// A client record owned by the CRM side of the application. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Client {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub email: String,
    pub life_stage: Option<String>,
    pub client_type: Option<String>,
    #[serde(default)]
    pub prior_services: BTreeSet<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Client {
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}
