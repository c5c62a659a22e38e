//! Operator-facing campaign and template management.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use drip_core::error::{EngineError, EngineResult};
use drip_core::event_bus::{make_event, EngineEventType, EventSink};
use drip_core::types::{Campaign, CampaignStatus, EmailTemplate, SubscriberStatus, TargetingCriteria};

use crate::state_machine::CAMPAIGN_LIFECYCLE;
use crate::store::CampaignStore;

fn default_max_emails() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub targeting: TargetingCriteria,
    #[serde(default = "default_max_emails")]
    pub max_emails_per_campaign: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewTemplate {
    pub name: String,
    pub sequence_order: u32,
    #[serde(default)]
    pub send_delay_days: u32,
    pub subject: String,
    pub body_html: String,
    #[serde(default)]
    pub body_text: Option<String>,
}

pub struct CampaignCatalog {
    store: Arc<dyn CampaignStore>,
    event_sink: Arc<dyn EventSink>,
}

impl CampaignCatalog {
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

    /// Create a campaign in draft status.
    pub async fn create_campaign(&self, tenant_id: Uuid, req: NewCampaign) -> EngineResult<Campaign> {
        if tenant_id.is_nil() {
            return Err(EngineError::Validation("tenant_id must not be nil".into()));
        }
        if req.name.trim().is_empty() {
            return Err(EngineError::Validation("campaign name is required".into()));
        }
        if req.max_emails_per_campaign == 0 {
            return Err(EngineError::Validation(
                "max_emails_per_campaign must be at least 1".into(),
            ));
        }

        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            tenant_id,
            name: req.name.trim().to_string(),
            description: req.description,
            status: CampaignStatus::Draft,
            targeting: req.targeting,
            max_emails_per_campaign: req.max_emails_per_campaign,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_campaign(campaign.clone()).await?;
        info!(campaign_id = %campaign.id, name = %campaign.name, "Campaign created");
        Ok(campaign)
    }

    pub async fn get_campaign(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Campaign> {
        self.store
            .get_campaign(tenant_id, campaign_id)
            .await?
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))
    }

    pub async fn list_campaigns(&self, tenant_id: Uuid) -> EngineResult<Vec<Campaign>> {
        self.store.list_campaigns(tenant_id).await
    }

    pub async fn add_template(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        req: NewTemplate,
    ) -> EngineResult<EmailTemplate> {
        let campaign = self.get_campaign(tenant_id, campaign_id).await?;
        if campaign.status == CampaignStatus::Archived {
            return Err(EngineError::Validation(format!(
                "campaign {campaign_id} is archived"
            )));
        }
        if req.sequence_order == 0 {
            return Err(EngineError::Validation("sequence_order starts at 1".into()));
        }
        if req.subject.trim().is_empty() || req.body_html.trim().is_empty() {
            return Err(EngineError::Validation(
                "template subject and body_html are required".into(),
            ));
        }

        let template = EmailTemplate {
            id: Uuid::new_v4(),
            tenant_id,
            campaign_id,
            name: req.name,
            sequence_order: req.sequence_order,
            send_delay_days: req.send_delay_days,
            subject: req.subject,
            body_html: req.body_html,
            body_text: req.body_text,
            created_at: Utc::now(),
        };
        self.store.insert_template(template.clone()).await?;
        info!(
            campaign_id = %campaign_id,
            template_id = %template.id,
            sequence_order = template.sequence_order,
            "Template added"
        );
        Ok(template)
    }

    pub async fn list_templates(&self, tenant_id: Uuid, campaign_id: Uuid) -> EngineResult<Vec<EmailTemplate>> {
        self.get_campaign(tenant_id, campaign_id).await?;
        self.store.list_templates(tenant_id, campaign_id).await
    }

    /// Move a campaign through its lifecycle. Archiving completes every open
    /// subscriber and cancels their pending items.
    pub async fn set_status(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        status: CampaignStatus,
    ) -> EngineResult<Campaign> {
        let current = self.get_campaign(tenant_id, campaign_id).await?;
        CAMPAIGN_LIFECYCLE.check(current.status, status)?;

        if status == CampaignStatus::Active
            && self.store.list_templates(tenant_id, campaign_id).await?.is_empty()
        {
            return Err(EngineError::Validation(format!(
                "campaign {campaign_id} has no templates"
            )));
        }

        let now = Utc::now();
        let campaign = self
            .store
            .update_campaign_status(tenant_id, campaign_id, status, now)
            .await?;
        info!(campaign_id = %campaign_id, from = ?current.status, to = ?status, "Campaign status changed");

        if status == CampaignStatus::Archived {
            let mut closed = 0usize;
            let mut cancelled = 0usize;
            for sub in self.store.list_subscribers(tenant_id, campaign_id).await? {
                if !sub.status.is_open() {
                    continue;
                }
                self.store
                    .transition_subscriber(sub.id, SubscriberStatus::Completed, now)
                    .await?;
                cancelled += self.store.cancel_pending_items(sub.id, now).await?;
                closed += 1;
                self.event_sink.emit(
                    make_event(
                        EngineEventType::SubscriberCompleted,
                        tenant_id,
                        Some(campaign_id),
                        Some(sub.id),
                    )
                    .with_detail("campaign archived"),
                );
            }
            info!(
                campaign_id = %campaign_id,
                subscribers_closed = closed,
                cancelled_items = cancelled,
                "Campaign archived"
            );
        }
        Ok(campaign)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::directory::MemoryClientDirectory;
    use crate::enrollment::EnrollmentManager;
    use crate::sequencer::Sequencer;
    use crate::store::MemoryStore;
    use drip_core::types::{Client, EnrollmentSource, QueueStatus};
    use std::collections::{BTreeSet, HashMap};

    fn new_campaign(name: &str) -> NewCampaign {
        NewCampaign {
            name: name.into(),
            description: None,
            targeting: TargetingCriteria::default(),
            max_emails_per_campaign: 3,
        }
    }

    fn new_template(order: u32) -> NewTemplate {
        NewTemplate {
            name: format!("step {order}"),
            sequence_order: order,
            send_delay_days: 0,
            subject: "Hi {{first_name}}".into(),
            body_html: "<p>Hello</p>".into(),
            body_text: None,
        }
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let catalog = CampaignCatalog::new(Arc::new(MemoryStore::new()));
        let tenant = Uuid::new_v4();

        let err = catalog.create_campaign(tenant, new_campaign("  ")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let mut zero = new_campaign("Zero");
        zero.max_emails_per_campaign = 0;
        assert!(catalog.create_campaign(tenant, zero).await.is_err());

        let c = catalog.create_campaign(tenant, new_campaign("Welcome")).await.unwrap();
        assert_eq!(c.status, CampaignStatus::Draft);
        assert_eq!(catalog.list_campaigns(tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_activation_requires_templates() {
        let catalog = CampaignCatalog::new(Arc::new(MemoryStore::new()));
        let tenant = Uuid::new_v4();
        let c = catalog.create_campaign(tenant, new_campaign("Welcome")).await.unwrap();

        let err = catalog
            .set_status(tenant, c.id, CampaignStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        catalog.add_template(tenant, c.id, new_template(1)).await.unwrap();
        let active = catalog.set_status(tenant, c.id, CampaignStatus::Active).await.unwrap();
        assert_eq!(active.status, CampaignStatus::Active);

        let err = catalog
            .add_template(tenant, c.id, new_template(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_archived_is_terminal() {
        let catalog = CampaignCatalog::new(Arc::new(MemoryStore::new()));
        let tenant = Uuid::new_v4();
        let c = catalog.create_campaign(tenant, new_campaign("Old")).await.unwrap();

        catalog.set_status(tenant, c.id, CampaignStatus::Archived).await.unwrap();
        assert!(catalog.set_status(tenant, c.id, CampaignStatus::Active).await.is_err());
        assert!(catalog.add_template(tenant, c.id, new_template(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_archive_closes_subscribers() {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryClientDirectory::new());
        let catalog = CampaignCatalog::new(store.clone());
        let manager = EnrollmentManager::new(
            store.clone(),
            directory.clone(),
            Arc::new(Sequencer::new(store.clone())),
        );
        let tenant = Uuid::new_v4();
        let c = catalog.create_campaign(tenant, new_campaign("Spring")).await.unwrap();
        catalog.add_template(tenant, c.id, new_template(1)).await.unwrap();
        catalog.set_status(tenant, c.id, CampaignStatus::Active).await.unwrap();

        let client = Client {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            name: "Riley".into(),
            email: "riley@example.com".into(),
            life_stage: None,
            client_type: None,
            prior_services: BTreeSet::new(),
            attributes: HashMap::new(),
        };
        directory.upsert(client.clone());
        manager
            .enroll(tenant, c.id, client.id, EnrollmentSource::Manual)
            .await
            .unwrap();

        catalog.set_status(tenant, c.id, CampaignStatus::Archived).await.unwrap();

        let subs = store.list_subscribers(tenant, c.id).await.unwrap();
        assert_eq!(subs[0].status, SubscriberStatus::Completed);
        let items = store.list_queue_items(subs[0].id).await.unwrap();
        assert!(items.iter().all(|i| i.status == QueueStatus::Cancelled));
    }
}
