//! Demo data for local runs (`--seed-demo`).

use std::collections::{BTreeSet, HashMap};

use drip_api::AppState;
use drip_core::error::EngineResult;
use drip_core::types::{CampaignStatus, Client, TargetingCriteria};
use drip_journey::{MemoryClientDirectory, NewCampaign, NewTemplate};
use tracing::info;
use uuid::Uuid;

pub const DEMO_TENANT: Uuid = Uuid::from_u128(0x0d1e_5eed_0000_4000_8000_0000_0000_0001);

const CLIENTS: &[(&str, &str, &str, &str, &[&str])] = &[
    ("Priya Raman", "priya@example.com", "pre_retirement", "individual", &["retirement_planning"]),
    ("Tomasz Wolny", "tomasz@example.com", "young_professional", "individual", &[]),
    ("Ada Mensah", "ada@example.com", "retired", "couple", &["estate_planning", "tax"]),
];

/// Three clients and an active three-step onboarding campaign targeting
/// individuals. Returns the campaign id.
pub async fn seed(state: &AppState, crm: &MemoryClientDirectory) -> EngineResult<Uuid> {
    for (name, email, stage, kind, services) in CLIENTS {
        crm.upsert(Client {
            id: Uuid::new_v4(),
            tenant_id: DEMO_TENANT,
            name: (*name).to_string(),
            email: (*email).to_string(),
            life_stage: Some((*stage).to_string()),
            client_type: Some((*kind).to_string()),
            prior_services: services.iter().map(|s| (*s).to_string()).collect(),
            attributes: HashMap::new(),
        });
    }

    let campaign = state
        .catalog
        .create_campaign(
            DEMO_TENANT,
            NewCampaign {
                name: "New client onboarding".into(),
                description: Some("Welcome series for individual clients".into()),
                targeting: TargetingCriteria {
                    client_types: BTreeSet::from(["individual".to_string()]),
                    ..Default::default()
                },
                max_emails_per_campaign: 5,
            },
        )
        .await?;

    let steps = [
        (1, 0, "Welcome aboard, {{first_name}}", "<p>Hi {{first_name}}, thanks for choosing us.</p>"),
        (2, 2, "Your first planning session", "<p>{{first_name}}, here is what to bring to your first meeting.</p>"),
        (3, 5, "How are we doing?", "<p>Tell us about your experience so far. <a href=\"{{unsubscribe_url}}\">Unsubscribe</a></p>"),
    ];
    for (order, delay, subject, html) in steps {
        state
            .catalog
            .add_template(
                DEMO_TENANT,
                campaign.id,
                NewTemplate {
                    name: format!("Onboarding step {order}"),
                    sequence_order: order,
                    send_delay_days: delay,
                    subject: subject.into(),
                    body_html: html.into(),
                    body_text: None,
                },
            )
            .await?;
    }
    state
        .catalog
        .set_status(DEMO_TENANT, campaign.id, CampaignStatus::Active)
        .await?;

    let batch = state
        .enrollment
        .enroll_matching(DEMO_TENANT, campaign.id, None)
        .await?;
    info!(
        tenant_id = %DEMO_TENANT,
        campaign_id = %campaign.id,
        clients = crm.len(),
        enrolled = batch.enrolled,
        "Demo data seeded"
    );
    Ok(campaign.id)
}
