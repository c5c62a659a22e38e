//! OpenAPI specification and Swagger UI configuration.

use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Drip Engine API",
        version = "0.1.0",
        description = "Campaign enrollment and email drip automation.\n\nTargets clients into campaigns, schedules template sequences, delivers them through SendGrid and tracks engagement.",
        license(name = "MIT"),
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Campaigns", description = "Campaign, template and metrics management"),
        (name = "Enrollment", description = "Operator enrollment and subscriber lifecycle"),
        (name = "Queue", description = "Scheduled email delivery trigger"),
        (name = "Portal", description = "Rate-limited client portal actions"),
        (name = "Engagement", description = "Delivery and engagement event ingestion"),
        (name = "Operations", description = "Health, readiness, and liveness probes"),
    ),
    paths(
        // Campaigns
        crate::campaign_rest::handle_create_campaign,
        crate::campaign_rest::handle_list_campaigns,
        crate::campaign_rest::handle_get_campaign,
        crate::campaign_rest::handle_set_status,
        crate::campaign_rest::handle_add_template,
        crate::campaign_rest::handle_list_templates,
        crate::campaign_rest::handle_campaign_metrics,
        // Enrollment
        crate::campaign_rest::handle_enroll,
        crate::campaign_rest::handle_batch_enroll,
        crate::campaign_rest::handle_matching_campaigns,
        crate::campaign_rest::handle_unenroll,
        crate::campaign_rest::handle_pause,
        crate::campaign_rest::handle_resume,
        // Queue
        crate::queue_rest::handle_process_queue,
        // Portal and engagement
        crate::portal_rest::handle_portal_enroll,
        crate::portal_rest::handle_portal_unsubscribe,
        crate::portal_rest::handle_engagement_event,
        crate::portal_rest::handle_sendgrid_webhook,
        // Operations
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        // Domain types
        drip_core::types::Campaign,
        drip_core::types::CampaignStatus,
        drip_core::types::TargetingCriteria,
        drip_core::types::EmailTemplate,
        drip_core::types::Subscriber,
        drip_core::types::SubscriberStatus,
        drip_core::types::EnrollmentSource,
        drip_core::types::QueueItem,
        drip_core::types::QueueStatus,
        drip_core::types::EngagementEvent,
        drip_core::types::EmailHistory,
        drip_core::types::CampaignMetrics,
        // Service results
        drip_journey::NewCampaign,
        drip_journey::NewTemplate,
        drip_journey::EnrollOutcome,
        drip_journey::SequenceStep,
        drip_journey::BatchEnrollment,
        drip_channels::ProcessSummary,
        drip_channels::EngagementInput,
        drip_channels::SendGridEvent,
        drip_channels::WebhookSummary,
        // Request/response bodies
        crate::campaign_rest::StatusChange,
        crate::campaign_rest::EnrollRequest,
        crate::campaign_rest::BatchEnrollRequest,
        crate::portal_rest::PortalEnrollRequest,
        crate::portal_rest::EngagementResponse,
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
    ))
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "trigger_secret",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}
