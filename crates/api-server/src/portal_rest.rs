//! Public endpoints: client-portal enrollment and unsubscribe, engagement
//! events and the SendGrid event webhook.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use drip_channels::{EngagementInput, SendGridEvent, WebhookSummary};
use drip_core::types::{EngagementEvent, EnrollmentSource, Subscriber};
use drip_journey::EnrollOutcome;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::campaign_rest::enroll_response;
use crate::error::ApiResult;
use crate::rest::{AppState, ErrorResponse};

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct PortalEnrollRequest {
    pub client_id: Uuid,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct EngagementResponse {
    pub event: EngagementEvent,
    /// `false` when the event had already been recorded.
    pub recorded: bool,
}

#[utoipa::path(
    post,
    path = "/v1/portal/tenants/{tenant_id}/campaigns/{campaign_id}/enroll",
    tag = "Portal",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("campaign_id" = Uuid, Path, description = "Campaign"),
        ("X-Portal-Token" = String, Header, description = "Portal session token"),
    ),
    request_body = PortalEnrollRequest,
    responses(
        (status = 201, description = "Client enrolled", body = EnrollOutcome),
        (status = 200, description = "Client already enrolled", body = EnrollOutcome),
        (status = 429, description = "Too many requests", body = ErrorResponse),
    )
)]
pub async fn handle_portal_enroll(
    State(state): State<AppState>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<PortalEnrollRequest>,
) -> ApiResult<Response> {
    let outcome = state
        .enrollment
        .enroll(tenant_id, campaign_id, req.client_id, EnrollmentSource::Portal)
        .await?;
    Ok(enroll_response(outcome))
}

#[utoipa::path(
    post,
    path = "/v1/portal/tenants/{tenant_id}/subscribers/{subscriber_id}/unsubscribe",
    tag = "Portal",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("subscriber_id" = Uuid, Path, description = "Subscriber"),
        ("X-Portal-Token" = String, Header, description = "Portal session token"),
    ),
    responses(
        (status = 200, description = "Unsubscribed", body = Subscriber),
        (status = 429, description = "Too many requests", body = ErrorResponse),
    )
)]
pub async fn handle_portal_unsubscribe(
    State(state): State<AppState>,
    Path((tenant_id, subscriber_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Subscriber>> {
    let subscriber = state.enrollment.unenroll(tenant_id, subscriber_id).await?;
    info!(subscriber_id = %subscriber_id, "Portal unsubscribe");
    Ok(Json(subscriber))
}

#[utoipa::path(
    post,
    path = "/v1/engagement/events",
    tag = "Engagement",
    params(("X-Portal-Token" = String, Header, description = "Portal session token")),
    request_body = EngagementInput,
    responses(
        (status = 200, description = "Event accepted", body = EngagementResponse),
        (status = 404, description = "Unknown email history", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse),
    )
)]
pub async fn handle_engagement_event(
    State(state): State<AppState>,
    Json(input): Json<EngagementInput>,
) -> ApiResult<Json<EngagementResponse>> {
    let at = input.timestamp.unwrap_or_else(Utc::now);
    let write = state
        .engagement
        .ingest(input.event, input.email_history_id, at)
        .await?;
    Ok(Json(EngagementResponse {
        event: input.event,
        recorded: write.recorded,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/webhooks/sendgrid",
    tag = "Engagement",
    request_body = Vec<SendGridEvent>,
    responses(
        (status = 200, description = "Webhook batch processed", body = WebhookSummary),
    )
)]
pub async fn handle_sendgrid_webhook(
    State(state): State<AppState>,
    Json(events): Json<Vec<SendGridEvent>>,
) -> Json<WebhookSummary> {
    let summary = state.engagement.ingest_sendgrid(&events).await;
    if summary.errors > 0 {
        warn!(errors = summary.errors, total = events.len(), "SendGrid webhook had failures");
    }
    Json(summary)
}
