//! Operator endpoints: campaigns, templates, enrollments and metrics.
//! All paths are tenant-scoped under `/v1/tenants/:tenant_id`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use drip_core::types::{
    Campaign, CampaignMetrics, CampaignStatus, EmailTemplate, EnrollmentSource, Subscriber,
};
use drip_journey::{BatchEnrollment, EnrollOutcome, NewCampaign, NewTemplate};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::rest::{AppState, ErrorResponse};

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct StatusChange {
    pub status: CampaignStatus,
}

#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct EnrollRequest {
    pub client_id: Uuid,
    /// Defaults to `manual`.
    #[serde(default)]
    pub source: Option<EnrollmentSource>,
}

#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct BatchEnrollRequest {
    /// Omit to consider every client of the tenant.
    #[serde(default)]
    pub client_ids: Option<Vec<Uuid>>,
}

/// `201` for a new subscriber, `200` when the client was already enrolled.
pub(crate) fn enroll_response(outcome: EnrollOutcome) -> Response {
    let status = match outcome {
        EnrollOutcome::Enrolled { .. } => StatusCode::CREATED,
        EnrollOutcome::Conflict { .. } => StatusCode::OK,
    };
    (status, Json(outcome)).into_response()
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/campaigns",
    tag = "Campaigns",
    params(("tenant_id" = Uuid, Path, description = "Tenant")),
    request_body = NewCampaign,
    responses(
        (status = 201, description = "Campaign created in draft", body = Campaign),
        (status = 400, description = "Invalid campaign", body = ErrorResponse),
    )
)]
pub async fn handle_create_campaign(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<NewCampaign>,
) -> ApiResult<(StatusCode, Json<Campaign>)> {
    let campaign = state.catalog.create_campaign(tenant_id, req).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

#[utoipa::path(
    get,
    path = "/v1/tenants/{tenant_id}/campaigns",
    tag = "Campaigns",
    params(("tenant_id" = Uuid, Path, description = "Tenant")),
    responses(
        (status = 200, description = "Campaigns of the tenant", body = Vec<Campaign>),
    )
)]
pub async fn handle_list_campaigns(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Campaign>>> {
    Ok(Json(state.catalog.list_campaigns(tenant_id).await?))
}

#[utoipa::path(
    get,
    path = "/v1/tenants/{tenant_id}/campaigns/{campaign_id}",
    tag = "Campaigns",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("campaign_id" = Uuid, Path, description = "Campaign"),
    ),
    responses(
        (status = 200, description = "Campaign", body = Campaign),
        (status = 404, description = "Unknown campaign", body = ErrorResponse),
    )
)]
pub async fn handle_get_campaign(
    State(state): State<AppState>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Campaign>> {
    Ok(Json(state.catalog.get_campaign(tenant_id, campaign_id).await?))
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/campaigns/{campaign_id}/status",
    tag = "Campaigns",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("campaign_id" = Uuid, Path, description = "Campaign"),
    ),
    request_body = StatusChange,
    responses(
        (status = 200, description = "Status changed", body = Campaign),
        (status = 400, description = "Transition not allowed", body = ErrorResponse),
    )
)]
pub async fn handle_set_status(
    State(state): State<AppState>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<StatusChange>,
) -> ApiResult<Json<Campaign>> {
    let campaign = state
        .catalog
        .set_status(tenant_id, campaign_id, req.status)
        .await?;
    Ok(Json(campaign))
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/campaigns/{campaign_id}/templates",
    tag = "Campaigns",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("campaign_id" = Uuid, Path, description = "Campaign"),
    ),
    request_body = NewTemplate,
    responses(
        (status = 201, description = "Template added", body = EmailTemplate),
        (status = 409, description = "Sequence order already taken", body = ErrorResponse),
    )
)]
pub async fn handle_add_template(
    State(state): State<AppState>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<NewTemplate>,
) -> ApiResult<(StatusCode, Json<EmailTemplate>)> {
    let template = state
        .catalog
        .add_template(tenant_id, campaign_id, req)
        .await?;
    Ok((StatusCode::CREATED, Json(template)))
}

#[utoipa::path(
    get,
    path = "/v1/tenants/{tenant_id}/campaigns/{campaign_id}/templates",
    tag = "Campaigns",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("campaign_id" = Uuid, Path, description = "Campaign"),
    ),
    responses(
        (status = 200, description = "Templates in sequence order", body = Vec<EmailTemplate>),
    )
)]
pub async fn handle_list_templates(
    State(state): State<AppState>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<EmailTemplate>>> {
    Ok(Json(state.catalog.list_templates(tenant_id, campaign_id).await?))
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/campaigns/{campaign_id}/enrollments",
    tag = "Enrollment",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("campaign_id" = Uuid, Path, description = "Campaign"),
    ),
    request_body = EnrollRequest,
    responses(
        (status = 201, description = "Client enrolled", body = EnrollOutcome),
        (status = 200, description = "Client already enrolled", body = EnrollOutcome),
        (status = 404, description = "Unknown campaign or client", body = ErrorResponse),
    )
)]
pub async fn handle_enroll(
    State(state): State<AppState>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<EnrollRequest>,
) -> ApiResult<Response> {
    let source = req.source.unwrap_or(EnrollmentSource::Manual);
    let outcome = state
        .enrollment
        .enroll(tenant_id, campaign_id, req.client_id, source)
        .await?;
    Ok(enroll_response(outcome))
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/campaigns/{campaign_id}/enrollments/batch",
    tag = "Enrollment",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("campaign_id" = Uuid, Path, description = "Campaign"),
    ),
    request_body = BatchEnrollRequest,
    responses(
        (status = 200, description = "Batch result", body = BatchEnrollment),
    )
)]
pub async fn handle_batch_enroll(
    State(state): State<AppState>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<BatchEnrollRequest>,
) -> ApiResult<Json<BatchEnrollment>> {
    let result = state
        .enrollment
        .enroll_matching(tenant_id, campaign_id, req.client_ids)
        .await?;
    info!(
        campaign_id = %campaign_id,
        enrolled = result.enrolled,
        skipped = result.skipped,
        "Batch enrollment finished"
    );
    Ok(Json(result))
}

#[utoipa::path(
    get,
    path = "/v1/tenants/{tenant_id}/clients/{client_id}/matching-campaigns",
    tag = "Enrollment",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("client_id" = Uuid, Path, description = "Client"),
    ),
    responses(
        (status = 200, description = "Active campaigns the client qualifies for", body = Vec<Campaign>),
    )
)]
pub async fn handle_matching_campaigns(
    State(state): State<AppState>,
    Path((tenant_id, client_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<Campaign>>> {
    Ok(Json(
        state
            .enrollment
            .find_matching_campaigns(tenant_id, client_id)
            .await?,
    ))
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/subscribers/{subscriber_id}/unenroll",
    tag = "Enrollment",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("subscriber_id" = Uuid, Path, description = "Subscriber"),
    ),
    responses(
        (status = 200, description = "Subscriber unsubscribed", body = Subscriber),
    )
)]
pub async fn handle_unenroll(
    State(state): State<AppState>,
    Path((tenant_id, subscriber_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Subscriber>> {
    Ok(Json(state.enrollment.unenroll(tenant_id, subscriber_id).await?))
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/subscribers/{subscriber_id}/pause",
    tag = "Enrollment",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("subscriber_id" = Uuid, Path, description = "Subscriber"),
    ),
    responses(
        (status = 200, description = "Subscriber paused", body = Subscriber),
    )
)]
pub async fn handle_pause(
    State(state): State<AppState>,
    Path((tenant_id, subscriber_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Subscriber>> {
    Ok(Json(state.enrollment.pause(tenant_id, subscriber_id).await?))
}

#[utoipa::path(
    post,
    path = "/v1/tenants/{tenant_id}/subscribers/{subscriber_id}/resume",
    tag = "Enrollment",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("subscriber_id" = Uuid, Path, description = "Subscriber"),
    ),
    responses(
        (status = 200, description = "Subscriber active again", body = Subscriber),
    )
)]
pub async fn handle_resume(
    State(state): State<AppState>,
    Path((tenant_id, subscriber_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Subscriber>> {
    Ok(Json(state.enrollment.resume(tenant_id, subscriber_id).await?))
}

#[utoipa::path(
    get,
    path = "/v1/tenants/{tenant_id}/campaigns/{campaign_id}/metrics",
    tag = "Campaigns",
    params(
        ("tenant_id" = Uuid, Path, description = "Tenant"),
        ("campaign_id" = Uuid, Path, description = "Campaign"),
    ),
    responses(
        (status = 200, description = "Engagement rates", body = CampaignMetrics),
    )
)]
pub async fn handle_campaign_metrics(
    State(state): State<AppState>,
    Path((tenant_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<CampaignMetrics>> {
    Ok(Json(
        state
            .engagement
            .compute_metrics(tenant_id, campaign_id)
            .await?,
    ))
}
