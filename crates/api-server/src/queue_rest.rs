//! Queue trigger, called by an external scheduler.

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use chrono::Utc;
use drip_channels::ProcessSummary;
use tracing::info;

use crate::error::ApiResult;
use crate::rest::{AppState, ErrorResponse};

#[utoipa::path(
    post,
    path = "/v1/queue/process",
    tag = "Queue",
    security(("trigger_secret" = [])),
    responses(
        (status = 200, description = "Run summary", body = ProcessSummary),
        (status = 401, description = "Missing or wrong trigger secret", body = ErrorResponse),
    )
)]
pub async fn handle_process_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ProcessSummary>> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state.trigger_auth.verify_header(auth)?;

    let summary = state.processor.run(Utc::now()).await?;
    info!(
        node_id = %state.node_id,
        processed = summary.processed,
        sent = summary.sent,
        "Queue trigger handled"
    );
    Ok(Json(summary))
}
