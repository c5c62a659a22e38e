//! Per-class rate limiting for the public routes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use drip_platform::{EndpointClass, RateLimiter};

use crate::error::ApiError;

pub const PORTAL_TOKEN_HEADER: &str = "x-portal-token";

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub class: EndpointClass,
}

/// Counts the request against the caller's portal token. Denied requests
/// never reach the handler.
pub async fn enforce_rate_limit(
    State(limit): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(PORTAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match limit
        .limiter
        .check_and_consume(limit.class, &token, Utc::now())
        .await
    {
        Ok(result) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(result.limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(result.remaining));
            headers.insert("x-ratelimit-reset", HeaderValue::from(result.reset_after_secs));
            response
        }
        Err(e) => ApiError(e).into_response(),
    }
}
