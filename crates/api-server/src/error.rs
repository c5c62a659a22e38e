//! HTTP mapping for engine errors.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use drip_core::error::EngineError;
use tracing::error;

use crate::rest::ErrorResponse;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Transport { .. } => StatusCode::BAD_GATEWAY,
        EngineError::Authorization(_) => StatusCode::UNAUTHORIZED,
        EngineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        EngineError::Render(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Storage(_) | EngineError::Config(_) | EngineError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let code = self.0.code();
        metrics::counter!("api.errors", "code" => code).increment(1);

        let message = if status.is_server_error() {
            error!(error = %self.0, "Request failed");
            "Internal processing error".to_string()
        } else {
            self.0.to_string()
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response();

        if let EngineError::RateLimited { retry_after_secs } = self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&EngineError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&EngineError::not_found("campaign", "1")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&EngineError::transport("down", true)), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&EngineError::Render("x".into())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(&EngineError::Storage("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError(EngineError::RateLimited { retry_after_secs: 42 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).map(|v| v.as_bytes()), Some(&b"42"[..]));
    }
}
