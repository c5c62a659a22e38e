//! Shared handler state and operational endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use drip_channels::{EngagementTracker, MailTransport, ProcessorSettings, QueueProcessor};
use drip_core::config::AppConfig;
use drip_core::error::EngineResult;
use drip_core::event_bus::EventSink;
use drip_journey::{CampaignCatalog, CampaignStore, ClientDirectory, EnrollmentManager, Sequencer};
use drip_platform::{CounterStore, RateLimiter, TriggerAuth};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use utoipa::ToSchema;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CampaignCatalog>,
    pub enrollment: Arc<EnrollmentManager>,
    pub processor: Arc<QueueProcessor>,
    pub engagement: Arc<EngagementTracker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub trigger_auth: TriggerAuth,
    pub node_id: String,
    pub start_time: Instant,
}

/// Backends the engine services are wired onto.
pub struct EngineParts {
    pub store: Arc<dyn CampaignStore>,
    pub directory: Arc<dyn ClientDirectory>,
    pub transport: Arc<dyn MailTransport>,
    pub counters: Arc<dyn CounterStore>,
    pub event_sink: Arc<dyn EventSink>,
}

impl AppState {
    /// Wire every service onto `parts`. Fails when the trigger secret is
    /// missing.
    pub fn new(config: &AppConfig, parts: EngineParts) -> EngineResult<Self> {
        Self::with_settings(config, parts, ProcessorSettings::from_config(config))
    }

    pub fn with_settings(
        config: &AppConfig,
        parts: EngineParts,
        settings: ProcessorSettings,
    ) -> EngineResult<Self> {
        let EngineParts {
            store,
            directory,
            transport,
            counters,
            event_sink,
        } = parts;

        let trigger_auth = TriggerAuth::new(&config.queue.trigger_secret)?;
        let sequencer =
            Arc::new(Sequencer::new(store.clone()).with_event_sink(event_sink.clone()));
        let catalog = Arc::new(CampaignCatalog::new(store.clone()).with_event_sink(event_sink.clone()));
        let enrollment = Arc::new(
            EnrollmentManager::new(store.clone(), directory.clone(), sequencer.clone())
                .with_event_sink(event_sink.clone()),
        );
        let processor = Arc::new(
            QueueProcessor::new(store.clone(), directory, transport, sequencer, settings)
                .with_event_sink(event_sink.clone()),
        );
        let engagement = Arc::new(
            EngagementTracker::new(store, enrollment.clone()).with_event_sink(event_sink),
        );
        let rate_limiter = Arc::new(RateLimiter::new(counters, &config.rate_limit));

        Ok(Self {
            catalog,
            enrollment,
            processor,
            engagement,
            rate_limiter,
            trigger_auth,
            node_id: config.node_id.clone(),
            start_time: Instant::now(),
        })
    }
}

/// GET /health: Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        rate_limit_backend: state.rate_limiter.backend().to_string(),
    })
}

/// GET /ready: Readiness probe for Kubernetes.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses(
        (status = 200, description = "Ready to accept traffic"),
    )
)]
pub async fn readiness() -> StatusCode {
    // The router is only served once every service is wired.
    StatusCode::OK
}

/// GET /live: Liveness probe for Kubernetes.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses(
        (status = 200, description = "Process is alive"),
    )
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub rate_limit_backend: String,
}
