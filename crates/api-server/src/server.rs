//! API server: HTTP router, middleware stack and the metrics exporter.

use crate::campaign_rest as campaign;
use crate::middleware::{enforce_rate_limit, RateLimitState};
use crate::portal_rest as portal;
use crate::queue_rest;
use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use drip_core::config::AppConfig;
use drip_platform::EndpointClass;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Build the full router. Public portal and engagement routes each carry
/// their own rate-limit class.
pub fn router(state: AppState) -> Router {
    let limited = |class: EndpointClass| {
        from_fn_with_state(
            RateLimitState {
                limiter: state.rate_limiter.clone(),
                class,
            },
            enforce_rate_limit,
        )
    };

    let portal_enroll = Router::new()
        .route(
            "/v1/portal/tenants/:tenant_id/campaigns/:campaign_id/enroll",
            post(portal::handle_portal_enroll),
        )
        .route_layer(limited(EndpointClass::Enrollment));
    let portal_unsubscribe = Router::new()
        .route(
            "/v1/portal/tenants/:tenant_id/subscribers/:subscriber_id/unsubscribe",
            post(portal::handle_portal_unsubscribe),
        )
        .route_layer(limited(EndpointClass::Unsubscribe));
    let engagement = Router::new()
        .route("/v1/engagement/events", post(portal::handle_engagement_event))
        .route_layer(limited(EndpointClass::Engagement));

    Router::new()
        // Campaign management
        .route(
            "/v1/tenants/:tenant_id/campaigns",
            post(campaign::handle_create_campaign).get(campaign::handle_list_campaigns),
        )
        .route(
            "/v1/tenants/:tenant_id/campaigns/:campaign_id",
            get(campaign::handle_get_campaign),
        )
        .route(
            "/v1/tenants/:tenant_id/campaigns/:campaign_id/status",
            post(campaign::handle_set_status),
        )
        .route(
            "/v1/tenants/:tenant_id/campaigns/:campaign_id/templates",
            post(campaign::handle_add_template).get(campaign::handle_list_templates),
        )
        .route(
            "/v1/tenants/:tenant_id/campaigns/:campaign_id/metrics",
            get(campaign::handle_campaign_metrics),
        )
        // Enrollment
        .route(
            "/v1/tenants/:tenant_id/campaigns/:campaign_id/enrollments",
            post(campaign::handle_enroll),
        )
        .route(
            "/v1/tenants/:tenant_id/campaigns/:campaign_id/enrollments/batch",
            post(campaign::handle_batch_enroll),
        )
        .route(
            "/v1/tenants/:tenant_id/clients/:client_id/matching-campaigns",
            get(campaign::handle_matching_campaigns),
        )
        .route(
            "/v1/tenants/:tenant_id/subscribers/:subscriber_id/unenroll",
            post(campaign::handle_unenroll),
        )
        .route(
            "/v1/tenants/:tenant_id/subscribers/:subscriber_id/pause",
            post(campaign::handle_pause),
        )
        .route(
            "/v1/tenants/:tenant_id/subscribers/:subscriber_id/resume",
            post(campaign::handle_resume),
        )
        // Queue trigger
        .route("/v1/queue/process", post(queue_rest::handle_process_queue))
        // Public
        .merge(portal_enroll)
        .merge(portal_unsubscribe)
        .merge(engagement)
        .route("/v1/webhooks/sendgrid", post(portal::handle_sendgrid_webhook))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main API server.
pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Start the HTTP REST server. Returns after Ctrl-C.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown signal received");
            })
            .await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // Keep the handle alive
        std::mem::forget(handle);
        Ok(())
    }
}
