//! Drip Engine: campaign enrollment and email drip automation.
//!
//! Main entry point that wires storage, delivery and rate limiting and starts
//! the server.

mod demo;

use chrono::Utc;
use clap::Parser;
use drip_api::{ApiServer, AppState, EngineParts};
use drip_cache::{CachedClientDirectory, RedisCounterStore};
use drip_channels::{DryRunTransport, MailTransport, SendGridTransport};
use drip_core::config::{AppConfig, RateLimitBackend};
use drip_core::event_bus::noop_sink;
use drip_journey::{MemoryClientDirectory, MemoryStore};
use drip_platform::{CounterStore, LocalCounterStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CLIENT_CACHE_TTL_SECS: u64 = 300;
const CLIENT_CACHE_MAX_ENTRIES: usize = 100_000;

#[derive(Parser, Debug)]
#[command(name = "drip-engine")]
#[command(about = "Campaign enrollment and email drip automation engine")]
#[command(version)]
struct Cli {
    /// Optional TOML config file; environment variables still win
    #[arg(long, env = "DRIP_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "DRIP__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "DRIP__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Load a demo tenant with clients and an active campaign
    #[arg(long, default_value_t = false)]
    seed_demo: bool,

    /// Development only: run the queue processor locally on this interval
    /// instead of waiting for the HTTP trigger
    #[arg(long, env = "DRIP_PROCESS_INTERVAL_SECS")]
    process_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drip_engine=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Drip Engine starting up");

    let mut config = AppConfig::load(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    config.validate()?;

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        rate_limit_backend = ?config.rate_limit.backend,
        dry_run = config.mail.dry_run,
        "Configuration loaded"
    );

    // Rate-limit counters
    let local_counters = Arc::new(LocalCounterStore::new());
    let counters: Arc<dyn CounterStore> = match config.rate_limit.backend {
        RateLimitBackend::Redis => Arc::new(RedisCounterStore::connect(&config.redis).await?),
        RateLimitBackend::Local => {
            warn!("Using in-process rate-limit counters; limits are per node");
            local_counters.clone()
        }
    };

    // Mail delivery
    let transport: Arc<dyn MailTransport> = if config.mail.dry_run {
        warn!("Mail dry-run enabled, nothing will be delivered");
        Arc::new(DryRunTransport)
    } else {
        Arc::new(SendGridTransport::new(config.mail.clone())?)
    };

    // Client records and campaign storage
    let crm = Arc::new(MemoryClientDirectory::new());
    let directory = Arc::new(CachedClientDirectory::new(
        crm.clone(),
        CLIENT_CACHE_TTL_SECS,
        CLIENT_CACHE_MAX_ENTRIES,
    ));
    let store = Arc::new(MemoryStore::new());

    let state = AppState::new(
        &config,
        EngineParts {
            store,
            directory: directory.clone(),
            transport,
            counters,
            event_sink: noop_sink(),
        },
    )?;

    if cli.seed_demo {
        demo::seed(&state, &crm).await?;
    }

    let api_server = ApiServer::new(config.clone(), state.clone());

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // Spawn cache and counter maintenance task
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            directory.evict_expired();
            local_counters.purge_expired(Utc::now());
        }
    });

    if let Some(secs) = cli.process_interval_secs.filter(|s| *s > 0) {
        warn!(interval_secs = secs, "Local queue processing loop enabled");
        let processor = state.processor.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            loop {
                interval.tick().await;
                if let Err(e) = processor.run(Utc::now()).await {
                    error!(error = %e, "Scheduled queue run failed");
                }
            }
        });
    }

    info!("Drip Engine is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    info!("Drip Engine stopped");
    Ok(())
}
