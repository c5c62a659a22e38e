use crate::error::{EngineError, EngineResult};
use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DRIP__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Base URL used to build unsubscribe links in outgoing mail.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Shared secret for `POST /v1/queue/process`. Required.
    #[serde(default)]
    pub trigger_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_mail_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_mail_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub open_tracking: bool,
    #[serde(default = "default_true")]
    pub click_tracking: bool,
    /// Log messages instead of delivering them.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBackend {
    Local,
    Redis,
}

/// `(limit, window)` for one endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_rate_limit_backend")]
    pub backend: RateLimitBackend,
    #[serde(default = "default_enrollment_rule")]
    pub enrollment: RateLimitRule,
    #[serde(default = "default_unsubscribe_rule")]
    pub unsubscribe: RateLimitRule,
    #[serde(default = "default_engagement_rule")]
    pub engagement: RateLimitRule,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_key_prefix() -> String {
    "drip".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_batch_size() -> usize {
    50
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_secs() -> u64 {
    300
}
fn default_mail_endpoint() -> String {
    "https://api.sendgrid.com/v3/mail/send".to_string()
}
fn default_from_email() -> String {
    "hello@example.com".to_string()
}
fn default_from_name() -> String {
    "Service Team".to_string()
}
fn default_mail_timeout_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_rate_limit_backend() -> RateLimitBackend {
    RateLimitBackend::Redis
}
fn default_enrollment_rule() -> RateLimitRule {
    RateLimitRule { limit: 5, window_secs: 3600 }
}
fn default_unsubscribe_rule() -> RateLimitRule {
    RateLimitRule { limit: 10, window_secs: 3600 }
}
fn default_engagement_rule() -> RateLimitRule {
    RateLimitRule { limit: 120, window_secs: 60 }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            public_base_url: default_public_base_url(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            trigger_secret: String::new(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: default_mail_endpoint(),
            from_email: default_from_email(),
            from_name: default_from_name(),
            timeout_ms: default_mail_timeout_ms(),
            open_tracking: true,
            click_tracking: true,
            dry_run: false,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            backend: default_rate_limit_backend(),
            enrollment: default_enrollment_rule(),
            unsubscribe: default_unsubscribe_rule(),
            engagement: default_engagement_rule(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            redis: RedisConfig::default(),
            queue: QueueConfig::default(),
            mail: MailConfig::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file overlaid with
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("DRIP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("redis.urls"),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject configurations the engine cannot run safely with. The queue
    /// trigger secret is mandatory: there is no open-access mode.
    pub fn validate(&self) -> EngineResult<()> {
        if self.queue.trigger_secret.trim().is_empty() {
            return Err(EngineError::Config(
                "queue.trigger_secret must be set (DRIP__QUEUE__TRIGGER_SECRET)".to_string(),
            ));
        }
        if self.queue.batch_size == 0 {
            return Err(EngineError::Config("queue.batch_size must be > 0".to_string()));
        }
        if self.queue.max_attempts == 0 {
            return Err(EngineError::Config("queue.max_attempts must be > 0".to_string()));
        }
        if !self.mail.dry_run && self.mail.api_key.trim().is_empty() {
            return Err(EngineError::Config(
                "mail.api_key must be set unless mail.dry_run is enabled".to_string(),
            ));
        }
        for (class, rule) in [
            ("enrollment", self.rate_limit.enrollment),
            ("unsubscribe", self.rate_limit.unsubscribe),
            ("engagement", self.rate_limit.engagement),
        ] {
            if rule.limit == 0 || rule.window_secs == 0 {
                return Err(EngineError::Config(format!(
                    "rate_limit.{class} needs a non-zero limit and window"
                )));
            }
        }
        if self.rate_limit.backend == RateLimitBackend::Redis && self.redis.urls.is_empty() {
            return Err(EngineError::Config(
                "redis.urls must not be empty with the redis rate-limit backend".to_string(),
            ));
        }
        Ok(())
    }
}
