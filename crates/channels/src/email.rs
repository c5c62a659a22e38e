//! Outbound email delivery.
//!
//! [`MailTransport`] is the seam between the queue processor and the mail
//! provider. [`SendGridTransport`] posts to the SendGrid v3 API; the dry-run
//! and recording transports serve local runs and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use drip_core::config::MailConfig;
use drip_core::error::{EngineError, EngineResult};

/// A fully rendered message ready for the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    /// Echoed back by the provider on webhook events.
    pub custom_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hand one message to the provider. Failures are
    /// [`EngineError::Transport`] with `retryable` set for throttling,
    /// timeouts and provider-side errors.
    async fn send(&self, email: &OutboundEmail) -> EngineResult<DeliveryReceipt>;
}

// ─── SendGrid ───────────────────────────────────────────────────────────────

pub struct SendGridTransport {
    client: reqwest::Client,
    config: MailConfig,
}

impl SendGridTransport {
    pub fn new(config: MailConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EngineError::Config(format!("mail client: {e}")))?;
        info!(
            from = %config.from_email,
            endpoint = %config.endpoint,
            open_tracking = config.open_tracking,
            click_tracking = config.click_tracking,
            "SendGrid transport initialized"
        );
        Ok(Self { client, config })
    }

    /// Request body for `POST /v3/mail/send`.
    pub fn payload(&self, email: &OutboundEmail) -> serde_json::Value {
        let mut to = serde_json::json!({ "email": email.to_email });
        if let Some(name) = &email.to_name {
            to["name"] = serde_json::Value::String(name.clone());
        }

        let mut content = Vec::with_capacity(2);
        if let Some(text) = &email.text {
            content.push(serde_json::json!({ "type": "text/plain", "value": text }));
        }
        content.push(serde_json::json!({ "type": "text/html", "value": email.html }));

        serde_json::json!({
            "personalizations": [{
                "to": [to],
                "custom_args": email.custom_args,
            }],
            "from": {
                "email": self.config.from_email,
                "name": self.config.from_name,
            },
            "subject": email.subject,
            "content": content,
            "tracking_settings": {
                "click_tracking": { "enable": self.config.click_tracking },
                "open_tracking": { "enable": self.config.open_tracking },
            },
        })
    }
}

#[async_trait]
impl MailTransport for SendGridTransport {
    fn name(&self) -> &'static str {
        "sendgrid"
    }

    async fn send(&self, email: &OutboundEmail) -> EngineResult<DeliveryReceipt> {
        let start = std::time::Instant::now();
        debug!(to = %email.to_email, subject = %email.subject, "Sending email via SendGrid");

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&self.payload(email))
            .send()
            .await
            .map_err(|e| EngineError::transport(format!("sendgrid request failed: {e}"), true))?;

        let status = response.status();
        metrics::histogram!("mail.send_latency_ms").record(start.elapsed().as_millis() as f64);

        if status.is_success() {
            let provider_message_id = response
                .headers()
                .get("x-message-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            return Ok(DeliveryReceipt {
                provider_message_id,
                accepted_at: Utc::now(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let retryable = status.as_u16() == 429 || status.is_server_error();
        warn!(status = status.as_u16(), retryable, "SendGrid rejected message");
        Err(EngineError::transport(
            format!("sendgrid returned {status}: {}", truncate(&body, 200)),
            retryable,
        ))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ─── Dry run ────────────────────────────────────────────────────────────────

/// Accepts every message without contacting a provider.
#[derive(Debug, Default)]
pub struct DryRunTransport;

#[async_trait]
impl MailTransport for DryRunTransport {
    fn name(&self) -> &'static str {
        "dry_run"
    }

    async fn send(&self, email: &OutboundEmail) -> EngineResult<DeliveryReceipt> {
        info!(to = %email.to_email, subject = %email.subject, "Dry-run email accepted");
        Ok(DeliveryReceipt {
            provider_message_id: Some(format!("dry-run-{}", Uuid::new_v4())),
            accepted_at: Utc::now(),
        })
    }
}

// ─── Recording ──────────────────────────────────────────────────────────────

/// Keeps every accepted message in memory. Can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundEmail>>,
    failures_remaining: AtomicU32,
    fail_always: AtomicBool,
    retryable: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            retryable: AtomicBool::new(true),
            ..Default::default()
        }
    }

    /// Fail the next `n` sends with a retryable error.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every send until cleared.
    pub fn fail_always(&self, enabled: bool, retryable: bool) {
        self.fail_always.store(enabled, Ordering::SeqCst);
        self.retryable.store(retryable, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn take_failure(&self) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, email: &OutboundEmail) -> EngineResult<DeliveryReceipt> {
        if self.take_failure() {
            return Err(EngineError::transport(
                "simulated provider outage",
                self.retryable.load(Ordering::SeqCst),
            ));
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(email.clone());
        Ok(DeliveryReceipt {
            provider_message_id: Some(format!("rec-{}", Uuid::new_v4())),
            accepted_at: Utc::now(),
        })
    }
}
