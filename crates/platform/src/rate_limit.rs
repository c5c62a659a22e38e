//! Fixed-window rate limiter for the public trigger endpoints.
//!
//! Counters sit behind [`CounterStore`] so several API instances can share
//! them (Redis, see the cache crate). [`LocalCounterStore`] keeps them in a
//! DashMap for single-node and test deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use drip_core::config::{RateLimitRule, RateLimitSettings};
use drip_core::error::{EngineError, EngineResult};

/// Groups of public endpoints that share a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Enrollment,
    Unsubscribe,
    Engagement,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Enrollment => "enrollment",
            EndpointClass::Unsubscribe => "unsubscribe",
            EndpointClass::Engagement => "engagement",
        }
    }

    /// Enrollment creates records, so it is refused while counters are
    /// unreachable. Opt-outs and engagement stay open.
    pub fn fails_closed(&self) -> bool {
        matches!(self, EndpointClass::Enrollment)
    }
}

/// Retry hint returned when a fail-closed class cannot reach its counters.
const STORE_DOWN_RETRY_SECS: u64 = 30;

/// Counter state after one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    /// Time until the window resets.
    pub reset_in: Duration,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Increment `key`, opening a fresh window of length `window` when none
    /// is live.
    async fn incr(&self, key: &str, window: Duration, now: DateTime<Utc>) -> EngineResult<WindowCount>;
}

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// In-process counters.
#[derive(Debug, Default)]
pub struct LocalCounterStore {
    windows: DashMap<String, LocalWindow>,
}

impl LocalCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired windows. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| w.expires_at > now);
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn incr(&self, key: &str, window: Duration, now: DateTime<Utc>) -> EngineResult<WindowCount> {
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert(LocalWindow {
                count: 0,
                expires_at: now + window,
            });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;
        Ok(WindowCount {
            count: entry.count,
            reset_in: entry.expires_at - now,
        })
    }
}

/// An allowed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after_secs: u64,
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    rules: HashMap<EndpointClass, RateLimitRule>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, settings: &RateLimitSettings) -> Self {
        let rules = HashMap::from([
            (EndpointClass::Enrollment, settings.enrollment),
            (EndpointClass::Unsubscribe, settings.unsubscribe),
            (EndpointClass::Engagement, settings.engagement),
        ]);
        Self { store, rules }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn rule(&self, class: EndpointClass) -> Option<RateLimitRule> {
        self.rules.get(&class).copied()
    }

    /// Count one request for `token` and decide whether it may proceed.
    /// Denial is [`EngineError::RateLimited`] carrying the seconds until the
    /// window resets. A counter-store failure denies classes that
    /// [fail closed](EndpointClass::fails_closed) and lets the rest through.
    pub async fn check_and_consume(
        &self,
        class: EndpointClass,
        token: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<RateLimitResult> {
        let Some(rule) = self.rule(class) else {
            return Err(EngineError::Config(format!(
                "no rate-limit rule for {}",
                class.as_str()
            )));
        };
        if token.trim().is_empty() {
            return Err(EngineError::Authorization("missing portal token".into()));
        }

        let window = Duration::seconds(rule.window_secs as i64);
        let key = counter_key(class, token);
        let state = match self.store.incr(&key, window, now).await {
            Ok(state) => state,
            Err(e) => {
                metrics::counter!("rate_limit.store_errors", "class" => class.as_str()).increment(1);
                if class.fails_closed() {
                    warn!(class = class.as_str(), backend = self.backend(), error = %e, "Rate-limit store unavailable, denying request");
                    return Err(EngineError::RateLimited {
                        retry_after_secs: STORE_DOWN_RETRY_SECS,
                    });
                }
                warn!(class = class.as_str(), backend = self.backend(), error = %e, "Rate-limit store unavailable, allowing request");
                return Ok(RateLimitResult {
                    limit: rule.limit,
                    remaining: rule.limit,
                    reset_after_secs: rule.window_secs,
                });
            }
        };

        let reset_after_secs = ceil_secs(state.reset_in);
        // Allowed only while the count before this request was below the limit.
        if state.count > u64::from(rule.limit) {
            debug!(class = class.as_str(), count = state.count, "Rate limit exceeded");
            metrics::counter!("rate_limit.denied", "class" => class.as_str()).increment(1);
            return Err(EngineError::RateLimited {
                retry_after_secs: reset_after_secs,
            });
        }

        metrics::counter!("rate_limit.allowed", "class" => class.as_str()).increment(1);
        Ok(RateLimitResult {
            limit: rule.limit,
            remaining: rule.limit.saturating_sub(state.count as u32),
            reset_after_secs,
        })
    }
}

/// Tokens are hashed so raw portal tokens never reach the counter store.
pub fn counter_key(class: EndpointClass, token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("rl:{}:{}", class.as_str(), hex::encode(&digest[..16]))
}

fn ceil_secs(d: Duration) -> u64 {
    let ms = d.num_milliseconds().max(0) as u64;
    ms.div_ceil(1000).max(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limiter() -> (Arc<LocalCounterStore>, RateLimiter) {
        let store = Arc::new(LocalCounterStore::new());
        let limiter = RateLimiter::new(store.clone(), &RateLimitSettings::default());
        (store, limiter)
    }

    #[tokio::test]
    async fn test_sixth_request_in_hour_denied() {
        let (_, limiter) = limiter();
        let now = Utc::now();

        for i in 0..5 {
            let r = limiter
                .check_and_consume(EndpointClass::Enrollment, "portal-abc", now + Duration::minutes(i))
                .await
                .unwrap();
            assert_eq!(r.remaining, 4 - i as u32);
        }
        let err = limiter
            .check_and_consume(EndpointClass::Enrollment, "portal-abc", now + Duration::minutes(10))
            .await
            .unwrap_err();
        match err {
            EngineError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 50 * 60),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_window_expiry_restarts_counter() {
        let (_, limiter) = limiter();
        let now = Utc::now();
        for _ in 0..6 {
            let _ = limiter
                .check_and_consume(EndpointClass::Enrollment, "portal-abc", now)
                .await;
        }

        let later = now + Duration::seconds(3600);
        let r = limiter
            .check_and_consume(EndpointClass::Enrollment, "portal-abc", later)
            .await
            .unwrap();
        assert_eq!(r.remaining, 4);
    }

    #[tokio::test]
    async fn test_tokens_and_classes_are_independent() {
        let (_, limiter) = limiter();
        let now = Utc::now();
        for _ in 0..5 {
            limiter
                .check_and_consume(EndpointClass::Enrollment, "a", now)
                .await
                .unwrap();
        }
        assert!(limiter
            .check_and_consume(EndpointClass::Enrollment, "b", now)
            .await
            .is_ok());
        assert!(limiter
            .check_and_consume(EndpointClass::Unsubscribe, "a", now)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_empty_token_rejected() {
        let (_, limiter) = limiter();
        let err = limiter
            .check_and_consume(EndpointClass::Engagement, " ", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Authorization(_)));
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        fn backend(&self) -> &'static str {
            "broken"
        }

        async fn incr(&self, _: &str, _: Duration, _: DateTime<Utc>) -> EngineResult<WindowCount> {
            Err(EngineError::Storage("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_denies_enrollment_only() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), &RateLimitSettings::default());
        for _ in 0..10 {
            for class in [EndpointClass::Unsubscribe, EndpointClass::Engagement] {
                assert!(limiter.check_and_consume(class, "t", Utc::now()).await.is_ok());
            }
        }
        let err = limiter
            .check_and_consume(EndpointClass::Enrollment, "t", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::RateLimited {
                retry_after_secs: STORE_DOWN_RETRY_SECS
            }
        ));
    }

    #[test]
    fn test_purge_expired() {
        let store = LocalCounterStore::new();
        let now = Utc::now();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            store.incr("short", Duration::seconds(1), now).await.unwrap();
            store.incr("long", Duration::seconds(60), now).await.unwrap();
        });
        assert_eq!(store.purge_expired(now + Duration::seconds(5)), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_counter_key_hides_token() {
        let key = counter_key(EndpointClass::Engagement, "secret-token");
        assert!(key.starts_with("rl:engagement:"));
        assert!(!key.contains("secret-token"));
        assert_eq!(key, counter_key(EndpointClass::Engagement, "secret-token"));
    }
}
