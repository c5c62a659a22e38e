//! Redis-backed rate-limit counters shared by every API instance.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use tracing::info;

use drip_core::config::RedisConfig;
use drip_core::error::{EngineError, EngineResult};
use drip_platform::rate_limit::{CounterStore, WindowCount};

/// INCR and set the expiry in one round trip. A key left without a TTL
/// (e.g. after a failover) gets one on the next hit.
const INCR_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: redis::Script,
    key_prefix: String,
}

impl RedisCounterStore {
    /// Connect to the first configured Redis node and verify it answers.
    pub async fn connect(config: &RedisConfig) -> EngineResult<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());
        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str()).map_err(storage)?;
        let timeout = StdDuration::from_millis(config.connect_timeout_ms);
        let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| EngineError::Storage(format!("redis connect timed out after {timeout:?}")))?
            .map_err(storage)?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            script: redis::Script::new(INCR_WINDOW_SCRIPT),
            key_prefix: config.key_prefix.clone(),
        })
    }

    pub fn key(&self, key: &str) -> String {
        prefixed(&self.key_prefix, key)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    /// Redis owns the clock here; `now` is ignored.
    async fn incr(&self, key: &str, window: Duration, _now: DateTime<Utc>) -> EngineResult<WindowCount> {
        let mut conn = self.conn.clone();
        let window_ms = window.num_milliseconds().max(1);
        let (count, ttl_ms): (u64, i64) = self
            .script
            .key(self.key(key))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;
        metrics::counter!("cache.redis.counter_incr").increment(1);
        Ok(WindowCount {
            count,
            reset_in: Duration::milliseconds(ttl_ms.max(0)),
        })
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

fn storage(e: redis::RedisError) -> EngineError {
    EngineError::Storage(format!("redis: {e}"))
}
