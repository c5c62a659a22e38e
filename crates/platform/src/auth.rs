//! Shared-secret authentication for the queue trigger endpoint.

use sha2::{Digest, Sha256};
use tracing::warn;

use drip_core::error::{EngineError, EngineResult};

/// Verifies `Authorization: Bearer <secret>` headers. Only the SHA-256
/// digest of the secret is held, and digests are compared in constant time.
#[derive(Clone)]
pub struct TriggerAuth {
    digest: [u8; 32],
}

impl std::fmt::Debug for TriggerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerAuth")
            .field("fingerprint", &hex::encode(&self.digest[..4]))
            .finish()
    }
}

impl TriggerAuth {
    pub fn new(secret: &str) -> EngineResult<Self> {
        if secret.trim().is_empty() {
            return Err(EngineError::Config("trigger secret must not be empty".into()));
        }
        Ok(Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        })
    }

    /// Check a raw `Authorization` header value.
    pub fn verify_header(&self, header: Option<&str>) -> EngineResult<()> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EngineError::Authorization("missing bearer token".into()))?;
        self.verify(token)
    }

    pub fn verify(&self, token: &str) -> EngineResult<()> {
        let presented: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        if constant_time_eq(&presented, &self.digest) {
            Ok(())
        } else {
            warn!("Queue trigger rejected: bad secret");
            metrics::counter!("auth.trigger_rejected").increment(1);
            Err(EngineError::Authorization("invalid trigger secret".into()))
        }
    }
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
