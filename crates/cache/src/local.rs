//! In-process L1 cache in front of a [`ClientDirectory`].
//! Client records change rarely; caching them keeps queue runs from calling
//! the CRM once per email.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use drip_core::error::EngineResult;
use drip_core::types::Client;
use drip_journey::ClientDirectory;

struct CacheEntry {
    client: Client,
    inserted_at: Instant,
}

pub struct CachedClientDirectory {
    inner: Arc<dyn ClientDirectory>,
    store: DashMap<(Uuid, Uuid), CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl CachedClientDirectory {
    pub fn new(inner: Arc<dyn ClientDirectory>, ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            inner,
            store: DashMap::with_capacity(max_entries.min(4096)),
            ttl: Duration::from_secs(ttl_secs),
            max_entries,
        }
    }

    fn get_cached(&self, key: &(Uuid, Uuid)) -> Option<Client> {
        let entry = self.store.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        Some(entry.client.clone())
    }

    fn put(&self, client: Client) {
        let key = (client.tenant_id, client.id);
        // Over capacity: skip the insert and let eviction catch up.
        if self.store.len() >= self.max_entries && !self.store.contains_key(&key) {
            return;
        }
        self.store.insert(
            key,
            CacheEntry {
                client,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, tenant_id: Uuid, client_id: Uuid) {
        self.store.remove(&(tenant_id, client_id));
    }

    /// Remove expired entries. Call periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
        let evicted = before - self.store.len();
        if evicted > 0 {
            debug!(evicted, "Client cache eviction complete");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait]
impl ClientDirectory for CachedClientDirectory {
    async fn get_client(&self, tenant_id: Uuid, client_id: Uuid) -> EngineResult<Option<Client>> {
        if let Some(client) = self.get_cached(&(tenant_id, client_id)) {
            metrics::counter!("cache.l1.hit").increment(1);
            return Ok(Some(client));
        }
        metrics::counter!("cache.l1.miss").increment(1);

        let client = self.inner.get_client(tenant_id, client_id).await?;
        if let Some(c) = &client {
            self.put(c.clone());
        }
        Ok(client)
    }

    /// Always read through; the result refreshes the cache.
    async fn list_clients(&self, tenant_id: Uuid) -> EngineResult<Vec<Client>> {
        let clients = self.inner.list_clients(tenant_id).await?;
        for c in &clients {
            self.put(c.clone());
        }
        Ok(clients)
    }
}
