//! Read-only view of the CRM's client records.

use async_trait::async_trait;
use dashmap::DashMap;
use drip_core::error::EngineResult;
use drip_core::types::Client;
use uuid::Uuid;

#[async_trait]
pub trait ClientDirectory: Send + Sync {
    async fn get_client(&self, tenant_id: Uuid, client_id: Uuid) -> EngineResult<Option<Client>>;
    async fn list_clients(&self, tenant_id: Uuid) -> EngineResult<Vec<Client>>;
}

/// In-memory directory used by the dev binary and tests.
#[derive(Debug, Default)]
pub struct MemoryClientDirectory {
    clients: DashMap<Uuid, Client>,
}

impl MemoryClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, client: Client) {
        self.clients.insert(client.id, client);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[async_trait]
impl ClientDirectory for MemoryClientDirectory {
    async fn get_client(&self, tenant_id: Uuid, client_id: Uuid) -> EngineResult<Option<Client>> {
        Ok(self
            .clients
            .get(&client_id)
            .filter(|c| c.tenant_id == tenant_id)
            .map(|c| c.clone()))
    }

    async fn list_clients(&self, tenant_id: Uuid) -> EngineResult<Vec<Client>> {
        let mut clients: Vec<Client> = self
            .clients
            .iter()
            .filter(|r| r.value().tenant_id == tenant_id)
            .map(|r| r.value().clone())
            .collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clients)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};

    fn client(tenant: Uuid, name: &str) -> Client {
        Client {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            name: name.into(),
            email: format!("{}@example.com", name.to_lowercase()),
            life_stage: None,
            client_type: None,
            prior_services: BTreeSet::new(),
            attributes: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_lookup_is_tenant_scoped() {
        let dir = MemoryClientDirectory::new();
        let tenant = Uuid::new_v4();
        let c = client(tenant, "Avery");
        dir.upsert(c.clone());
        dir.upsert(client(Uuid::new_v4(), "Blake"));

        assert!(dir.get_client(tenant, c.id).await.unwrap().is_some());
        assert!(dir.get_client(Uuid::new_v4(), c.id).await.unwrap().is_none());
        assert_eq!(dir.list_clients(tenant).await.unwrap().len(), 1);
        assert_eq!(dir.len(), 2);
    }
}
