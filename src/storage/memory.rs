//! In-memory storage implementation
//!
//! Fast, non-persistent storage for development and testing. Uses
//! DashMap for lock-free concurrent access.
//!
//! **WARNING:** MemoryStore is NOT recommended for production use:
//! - Data is lost on process restart
//! - Does not coordinate state across multiple process instances
//!
//! For production deployments, use SqliteStore.

use super::*;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

/// In-memory storage implementation
#[derive(Clone, Default)]
pub struct MemoryStore {
    instances: Arc<DashMap<Uuid, InstanceCredentials>>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            instances: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn lookup_instance_credentials(
        &self,
        instance_id: Uuid,
        service_name: &str,
    ) -> Result<Option<InstanceCredentials>> {
        Ok(self
            .instances
            .get(&instance_id)
            .filter(|row| row.service_name == service_name)
            .map(|row| row.clone()))
    }

    async fn update_oauth_status(
        &self,
        instance_id: Uuid,
        update: &OAuthStatusUpdate,
    ) -> Result<()> {
        let mut row = self.instances.get_mut(&instance_id).ok_or_else(|| {
            crate::GatewayError::Storage(crate::error::StorageError::NotFound(
                instance_id.to_string(),
            ))
        })?;

        if let Some(status) = update.oauth_status {
            row.oauth_status = status;
        }
        if let Some(token) = &update.access_token {
            row.access_token = Some(token.clone());
        }
        if let Some(refresh) = &update.refresh_token {
            row.refresh_token = Some(refresh.clone());
        }
        if let Some(expires_at) = update.token_expires_at {
            row.token_expires_at = Some(expires_at);
        }
        if let Some(error) = &update.error {
            row.last_error = Some(error.clone());
        }
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn save_instance(&self, creds: &InstanceCredentials) -> Result<()> {
        creds.validate()?;
        self.instances.insert(creds.instance_id, creds.clone());
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceCredentials>> {
        let mut rows: Vec<InstanceCredentials> =
            self.instances.iter().map(|r| r.value().clone()).collect();
        rows.sort_unstable_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn delete_instance(&self, instance_id: Uuid) -> Result<()> {
        self.instances.remove(&instance_id);
        Ok(())
    }
}
