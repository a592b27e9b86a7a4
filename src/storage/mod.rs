//! Storage backends for Portico
//!
//! The backing store is the system of record for instances and their
//! persisted OAuth state. The in-memory credential cache is layered on
//! top as a performance optimization; on any disagreement the store wins.

pub mod memory;
pub mod sqlite;

use crate::Result;
use crate::model::{InstanceCredentials, OAuthStatusUpdate};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Accessor trait over the relational system of record
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch one instance row, scoped to the named service.
    /// Returns `None` when the instance does not exist or belongs to a
    /// different service.
    async fn lookup_instance_credentials(
        &self,
        instance_id: Uuid,
        service_name: &str,
    ) -> Result<Option<InstanceCredentials>>;

    /// Persist a refresh outcome: new tokens and/or a status flip.
    /// Fields left `None` in the update are untouched.
    async fn update_oauth_status(
        &self,
        instance_id: Uuid,
        update: &OAuthStatusUpdate,
    ) -> Result<()>;

    /// Insert or fully replace an instance row
    async fn save_instance(&self, creds: &InstanceCredentials) -> Result<()>;

    /// List all instance rows (watcher priming, admin tooling)
    async fn list_instances(&self) -> Result<Vec<InstanceCredentials>>;

    /// Delete an instance row
    async fn delete_instance(&self, instance_id: Uuid) -> Result<()>;
}

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Create a storage backend from configuration
pub async fn create_store_from_config(
    config: &crate::config::StorageConfig,
) -> Result<Arc<dyn CredentialStore>> {
    match config.driver.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "sqlite" => Ok(Arc::new(SqliteStore::new(&config.dsn).await?)),
        _ => Err(crate::GatewayError::config(format!(
            "Unknown storage driver: {}. Supported: memory, sqlite",
            config.driver
        ))),
    }
}
