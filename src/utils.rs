//! Test support utilities
//!
//! An isolated gateway environment for integration tests: its own
//! engine, an in-memory or temp-dir SQLite store, and helpers for
//! seeding instances. Temporary files are cleaned up on drop.

use crate::config::{Config, StorageConfig};
use crate::engine::Engine;
use crate::model::{
    CacheEntry, InstanceCredentials, InstanceStatus, OAuthStatus, TokenData,
};
use crate::sessions::{HandlerFactory, null_factory};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Self-contained gateway environment for tests
pub struct TestEnvironment {
    /// Keeps the temp dir alive for the test's duration
    _temp_dir: TempDir,

    pub config: Config,
    pub engine: Arc<Engine>,
}

impl TestEnvironment {
    /// Memory-backed engine with a factory that never builds handlers
    pub async fn new() -> Self {
        Self::with_factory(null_factory()).await
    }

    /// Memory-backed engine with a caller-supplied handler factory
    pub async fn with_factory(factory: HandlerFactory) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let config = Config {
            storage: StorageConfig {
                driver: "memory".to_string(),
                dsn: String::new(),
            },
            ..Config::default()
        };
        let engine = Arc::new(
            Engine::new(config.clone(), factory)
                .await
                .expect("failed to build engine"),
        );
        Self {
            _temp_dir: temp_dir,
            config,
            engine,
        }
    }

    /// SQLite-backed engine with the database in a temp directory
    pub async fn with_sqlite() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let db_path = temp_dir.path().join("portico.db");
        let config = Config {
            storage: StorageConfig {
                driver: "sqlite".to_string(),
                dsn: db_path.to_str().expect("utf-8 temp path").to_string(),
            },
            ..Config::default()
        };
        let engine = Arc::new(
            Engine::new(config.clone(), null_factory())
                .await
                .expect("failed to build engine"),
        );
        Self {
            _temp_dir: temp_dir,
            config,
            engine,
        }
    }

    /// Persist an instance row; does not touch the cache
    pub async fn seed_instance(&self, service: &str, expires_in_secs: i64) -> Uuid {
        let creds = test_credentials(service, expires_in_secs);
        let id = creds.instance_id;
        self.engine
            .store()
            .save_instance(&creds)
            .await
            .expect("failed to seed instance");
        id
    }

    /// Persist an instance row and prime the cache with its token
    pub async fn seed_cached_instance(&self, service: &str, expires_in_secs: i64) -> Uuid {
        let id = self.seed_instance(service, expires_in_secs).await;
        let creds = self
            .engine
            .store()
            .lookup_instance_credentials(id, service)
            .await
            .expect("lookup failed")
            .expect("just-seeded instance missing");
        let entry = CacheEntry::from_credentials(
            &creds,
            TokenData {
                bearer_token: creds.access_token.clone().unwrap_or_default(),
                refresh_token: creds.refresh_token.clone(),
                expires_at: Utc::now() + Duration::seconds(expires_in_secs),
            },
        );
        self.engine.set_cached_credential(entry);
        id
    }
}

/// A plausible active instance row for tests
pub fn test_credentials(service: &str, expires_in_secs: i64) -> InstanceCredentials {
    let now = Utc::now();
    InstanceCredentials {
        instance_id: Uuid::new_v4(),
        user_id: "user-1".to_string(),
        team_id: None,
        service_name: service.to_string(),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        token_url: "https://example.com/token".to_string(),
        auth_url: None,
        access_token: Some("seed-access-token".to_string()),
        refresh_token: Some("seed-refresh-token".to_string()),
        token_expires_at: Some(now + Duration::seconds(expires_in_secs)),
        status: InstanceStatus::Active,
        oauth_status: OAuthStatus::Connected,
        last_error: None,
        service_active: true,
        created_at: now,
        updated_at: now,
    }
}
