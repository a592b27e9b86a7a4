//! SQLite storage implementation
//!
//! Persistent backing store for instances and their OAuth state.

use super::*;
use crate::model::{InstanceStatus, OAuthStatus};
use crate::{GatewayError, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::path::Path;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS instances (
    instance_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    team_id TEXT,
    service_name TEXT NOT NULL,
    client_id TEXT NOT NULL,
    client_secret TEXT NOT NULL,
    token_url TEXT NOT NULL,
    auth_url TEXT,
    access_token TEXT,
    refresh_token TEXT,
    token_expires_at INTEGER,
    status TEXT NOT NULL,
    oauth_status TEXT NOT NULL,
    last_error TEXT,
    service_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)";

/// SQLite storage backend
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store
    ///
    /// # Arguments
    /// * `dsn` - Database path (e.g., ".portico/portico.db" or ":memory:" for in-memory)
    pub async fn new(dsn: &str) -> Result<Self> {
        // Prepend sqlite: prefix if not present and add create-if-missing option
        let connection_string = if dsn.starts_with("sqlite:") {
            if dsn.contains('?') {
                dsn.to_string()
            } else {
                format!("{}?mode=rwc", dsn)
            }
        } else {
            format!("sqlite:{}?mode=rwc", dsn)
        };

        let file_path = dsn.strip_prefix("sqlite:").unwrap_or(dsn);

        // Validate path to prevent directory traversal attacks
        if file_path.contains("..") {
            return Err(GatewayError::config(
                "Database path cannot contain '..' (path traversal not allowed)",
            ));
        }

        // Create parent directory if needed (unless it's :memory:)
        if file_path != ":memory:"
            && let Some(parent) = Path::new(file_path).parent()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePool::connect(&connection_string)
            .await
            .map_err(|e| GatewayError::storage(format!("Failed to connect to SQLite: {}", e)))?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    fn parse_instance(row: &SqliteRow) -> Result<InstanceCredentials> {
        let expires_at_unix: Option<i64> = row.try_get("token_expires_at")?;
        let created_at_unix: i64 = row.try_get("created_at")?;
        let updated_at_unix: i64 = row.try_get("updated_at")?;

        Ok(InstanceCredentials {
            instance_id: Uuid::parse_str(&row.try_get::<String, _>("instance_id")?)?,
            user_id: row.try_get("user_id")?,
            team_id: row.try_get("team_id")?,
            service_name: row.try_get("service_name")?,
            client_id: row.try_get("client_id")?,
            client_secret: row.try_get("client_secret")?,
            token_url: row.try_get("token_url")?,
            auth_url: row.try_get("auth_url")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            token_expires_at: expires_at_unix.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            status: parse_instance_status(&row.try_get::<String, _>("status")?),
            oauth_status: parse_oauth_status(&row.try_get::<String, _>("oauth_status")?),
            last_error: row.try_get("last_error")?,
            service_active: row.try_get::<i64, _>("service_active")? != 0,
            created_at: DateTime::from_timestamp(created_at_unix, 0).unwrap_or_else(Utc::now),
            updated_at: DateTime::from_timestamp(updated_at_unix, 0).unwrap_or_else(Utc::now),
        })
    }
}

fn instance_status_to_str(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Active => "active",
        InstanceStatus::Inactive => "inactive",
        InstanceStatus::Expired => "expired",
    }
}

fn parse_instance_status(s: &str) -> InstanceStatus {
    match s {
        "active" => InstanceStatus::Active,
        "expired" => InstanceStatus::Expired,
        _ => InstanceStatus::Inactive,
    }
}

fn oauth_status_to_str(status: OAuthStatus) -> &'static str {
    match status {
        OAuthStatus::Connected => "connected",
        OAuthStatus::Failed => "failed",
        OAuthStatus::Expired => "expired",
    }
}

fn parse_oauth_status(s: &str) -> OAuthStatus {
    match s {
        "connected" => OAuthStatus::Connected,
        "expired" => OAuthStatus::Expired,
        _ => OAuthStatus::Failed,
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn lookup_instance_credentials(
        &self,
        instance_id: Uuid,
        service_name: &str,
    ) -> Result<Option<InstanceCredentials>> {
        let row = sqlx::query(
            "SELECT * FROM instances WHERE instance_id = ? AND service_name = ?",
        )
        .bind(instance_id.to_string())
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::parse_instance(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_oauth_status(
        &self,
        instance_id: Uuid,
        update: &OAuthStatusUpdate,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE instances SET
                oauth_status = COALESCE(?, oauth_status),
                access_token = COALESCE(?, access_token),
                refresh_token = COALESCE(?, refresh_token),
                token_expires_at = COALESCE(?, token_expires_at),
                last_error = COALESCE(?, last_error),
                updated_at = ?
             WHERE instance_id = ?",
        )
        .bind(update.oauth_status.map(oauth_status_to_str))
        .bind(&update.access_token)
        .bind(&update.refresh_token)
        .bind(update.token_expires_at.map(|dt| dt.timestamp()))
        .bind(&update.error)
        .bind(Utc::now().timestamp())
        .bind(instance_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::Storage(crate::error::StorageError::NotFound(
                instance_id.to_string(),
            )));
        }
        Ok(())
    }

    async fn save_instance(&self, creds: &InstanceCredentials) -> Result<()> {
        creds.validate()?;
        sqlx::query(
            "INSERT OR REPLACE INTO instances
             (instance_id, user_id, team_id, service_name, client_id, client_secret,
              token_url, auth_url, access_token, refresh_token, token_expires_at,
              status, oauth_status, last_error, service_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(creds.instance_id.to_string())
        .bind(&creds.user_id)
        .bind(&creds.team_id)
        .bind(&creds.service_name)
        .bind(&creds.client_id)
        .bind(&creds.client_secret)
        .bind(&creds.token_url)
        .bind(&creds.auth_url)
        .bind(&creds.access_token)
        .bind(&creds.refresh_token)
        .bind(creds.token_expires_at.map(|dt| dt.timestamp()))
        .bind(instance_status_to_str(creds.status))
        .bind(oauth_status_to_str(creds.oauth_status))
        .bind(&creds.last_error)
        .bind(creds.service_active as i64)
        .bind(creds.created_at.timestamp())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceCredentials>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::parse_instance).collect()
    }

    async fn delete_instance(&self, instance_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
