//! Core data model for Portico
//!
//! Instances, cached credentials, and the partial-update types that flow
//! between the cache, the watcher, and the backing store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a connected instance, mirrored from the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Inactive,
    Expired,
}

impl InstanceStatus {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceStatus::Active)
    }
}

/// OAuth connection health as recorded in the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthStatus {
    Connected,
    Failed,
    Expired,
}

/// One instance's row in the backing store: ownership, client
/// credentials for the provider, and the last persisted token set.
///
/// The store is the system of record; the cache holds a working copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceCredentials {
    /// Stable identifier for the connected account
    pub instance_id: Uuid,

    /// Owning user
    pub user_id: String,

    /// Optional tenant scoping
    pub team_id: Option<String>,

    /// External service this instance connects to (e.g. "github", "slack")
    pub service_name: String,

    /// OAuth client ID registered with the provider
    pub client_id: String,

    /// OAuth client secret (encrypted at storage layer)
    pub client_secret: String,

    /// Provider token endpoint
    pub token_url: String,

    /// Provider authorization endpoint (unused on the refresh path but
    /// required to construct an OAuth client)
    pub auth_url: Option<String>,

    /// Last persisted access token
    pub access_token: Option<String>,

    /// Last persisted refresh token
    pub refresh_token: Option<String>,

    /// Expiry of the persisted access token
    pub token_expires_at: Option<DateTime<Utc>>,

    /// Instance lifecycle status
    pub status: InstanceStatus,

    /// OAuth connection health
    pub oauth_status: OAuthStatus,

    /// Reason recorded for the most recent OAuth failure, operator-visible
    pub last_error: Option<String>,

    /// Whether the external service is enabled for this deployment
    pub service_active: bool,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl InstanceCredentials {
    /// Validate required fields before persisting
    pub fn validate(&self) -> crate::Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(crate::GatewayError::config("service_name is required"));
        }
        if self.client_id.trim().is_empty() {
            return Err(crate::GatewayError::config("client_id is required"));
        }
        if self.token_url.trim().is_empty() {
            return Err(crate::GatewayError::config("token_url is required"));
        }
        Ok(())
    }

    /// Check if the persisted access token is usable right now
    #[must_use]
    pub fn has_valid_access_token(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_some()
            && self.token_expires_at.is_some_and(|expires| expires > now)
    }
}

/// Partial update written back to the store after a refresh outcome
#[derive(Debug, Clone, Default)]
pub struct OAuthStatusUpdate {
    pub oauth_status: Option<OAuthStatus>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A bearer token and its expiry, always written as one unit
///
/// This is the only way token material enters the cache, which is what
/// keeps `bearer_token` and `expires_at` atomically paired.
#[derive(Debug, Clone)]
pub struct TokenData {
    pub bearer_token: String,
    /// New refresh token if the provider rotated it; `None` keeps the
    /// existing one.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// One instance's working credentials as held by the in-process cache
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub instance_id: Uuid,
    pub user_id: String,
    pub team_id: Option<String>,
    pub service_name: String,

    /// Current access token (secret - never logged whole)
    pub bearer_token: String,

    /// Current refresh token (secret - never logged whole)
    pub refresh_token: Option<String>,

    /// Absolute expiry of `bearer_token`. Updated atomically with it.
    pub expires_at: DateTime<Utc>,

    /// Mirror of the store's instance status
    pub status: InstanceStatus,

    /// Consecutive failed-refresh counter; the only authority for
    /// "give up and evict". Reset to 0 on any successful refresh.
    pub refresh_attempts: u32,

    // Bookkeeping timestamps, used for observability and LRU pruning,
    // never for correctness decisions except last_used ordering.
    pub cached_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    pub last_successful_refresh: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Build a fresh entry from a store row that carries a usable token
    pub fn from_credentials(creds: &InstanceCredentials, token: TokenData) -> Self {
        let now = Utc::now();
        Self {
            instance_id: creds.instance_id,
            user_id: creds.user_id.clone(),
            team_id: creds.team_id.clone(),
            service_name: creds.service_name.clone(),
            bearer_token: token.bearer_token,
            refresh_token: token.refresh_token.or_else(|| creds.refresh_token.clone()),
            expires_at: token.expires_at,
            status: creds.status,
            refresh_attempts: 0,
            cached_at: now,
            last_used: now,
            last_modified: now,
            last_refresh_attempt: None,
            last_successful_refresh: None,
        }
    }

    /// Check if the token is expired, or expires within `margin`
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin >= self.expires_at
    }

    /// Remaining token lifetime; negative once expired
    #[must_use]
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// Bookkeeping timestamps must be internally ordered; a violation
    /// means a torn update and the entry cannot be trusted.
    #[must_use]
    pub fn is_structurally_sound(&self) -> bool {
        self.last_used >= self.cached_at && self.last_modified >= self.cached_at
    }
}

/// Partial in-place merge applied to a cache entry
///
/// Token material travels inside [`TokenData`] so a new bearer token can
/// never be observed alongside a stale expiry.
#[derive(Debug, Clone, Default)]
pub struct CacheMetadataUpdate {
    pub token: Option<TokenData>,
    pub status: Option<InstanceStatus>,
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    pub last_successful_refresh: Option<DateTime<Utc>>,
}

/// Successful token exchange result, normalized from the provider response
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Seconds until `access_token` expires
    pub expires_in: u64,
    pub scope: Option<String>,
}

impl RefreshedToken {
    /// Convert to cache-ready token data anchored at `now`
    #[must_use]
    pub fn into_token_data(self, now: DateTime<Utc>) -> TokenData {
        TokenData {
            bearer_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: now + Duration::seconds(self.expires_in as i64),
        }
    }
}

/// Static configuration for one external service, handed to the handler
/// factory when a protocol session is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,

    /// Upstream API base URL for proxying tool calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Service-specific settings passed through opaquely
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub settings: serde_json::Value,
}

impl ServiceConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            base_url: None,
            settings: serde_json::Value::Null,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}
