//! Refresh coordination
//!
//! One decision table for credential resolution shared by the
//! request-time middleware and the background watcher: cache fast path,
//! cold load from the backing store, provider refresh, and the
//! bookkeeping each transition owes the cache, the store, and the
//! session registry.

use super::ServiceAdapter;
use crate::cache::CredentialCache;
use crate::model::{
    CacheEntry, CacheMetadataUpdate, InstanceCredentials, OAuthStatus, OAuthStatusUpdate,
};
use crate::sessions::HandlerSessionRegistry;
use crate::storage::CredentialStore;
use crate::{GatewayError, Result};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Who is asking for the refresh.
///
/// The watcher owns the consecutive-failure budget; request-path
/// refreshes leave the counter alone so a burst of traffic during a
/// provider brownout cannot burn an instance's attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Background,
    RequestPath,
}

/// Coordinates the cache, the store, adapters, and live sessions
pub struct RefreshCoordinator {
    cache: Arc<CredentialCache>,
    store: Arc<dyn CredentialStore>,
    sessions: Arc<HandlerSessionRegistry>,
    adapters: parking_lot::RwLock<HashMap<String, Arc<dyn ServiceAdapter>>>,
    fallback: Arc<dyn ServiceAdapter>,
    /// Per-instance guard collapsing concurrent refreshes into one
    /// provider call
    inflight: tokio::sync::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    /// Request-path safety margin: a token expiring within this window
    /// is refreshed before being attached
    refresh_margin: Duration,
    /// Proactive margin used by background refreshes; matches the
    /// watcher's refresh threshold
    background_margin: Duration,
}

impl RefreshCoordinator {
    pub fn new(
        cache: Arc<CredentialCache>,
        store: Arc<dyn CredentialStore>,
        sessions: Arc<HandlerSessionRegistry>,
        fallback: Arc<dyn ServiceAdapter>,
        refresh_margin_secs: u64,
        background_margin_secs: u64,
    ) -> Self {
        Self {
            cache,
            store,
            sessions,
            adapters: parking_lot::RwLock::new(HashMap::new()),
            fallback,
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            refresh_margin: Duration::seconds(refresh_margin_secs as i64),
            background_margin: Duration::seconds(background_margin_secs as i64),
        }
    }

    /// Freshness margin appropriate to the caller: the request path
    /// only cares about imminent expiry, the watcher refreshes early.
    fn margin_for(&self, kind: RefreshKind) -> Duration {
        match kind {
            RefreshKind::RequestPath => self.refresh_margin,
            RefreshKind::Background => self.background_margin,
        }
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<HandlerSessionRegistry> {
        &self.sessions
    }

    /// Register a service-specific adapter; instances of that service
    /// stop using the generic OAuth2 exchange.
    pub fn register_adapter(&self, adapter: Arc<dyn ServiceAdapter>) {
        let name = adapter.service_name().to_string();
        self.adapters.write().insert(name, adapter);
    }

    fn adapter_for(&self, service_name: &str) -> Arc<dyn ServiceAdapter> {
        self.adapters
            .read()
            .get(service_name)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Resolve a usable credential for a request: cache fast path, lazy
    /// refresh, or cold load from the store.
    pub async fn resolve(&self, instance_id: Uuid, service_name: &str) -> Result<CacheEntry> {
        if let Some(entry) = self.cache.get(instance_id) {
            if !entry.needs_refresh(Utc::now(), self.refresh_margin) {
                return Ok(entry);
            }
            return self
                .refresh_instance(instance_id, service_name, RefreshKind::RequestPath)
                .await;
        }
        self.cold_load(instance_id, service_name).await
    }

    /// Cache miss: load the instance from the system of record.
    async fn cold_load(&self, instance_id: Uuid, service_name: &str) -> Result<CacheEntry> {
        let adapter = self.adapter_for(service_name);
        let creds = adapter
            .lookup_credentials(instance_id, service_name)
            .await?
            .ok_or_else(|| {
                GatewayError::not_found(format!("instance {} not found", instance_id))
            })?;

        check_instance_usable(&creds)?;

        let now = Utc::now();
        if creds.has_valid_access_token(now) {
            // Stored token is still good: prime the cache and attach
            let token = crate::model::TokenData {
                bearer_token: creds.access_token.clone().unwrap_or_default(),
                refresh_token: creds.refresh_token.clone(),
                expires_at: creds.token_expires_at.unwrap_or(now),
            };
            let entry = CacheEntry::from_credentials(&creds, token);
            self.cache.set(entry.clone());
            return Ok(entry);
        }

        // Stored token also expired: seed the cache with the stale pair
        // so refresh bookkeeping has an entry to work against, then
        // refresh immediately.
        let stale = crate::model::TokenData {
            bearer_token: creds.access_token.clone().unwrap_or_default(),
            refresh_token: creds.refresh_token.clone(),
            expires_at: creds.token_expires_at.unwrap_or(now - Duration::seconds(1)),
        };
        self.cache.set(CacheEntry::from_credentials(&creds, stale));
        self.refresh_instance(instance_id, service_name, RefreshKind::RequestPath)
            .await
    }

    /// Refresh the instance's token, serialized per instance.
    ///
    /// Concurrent callers for the same instance await the same guard;
    /// late arrivals find a fresh token after acquiring it and skip the
    /// provider round trip.
    pub async fn refresh_instance(
        &self,
        instance_id: Uuid,
        service_name: &str,
        kind: RefreshKind,
    ) -> Result<CacheEntry> {
        let guard = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(instance_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _held = guard.lock().await;

        let result = self.refresh_locked(instance_id, service_name, kind).await;

        // Drop the guard entry once no other caller holds it
        {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(&instance_id)
                && Arc::strong_count(existing) <= 2
            {
                inflight.remove(&instance_id);
            }
        }

        result
    }

    async fn refresh_locked(
        &self,
        instance_id: Uuid,
        service_name: &str,
        kind: RefreshKind,
    ) -> Result<CacheEntry> {
        let now = Utc::now();

        let entry = self.cache.peek(instance_id).ok_or_else(|| {
            GatewayError::not_found(format!("instance {} not cached", instance_id))
        })?;

        // A concurrent refresh may have completed while this caller
        // waited on the guard.
        if !entry.needs_refresh(now, self.margin_for(kind)) {
            tracing::debug!(%instance_id, "refresh collapsed into concurrent completion");
            return Ok(entry);
        }

        if kind == RefreshKind::Background {
            self.cache.increment_refresh_attempts(instance_id);
        } else {
            self.cache.update_metadata(
                instance_id,
                CacheMetadataUpdate {
                    last_refresh_attempt: Some(now),
                    ..Default::default()
                },
            );
        }

        let adapter = self.adapter_for(service_name);
        let creds = match adapter.lookup_credentials(instance_id, service_name).await? {
            Some(creds) => creds,
            None => {
                // Row deleted underneath us: the store wins
                self.evict(instance_id, "instance removed from store");
                return Err(GatewayError::not_found(format!(
                    "instance {} no longer exists",
                    instance_id
                )));
            }
        };

        if let Err(e) = check_instance_usable(&creds) {
            self.evict(instance_id, "instance deactivated in store");
            return Err(e);
        }

        let Some(refresh_token) = entry
            .refresh_token
            .clone()
            .or_else(|| creds.refresh_token.clone())
        else {
            self.mark_failed(instance_id, "no refresh token on record").await;
            return Err(GatewayError::token_invalid(format!(
                "instance {} has no refresh token; re-authentication required",
                instance_id
            )));
        };

        match adapter.refresh(&creds, &refresh_token).await {
            Ok(refreshed) => {
                let token = refreshed.into_token_data(Utc::now());
                tracing::info!(
                    %instance_id,
                    service = %creds.service_name,
                    token = %crate::auth::token_fingerprint(&token.bearer_token),
                    expires_at = %token.expires_at,
                    "token refreshed"
                );

                // Cache first, then the store, then live sessions; a
                // crash in between leaves the store recoverable.
                self.cache.update_metadata(
                    instance_id,
                    CacheMetadataUpdate {
                        token: Some(token.clone()),
                        status: Some(crate::model::InstanceStatus::Active),
                        last_successful_refresh: Some(Utc::now()),
                        ..Default::default()
                    },
                );
                self.cache.reset_refresh_attempts(instance_id);

                self.store
                    .update_oauth_status(
                        instance_id,
                        &OAuthStatusUpdate {
                            oauth_status: Some(OAuthStatus::Connected),
                            access_token: Some(token.bearer_token.clone()),
                            refresh_token: token.refresh_token.clone(),
                            token_expires_at: Some(token.expires_at),
                            error: None,
                        },
                    )
                    .await?;

                self.sessions
                    .update_bearer_token(instance_id, &token.bearer_token);

                self.cache.peek(instance_id).ok_or_else(|| {
                    GatewayError::cache_consistency(format!(
                        "entry for {} vanished during refresh",
                        instance_id
                    ))
                })
            }
            Err(e) if e.is_terminal() => {
                tracing::warn!(
                    %instance_id,
                    service = %creds.service_name,
                    error = %e,
                    "terminal refresh failure, evicting"
                );
                self.mark_failed(instance_id, &e.to_string()).await;
                Err(GatewayError::token_invalid(e.to_string()))
            }
            Err(e) => {
                // Transient (or unclassified): leave the entry in place
                // so the next request or watcher cycle retries; the
                // attempt ceiling bounds how long this can go on.
                tracing::warn!(
                    %instance_id,
                    service = %creds.service_name,
                    error = %e,
                    "transient refresh failure"
                );
                Err(GatewayError::transient(e.to_string()))
            }
        }
    }

    /// Terminal failure: record it in the store, evict the cache entry,
    /// and tear down any live session.
    async fn mark_failed(&self, instance_id: Uuid, error: &str) {
        let update = OAuthStatusUpdate {
            oauth_status: Some(OAuthStatus::Failed),
            error: Some(error.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.store.update_oauth_status(instance_id, &update).await {
            tracing::error!(%instance_id, "failed to persist OAuth failure: {}", e);
        }
        self.evict(instance_id, error);
    }

    fn evict(&self, instance_id: Uuid, reason: &str) {
        self.cache.remove(instance_id);
        self.sessions.invalidate(instance_id);
        tracing::info!(%instance_id, reason, "evicted credential and session");
    }
}

/// Shared gate: an instance must be active and its service enabled
fn check_instance_usable(creds: &InstanceCredentials) -> Result<()> {
    if !creds.service_active {
        return Err(GatewayError::authorization(format!(
            "service '{}' is not active",
            creds.service_name
        )));
    }
    if !creds.status.is_active() {
        return Err(GatewayError::authorization(format!(
            "instance {} is not active",
            creds.instance_id
        )));
    }
    Ok(())
}
