//! Gateway engine
//!
//! Single owner of the credential subsystem: one engine instance wires
//! the store, cache, refresh coordinator, watcher, and session registry
//! together and exposes the whole lifecycle as methods. Nothing in the
//! crate reaches for global state; embedders construct an engine and
//! pass it where it is needed.

use crate::cache::{CacheStatistics, CredentialCache};
use crate::config::Config;
use crate::model::{CacheEntry, CacheMetadataUpdate, ServiceConfig, TokenData};
use crate::refresh::{OAuth2Adapter, RefreshCoordinator, ServiceAdapter, TokenRefresher};
use crate::sessions::{HandlerFactory, HandlerSessionRegistry, ProtocolHandler, SessionStatistics};
use crate::storage::{CredentialStore, create_store_from_config};
use crate::watcher::{CredentialWatcher, WatcherStatus};
use crate::Result;
use std::sync::Arc;
use uuid::Uuid;

/// The credential gateway engine
pub struct Engine {
    config: Config,
    store: Arc<dyn CredentialStore>,
    cache: Arc<CredentialCache>,
    sessions: Arc<HandlerSessionRegistry>,
    coordinator: Arc<RefreshCoordinator>,
    watcher: Arc<CredentialWatcher>,
}

impl Engine {
    /// Wire up the full subsystem from configuration.
    ///
    /// The handler factory decides what a protocol session talks to;
    /// the HTTP server passes the JSON-RPC proxy factory, tests pass
    /// doubles. Background tasks are not started here; call
    /// `start_credential_watcher` and `start_session_cleanup` once the
    /// runtime is ready to host them.
    pub async fn new(config: Config, factory: HandlerFactory) -> Result<Self> {
        let store = create_store_from_config(&config.storage).await?;
        let cache = Arc::new(CredentialCache::new(config.cache.clone()));
        let sessions = Arc::new(HandlerSessionRegistry::new(
            config.sessions.clone(),
            factory,
        ));

        let refresher = TokenRefresher::new(&config.oauth)?;
        let fallback: Arc<dyn ServiceAdapter> =
            Arc::new(OAuth2Adapter::new(store.clone(), refresher));
        let coordinator = Arc::new(RefreshCoordinator::new(
            cache.clone(),
            store.clone(),
            sessions.clone(),
            fallback,
            config.cache.refresh_margin_secs,
            config.watcher.refresh_threshold_secs,
        ));
        let watcher = Arc::new(CredentialWatcher::new(
            coordinator.clone(),
            config.watcher.clone(),
        ));

        Ok(Self {
            config,
            store,
            cache,
            sessions,
            coordinator,
            watcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Route refreshes for one service through a bespoke adapter instead
    /// of the generic OAuth2 exchange.
    pub fn register_service_adapter(&self, adapter: Arc<dyn ServiceAdapter>) {
        self.coordinator.register_adapter(adapter);
    }

    // ---- cache ----

    /// Fetch a cached credential, touching its LRU clock
    pub fn get_cached_credential(&self, instance_id: Uuid) -> Option<CacheEntry> {
        self.cache.get(instance_id)
    }

    /// Observe a cached credential without touching its LRU clock
    pub fn peek_cached_credential(&self, instance_id: Uuid) -> Option<CacheEntry> {
        self.cache.peek(instance_id)
    }

    pub fn set_cached_credential(&self, entry: CacheEntry) {
        self.cache.set(entry);
    }

    /// Apply a partial metadata update; the token/expiry pair is always
    /// replaced together. Returns false when the instance is not cached.
    pub fn update_cached_credential_metadata(
        &self,
        instance_id: Uuid,
        update: CacheMetadataUpdate,
    ) -> bool {
        self.cache.update_metadata(instance_id, update)
    }

    pub fn set_cached_token(&self, instance_id: Uuid, token: TokenData) -> bool {
        self.cache.set_token(instance_id, token)
    }

    pub fn increment_refresh_attempts(&self, instance_id: Uuid) -> u32 {
        self.cache.increment_refresh_attempts(instance_id)
    }

    pub fn reset_refresh_attempts(&self, instance_id: Uuid) {
        self.cache.reset_refresh_attempts(instance_id)
    }

    pub fn remove_cached_credential(&self, instance_id: Uuid) -> Option<CacheEntry> {
        self.cache.remove(instance_id)
    }

    pub fn cleanup_invalid_cache_entries(&self, reason: &str) -> usize {
        self.cache.cleanup_invalid(reason)
    }

    pub fn get_cached_instance_ids(&self) -> Vec<Uuid> {
        self.cache.list_instance_ids()
    }

    pub fn get_cache_statistics(&self) -> CacheStatistics {
        self.cache.statistics()
    }

    // ---- watcher ----

    pub fn start_credential_watcher(&self) {
        self.watcher.start();
    }

    pub async fn stop_credential_watcher(&self) {
        self.watcher.stop().await;
    }

    pub fn get_watcher_status(&self) -> WatcherStatus {
        self.watcher.status()
    }

    /// Refresh one instance now, ignoring the expiry threshold
    pub async fn force_refresh_instance_token(&self, instance_id: Uuid) -> Result<CacheEntry> {
        self.watcher.force_refresh(instance_id).await
    }

    /// Run the invalid-entry sweep outside the watcher's schedule
    pub fn manual_cleanup(&self) -> usize {
        self.watcher.manual_cleanup()
    }

    // ---- sessions ----

    /// Reuse or build the protocol handler for an instance
    pub fn get_or_create_handler(
        &self,
        instance_id: Uuid,
        service_config: &ServiceConfig,
        bearer_token: &str,
    ) -> Result<Arc<dyn ProtocolHandler>> {
        self.sessions
            .get_or_create(instance_id, service_config, bearer_token)
    }

    pub fn remove_handler_session(&self, instance_id: Uuid) -> bool {
        self.sessions.remove(instance_id)
    }

    pub fn invalidate_handler_session(&self, instance_id: Uuid) {
        self.sessions.invalidate(instance_id)
    }

    pub fn update_session_bearer_token(&self, instance_id: Uuid, token: &str) -> bool {
        self.sessions.update_bearer_token(instance_id, token)
    }

    pub fn get_session_statistics(&self) -> SessionStatistics {
        self.sessions.statistics()
    }

    pub fn start_session_cleanup(&self) {
        self.sessions.start_cleanup();
    }

    pub async fn stop_session_cleanup(&self) {
        self.sessions.stop_cleanup().await;
    }

    /// Stop all background tasks. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.watcher.stop().await;
        self.sessions.stop_cleanup().await;
        tracing::info!("engine shut down");
    }
}
