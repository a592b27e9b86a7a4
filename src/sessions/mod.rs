//! Handler session registry
//!
//! Reuses expensive per-instance protocol-handler objects across
//! requests instead of reconstructing them every call, while staying
//! consistent with credential state: refreshes push the new bearer
//! token into live sessions, revocations invalidate them.

pub mod proxy;

use crate::config::SessionConfig;
use crate::model::ServiceConfig;
use crate::{GatewayError, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use proxy::HttpProxyHandler;

/// Stateful per-instance protocol handler (an MCP session)
///
/// Implementations hold whatever upstream state they need; the registry
/// only requires that a refreshed bearer token can be pushed in and
/// that JSON-RPC payloads can be dispatched.
#[async_trait::async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Swap the Authorization credential used for upstream calls
    fn set_bearer_token(&self, token: &str);

    /// Dispatch one protocol request to the upstream service
    async fn handle(&self, request: serde_json::Value) -> Result<serde_json::Value>;
}

/// Constructor for protocol handlers, supplied by the embedding service
pub type HandlerFactory =
    Arc<dyn Fn(&ServiceConfig, &str) -> Result<Arc<dyn ProtocolHandler>> + Send + Sync>;

/// One live session
struct HandlerSession {
    handler: Arc<dyn ProtocolHandler>,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    /// Denormalized copy of the bearer token for change detection
    bearer_token: String,
}

/// Registry statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatistics {
    pub active_sessions: usize,
    pub created: u64,
    pub evicted: u64,
    pub token_updates: u64,
}

#[derive(Default)]
struct Counters {
    created: u64,
    evicted: u64,
    token_updates: u64,
}

/// Per-instance reusable handler sessions with idle-timeout eviction
pub struct HandlerSessionRegistry {
    sessions: RwLock<HashMap<Uuid, HandlerSession>>,
    factory: HandlerFactory,
    config: SessionConfig,
    counters: Mutex<Counters>,
    cleanup: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HandlerSessionRegistry {
    pub fn new(config: SessionConfig, factory: HandlerFactory) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            config,
            counters: Mutex::new(Counters::default()),
            cleanup: Mutex::new(None),
        }
    }

    /// Return the existing session for an instance, or build one.
    ///
    /// An existing session has its idle clock touched; if the caller
    /// presents a different bearer token than the session last saw, the
    /// fresh token is pushed into the handler before it is returned.
    pub fn get_or_create(
        &self,
        instance_id: Uuid,
        service_config: &ServiceConfig,
        bearer_token: &str,
    ) -> Result<Arc<dyn ProtocolHandler>> {
        {
            let mut sessions = self.sessions.write();
            if let Some(session) = sessions.get_mut(&instance_id) {
                session.last_accessed = Utc::now();
                if session.bearer_token != bearer_token {
                    session.handler.set_bearer_token(bearer_token);
                    session.bearer_token = bearer_token.to_string();
                    self.counters.lock().token_updates += 1;
                }
                return Ok(session.handler.clone());
            }
        }

        let handler = (self.factory)(service_config, bearer_token)?;
        let now = Utc::now();
        let session = HandlerSession {
            handler: handler.clone(),
            created_at: now,
            last_accessed: now,
            bearer_token: bearer_token.to_string(),
        };
        self.sessions.write().insert(instance_id, session);
        self.counters.lock().created += 1;
        tracing::debug!(%instance_id, service = %service_config.service_name, "created handler session");
        Ok(handler)
    }

    /// Destroy the session for an instance. Returns true if one existed.
    pub fn remove(&self, instance_id: Uuid) -> bool {
        let removed = self.sessions.write().remove(&instance_id).is_some();
        if removed {
            self.counters.lock().evicted += 1;
        }
        removed
    }

    /// Called when credential revocation is detected for an instance
    pub fn invalidate(&self, instance_id: Uuid) {
        if self.remove(instance_id) {
            tracing::info!(%instance_id, "invalidated handler session after credential revocation");
        }
    }

    /// Push a refreshed bearer token into a live session so it does not
    /// keep calling upstream with a stale credential. Returns false if
    /// no session exists for the instance.
    pub fn update_bearer_token(&self, instance_id: Uuid, new_token: &str) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&instance_id) {
            Some(session) => {
                session.handler.set_bearer_token(new_token);
                session.bearer_token = new_token.to_string();
                self.counters.lock().token_updates += 1;
                true
            }
            None => false,
        }
    }

    pub fn statistics(&self) -> SessionStatistics {
        let counters = self.counters.lock();
        SessionStatistics {
            active_sessions: self.sessions.read().len(),
            created: counters.created,
            evicted: counters.evicted,
            token_updates: counters.token_updates,
        }
    }

    /// Evict sessions idle beyond the timeout, plus any with internally
    /// inconsistent timestamps left behind by a torn construction.
    /// Returns the number evicted.
    pub fn sweep_idle(&self) -> usize {
        let now = Utc::now();
        let idle_timeout = Duration::seconds(self.config.idle_timeout_secs as i64);

        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|instance_id, session| {
            if session.last_accessed < session.created_at {
                tracing::error!(%instance_id, "handler session has inconsistent timestamps, evicting");
                return false;
            }
            let keep = now - session.last_accessed < idle_timeout;
            if !keep {
                tracing::debug!(%instance_id, "evicting idle handler session");
            }
            keep
        });
        let evicted = before - sessions.len();
        self.counters.lock().evicted += evicted as u64;
        evicted
    }

    /// Start the periodic idle sweep. Idempotent: a second start while
    /// running is a no-op with a warning.
    pub fn start_cleanup(self: &Arc<Self>) {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            tracing::warn!("session cleanup already running, ignoring start");
            return;
        }

        let token = CancellationToken::new();
        let registry = self.clone();
        let cancel = token.clone();
        let interval = std::time::Duration::from_secs(self.config.sweep_interval_secs);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.sweep_idle();
                        if evicted > 0 {
                            tracing::info!(evicted, "session idle sweep complete");
                        }
                    }
                }
            }
        });
        *cleanup = Some((token, handle));
    }

    /// Stop the periodic sweep and wait for the task to finish.
    /// A no-op when not running.
    pub async fn stop_cleanup(&self) {
        let stopped = self.cleanup.lock().take();
        if let Some((token, handle)) = stopped {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("session cleanup task ended abnormally: {}", e);
            }
        }
    }

    pub fn cleanup_running(&self) -> bool {
        self.cleanup.lock().is_some()
    }
}

/// A factory that refuses to build handlers; useful when the embedding
/// service manages handlers out of band.
pub fn null_factory() -> HandlerFactory {
    Arc::new(|config: &ServiceConfig, _token: &str| {
        Err(GatewayError::session(format!(
            "no handler factory registered for service '{}'",
            config.service_name
        )))
    })
}
