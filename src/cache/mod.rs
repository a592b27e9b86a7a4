//! In-process credential cache
//!
//! Authoritative, process-local store of "currently believed good"
//! credentials. The read path never triggers I/O; the write path is
//! shared by the request-time refresh and the background watcher.
//!
//! Compound read-modify-write sequences (increment-then-compare,
//! token+expiry replacement) each execute under a single write-lock
//! acquisition, so no observer can see a torn entry.

use crate::config::CacheConfig;
use crate::model::{CacheEntry, CacheMetadataUpdate, TokenData};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Aggregate cache statistics for monitoring endpoints
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub sets: u64,
    pub evictions: u64,
    /// Entry count per external service
    pub per_service: HashMap<String, usize>,
    /// Rough in-memory footprint of cached secrets and metadata
    pub memory_estimate_bytes: usize,
}

/// Process-local credential cache keyed by instance ID
pub struct CredentialCache {
    entries: RwLock<HashMap<Uuid, CacheEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

impl CredentialCache {
    /// Create a new cache with the given tuning
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up an entry, touching its `last_used` clock.
    ///
    /// Policy decisions (expiry, refresh) belong to the caller.
    pub fn get(&self, instance_id: Uuid) -> Option<CacheEntry> {
        let mut entries = self.entries.write();
        match entries.get_mut(&instance_id) {
            Some(entry) => {
                entry.last_used = Utc::now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Look up an entry without mutating it. Used by monitoring and the
    /// watcher so observation does not reset idle clocks.
    pub fn peek(&self, instance_id: Uuid) -> Option<CacheEntry> {
        self.entries.read().get(&instance_id).cloned()
    }

    /// Insert or fully replace an entry.
    ///
    /// Runs LRU pruning first when the cache is at capacity and the key
    /// is new.
    pub fn set(&self, entry: CacheEntry) {
        let mut entries = self.entries.write();
        if entries.len() >= self.config.max_entries && !entries.contains_key(&entry.instance_id) {
            self.prune_lru(&mut entries);
        }
        entries.insert(entry.instance_id, entry);
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// In-place merge of a partial update. Returns false if the entry is
    /// absent (callers treat that as a cold-load signal, not an error).
    ///
    /// Token material arrives as a [`TokenData`] unit, so the bearer
    /// token and its expiry are replaced in the same critical section.
    pub fn update_metadata(&self, instance_id: Uuid, update: CacheMetadataUpdate) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&instance_id) else {
            return false;
        };

        if let Some(token) = update.token {
            entry.bearer_token = token.bearer_token;
            entry.expires_at = token.expires_at;
            if let Some(refresh) = token.refresh_token {
                entry.refresh_token = Some(refresh);
            }
        }
        if let Some(status) = update.status {
            entry.status = status;
        }
        if let Some(at) = update.last_refresh_attempt {
            entry.last_refresh_attempt = Some(at);
        }
        if let Some(at) = update.last_successful_refresh {
            entry.last_successful_refresh = Some(at);
        }
        entry.last_modified = Utc::now();
        true
    }

    /// Bump the consecutive failed-refresh counter, returning the new
    /// value. Returns 0 when the entry is absent.
    pub fn increment_refresh_attempts(&self, instance_id: Uuid) -> u32 {
        let mut entries = self.entries.write();
        match entries.get_mut(&instance_id) {
            Some(entry) => {
                entry.refresh_attempts += 1;
                entry.last_refresh_attempt = Some(Utc::now());
                entry.last_modified = Utc::now();
                entry.refresh_attempts
            }
            None => {
                tracing::debug!(%instance_id, "increment_refresh_attempts on absent entry");
                0
            }
        }
    }

    /// Reset the failed-refresh counter after a successful refresh
    pub fn reset_refresh_attempts(&self, instance_id: Uuid) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&instance_id) {
            entry.refresh_attempts = 0;
            entry.last_modified = Utc::now();
        }
    }

    /// Remove one entry. Returns the removed entry if present.
    ///
    /// Eviction is final: a subsequent lookup must cold-load from the
    /// backing store, never resurrect stale tokens.
    pub fn remove(&self, instance_id: Uuid) -> Option<CacheEntry> {
        let removed = self.entries.write().remove(&instance_id);
        if removed.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Evict every entry that is expired beyond the grace window, whose
    /// status is no longer active, or that has exhausted its refresh
    /// budget. Returns the number removed. `reason` is audit-only.
    pub fn cleanup_invalid(&self, reason: &str) -> usize {
        let now = Utc::now();
        let grace = Duration::seconds(self.config.expiry_grace_secs as i64);
        let max_attempts = self.config.max_refresh_attempts;

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|instance_id, entry| {
            let expired_beyond_grace = now > entry.expires_at + grace;
            let inactive = !entry.status.is_active();
            let exhausted = entry.refresh_attempts >= max_attempts;
            let keep = !(expired_beyond_grace || inactive || exhausted);
            if !keep {
                tracing::info!(
                    %instance_id,
                    service = %entry.service_name,
                    expired_beyond_grace,
                    inactive,
                    exhausted,
                    reason,
                    "evicting invalid cache entry"
                );
            }
            keep
        });
        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Snapshot of all cached instance IDs
    pub fn list_instance_ids(&self) -> Vec<Uuid> {
        self.entries.read().keys().copied().collect()
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Aggregate statistics for monitoring
    pub fn statistics(&self) -> CacheStatistics {
        let entries = self.entries.read();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        let mut per_service: HashMap<String, usize> = HashMap::new();
        let mut memory_estimate_bytes = 0usize;
        for entry in entries.values() {
            *per_service.entry(entry.service_name.clone()).or_default() += 1;
            memory_estimate_bytes += std::mem::size_of::<CacheEntry>()
                + entry.bearer_token.len()
                + entry.refresh_token.as_ref().map_or(0, String::len)
                + entry.user_id.len()
                + entry.service_name.len();
        }

        CacheStatistics {
            size: entries.len(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            per_service,
            memory_estimate_bytes,
        }
    }

    /// Remove the least-recently-used ~10% of entries to make room.
    /// Applied uniformly regardless of service.
    fn prune_lru(&self, entries: &mut HashMap<Uuid, CacheEntry>) {
        let prune_count = (entries.len() / 10).max(1);
        let mut by_age: Vec<(Uuid, chrono::DateTime<Utc>)> = entries
            .iter()
            .map(|(id, entry)| (*id, entry.last_used))
            .collect();
        by_age.sort_unstable_by_key(|(_, last_used)| *last_used);

        for (instance_id, _) in by_age.into_iter().take(prune_count) {
            entries.remove(&instance_id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%instance_id, "pruned least-recently-used cache entry");
        }
    }

    /// Replace a token/expiry pair in one operation, preserving pairing
    pub fn set_token(&self, instance_id: Uuid, token: TokenData) -> bool {
        self.update_metadata(
            instance_id,
            CacheMetadataUpdate {
                token: Some(token),
                ..Default::default()
            },
        )
    }
}
