//! Background credential watcher
//!
//! Periodic sweep that keeps the cache warm so request-time refreshes
//! stay rare: refreshes tokens nearing expiry, evicts instances that
//! exhausted their refresh budget, and sweeps entries that independently
//! became invalid since the last cycle.

use crate::config::WatcherConfig;
use crate::model::CacheEntry;
use crate::refresh::{RefreshCoordinator, RefreshKind};
use crate::{GatewayError, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cumulative watcher statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatcherStats {
    pub last_run: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub tokens_refreshed: u64,
    pub refresh_failures: u64,
    pub entries_cleaned_up: u64,
}

/// Snapshot returned by `status()`
#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub running: bool,
    #[serde(flatten)]
    pub stats: WatcherStats,
}

/// Outcome of one cycle, mostly for tests and logging
#[derive(Debug, Default)]
pub struct CycleSummary {
    pub scanned: usize,
    pub skipped: usize,
    pub refreshed: usize,
    pub evicted: usize,
    pub failures: usize,
    pub cleaned_up: usize,
}

enum InstanceOutcome {
    Skipped,
    Refreshed,
    Evicted,
    Failed,
}

/// Periodic background sweep over all cached instances
pub struct CredentialWatcher {
    coordinator: Arc<RefreshCoordinator>,
    config: WatcherConfig,
    stats: RwLock<WatcherStats>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CredentialWatcher {
    pub fn new(coordinator: Arc<RefreshCoordinator>, config: WatcherConfig) -> Self {
        Self {
            coordinator,
            config,
            stats: RwLock::new(WatcherStats::default()),
            task: Mutex::new(None),
        }
    }

    /// Start the periodic sweep. Starting an already-running watcher is
    /// a no-op with a warning.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            tracing::warn!("credential watcher already running, ignoring start");
            return;
        }

        let token = CancellationToken::new();
        let watcher = self.clone();
        let cancel = token.clone();
        let interval = std::time::Duration::from_secs(self.config.interval_secs);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let summary = watcher.run_cycle().await;
                        tracing::info!(
                            scanned = summary.scanned,
                            refreshed = summary.refreshed,
                            evicted = summary.evicted,
                            failures = summary.failures,
                            cleaned_up = summary.cleaned_up,
                            "watcher cycle complete"
                        );
                    }
                }
            }
        });
        *task = Some((token, handle));
        tracing::info!(
            interval_secs = self.config.interval_secs,
            threshold_secs = self.config.refresh_threshold_secs,
            "credential watcher started"
        );
    }

    /// Stop the sweep and wait for the task to finish. A no-op when not
    /// running.
    pub async fn stop(&self) {
        let stopped = self.task.lock().take();
        if let Some((token, handle)) = stopped {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("watcher task ended abnormally: {}", e);
            }
            tracing::info!("credential watcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn status(&self) -> WatcherStatus {
        WatcherStatus {
            running: self.is_running(),
            stats: self.stats.read().clone(),
        }
    }

    /// Run one sweep cycle to completion.
    ///
    /// Instance IDs are snapshotted at cycle start; instances added
    /// mid-cycle are picked up next cycle. Each instance is processed
    /// independently so one failure never aborts the rest.
    pub async fn run_cycle(&self) -> CycleSummary {
        let instance_ids = self.coordinator.cache().list_instance_ids();
        let mut summary = CycleSummary {
            scanned: instance_ids.len(),
            ..Default::default()
        };

        let outcomes = join_all(
            instance_ids
                .into_iter()
                .map(|id| self.process_instance(id)),
        )
        .await;

        for outcome in outcomes {
            match outcome {
                InstanceOutcome::Skipped => summary.skipped += 1,
                InstanceOutcome::Refreshed => summary.refreshed += 1,
                InstanceOutcome::Evicted => summary.evicted += 1,
                InstanceOutcome::Failed => summary.failures += 1,
            }
        }

        // Sweep entries that independently became invalid (status
        // flips, external revocation) since the last cycle.
        summary.cleaned_up = self.coordinator.cache().cleanup_invalid("watcher-cycle");

        let mut stats = self.stats.write();
        stats.last_run = Some(Utc::now());
        stats.total_runs += 1;
        stats.tokens_refreshed += summary.refreshed as u64;
        stats.refresh_failures += summary.failures as u64;
        stats.entries_cleaned_up += (summary.evicted + summary.cleaned_up) as u64;

        summary
    }

    /// Decide and act for one instance. Never panics the cycle: every
    /// failure is caught and folded into the outcome.
    async fn process_instance(&self, instance_id: Uuid) -> InstanceOutcome {
        // Peek, not get: background observation must not reset the
        // entry's LRU clock.
        let Some(entry) = self.coordinator.cache().peek(instance_id) else {
            return InstanceOutcome::Skipped; // evicted since the snapshot
        };

        if !entry.is_structurally_sound() {
            tracing::error!(
                %instance_id,
                "cache entry failed structural check, evicting"
            );
            self.coordinator.cache().remove(instance_id);
            self.coordinator.sessions().invalidate(instance_id);
            return InstanceOutcome::Evicted;
        }

        let now = Utc::now();
        let threshold = Duration::seconds(self.config.refresh_threshold_secs as i64);
        if entry.time_until_expiry(now) > threshold {
            return InstanceOutcome::Skipped;
        }

        if entry.refresh_attempts >= self.config.max_attempts {
            tracing::warn!(
                %instance_id,
                attempts = entry.refresh_attempts,
                "refresh budget exhausted, evicting"
            );
            self.coordinator.cache().remove(instance_id);
            self.coordinator.sessions().invalidate(instance_id);
            return InstanceOutcome::Evicted;
        }

        match self
            .coordinator
            .refresh_instance(instance_id, &entry.service_name, RefreshKind::Background)
            .await
        {
            Ok(_) => InstanceOutcome::Refreshed,
            // Terminal failures already evicted inside the coordinator
            Err(GatewayError::TokenInvalid(_)) => InstanceOutcome::Evicted,
            Err(e) => {
                tracing::warn!(%instance_id, "background refresh failed: {}", e);
                InstanceOutcome::Failed
            }
        }
    }

    /// Refresh one instance immediately, bypassing the threshold check
    pub async fn force_refresh(&self, instance_id: Uuid) -> Result<CacheEntry> {
        let entry = self.coordinator.cache().peek(instance_id).ok_or_else(|| {
            GatewayError::not_found(format!("instance {} not cached", instance_id))
        })?;
        self.coordinator
            .refresh_instance(instance_id, &entry.service_name, RefreshKind::Background)
            .await
    }

    /// Run the invalid-entry sweep outside the normal cycle
    pub fn manual_cleanup(&self) -> usize {
        let removed = self.coordinator.cache().cleanup_invalid("manual");
        self.stats.write().entries_cleaned_up += removed as u64;
        removed
    }
}
