//! Core sync engine: delivers queued submissions and refreshes reference data.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use fsmonitor_common::{Error, Result};
use fsmonitor_storage::{
    Key, OfflineStore, ReferenceKind, DEFAULT_HISTORY_RETENTION_DAYS, DEFAULT_RETENTION_DAYS,
};

use crate::events::{EventStatus, StatusBus, SyncEvent};
use crate::transport::RemoteService;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Synced submissions older than this many days are purged after a pass.
    pub retention_days: u32,
    /// Delivery history older than this many days is purged after a pass.
    pub history_retention_days: u32,
    /// Whether refresh also downloads the items of every checklist.
    pub refresh_checklist_items: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            history_retention_days: DEFAULT_HISTORY_RETENTION_DAYS,
            refresh_checklist_items: true,
        }
    }
}

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
}

/// Summary of a completed pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub pass_id: Uuid,
    pub synced: usize,
    pub failed: usize,
    /// Accepted by the server without a usable answer; held for review.
    pub unconfirmed: usize,
    /// Synced submissions removed by the retention purge, if it succeeded.
    pub purged: Option<usize>,
    pub duration: Duration,
}

/// Result of [`SyncEngine::sync_pending`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Another pass was running, or the engine is offline.
    Skipped(SkipReason),
    /// Nothing was pending.
    Idle,
    Completed(SyncReport),
    /// A store failure stopped the pass.
    Aborted(String),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Summary of a reference-data refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Record counts per refreshed kind.
    pub cached: Vec<(ReferenceKind, usize)>,
    /// Checklist items cached across all checklists.
    pub checklist_items: usize,
    /// Fetches that failed; their stale cache stays in effect.
    pub failures: Vec<String>,
}

/// Result of [`SyncEngine::refresh_reference_data`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Skipped(SkipReason),
    Completed(RefreshReport),
    Aborted(String),
}

/// Snapshot returned by [`SyncEngine::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: usize,
    /// Failed submissions that need an operator decision.
    pub unconfirmed_count: usize,
}

/// Releases the syncing flag on drop.
struct SyncGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Engine delivering queued submissions to the server.
///
/// At most one pass runs at a time per engine. Items are processed strictly
/// one after another.
pub struct SyncEngine {
    store: Arc<OfflineStore>,
    remote: Arc<dyn RemoteService>,
    bus: StatusBus,
    online: AtomicBool,
    syncing: AtomicBool,
    config: SyncConfig,
}

impl SyncEngine {
    /// Create a new engine. It starts out online.
    pub fn new(
        store: Arc<OfflineStore>,
        remote: Arc<dyn RemoteService>,
        bus: StatusBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            bus,
            online: AtomicBool::new(true),
            syncing: AtomicBool::new(false),
            config,
        }
    }

    pub fn store(&self) -> &Arc<OfflineStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteService> {
        &self.remote
    }

    pub fn bus(&self) -> &StatusBus {
        &self.bus
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Record the connectivity state.
    ///
    /// # Returns
    /// The previous state.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::AcqRel)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Current connectivity, pass state and queue length.
    pub async fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            is_online: self.is_online(),
            is_syncing: self.is_syncing(),
            pending_count: self.store.count_pending().await?,
            unconfirmed_count: self.store.list_unconfirmed().await?.len(),
        })
    }

    /// Deliver every pending submission once.
    ///
    /// Delivery failures are recorded per item and never abort the pass; a
    /// store failure does. Returns `Skipped` without side effects when a
    /// pass is already running or the engine is offline.
    pub async fn sync_pending(&self) -> SyncOutcome {
        // The flag is taken before the first await so concurrent callers
        // observe it immediately.
        let Some(_guard) = SyncGuard::acquire(&self.syncing) else {
            debug!("Sync pass already running, skipping");
            return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
        };
        if !self.is_online() {
            debug!("Offline, skipping sync pass");
            return SyncOutcome::Skipped(SkipReason::Offline);
        }

        let pass_id = Uuid::new_v4();
        self.run_pass(pass_id)
            .instrument(info_span!("sync_pass", %pass_id))
            .await
    }

    async fn run_pass(&self, pass_id: Uuid) -> SyncOutcome {
        let start = Instant::now();
        self.bus.notify(EventStatus::Syncing, "Syncing offline data...");

        let pending = match self.store.list_pending().await {
            Ok(pending) => pending,
            Err(e) => return self.abort_pass(e),
        };

        if pending.is_empty() {
            info!("No pending submissions to sync");
            self.bus.notify(EventStatus::Idle, "All data synced");
            return SyncOutcome::Idle;
        }

        info!("Syncing {} pending submissions", pending.len());
        let mut synced = 0;
        let mut failed = 0;
        let mut unconfirmed = 0;

        for submission in pending {
            let local_id = match submission.id() {
                Ok(id) => id,
                Err(e) => return self.abort_pass(e),
            };

            match self.remote.submit(&submission.payload).await {
                Ok(server_id) => match self.store.mark_synced(local_id, server_id.clone()).await {
                    Ok(_) => {
                        synced += 1;
                        info!("Synced submission {} as server id {}", local_id, server_id);
                    }
                    Err(Error::NotFound(_)) => {
                        warn!("Submission {} disappeared during sync", local_id);
                    }
                    Err(e) => return self.abort_pass(e),
                },
                Err(Error::Unconfirmed(reason)) => {
                    error!(
                        "Submission {} was accepted without a usable answer: {}",
                        local_id, reason
                    );
                    match self.store.mark_unconfirmed(local_id, &reason).await {
                        Ok(()) => unconfirmed += 1,
                        Err(e @ (Error::NotFound(_) | Error::Conflict(_))) => {
                            warn!("Could not record outcome of {}: {}", local_id, e);
                        }
                        Err(e) => return self.abort_pass(e),
                    }
                }
                Err(delivery_err) => {
                    warn!("Failed to sync submission {}: {}", local_id, delivery_err);
                    match self.store.mark_failed(local_id, &delivery_err.to_string()).await {
                        Ok(()) => failed += 1,
                        Err(e @ (Error::NotFound(_) | Error::Conflict(_))) => {
                            warn!("Could not record failure of {}: {}", local_id, e);
                        }
                        Err(e) => return self.abort_pass(e),
                    }
                }
            }
        }

        self.bus.publish(
            SyncEvent::new(EventStatus::Complete, format!("Synced {} submissions", synced))
                .with_data(json!({
                    "synced": synced,
                    "failed": failed,
                    "unconfirmed": unconfirmed,
                })),
        );

        let purged = match self
            .store
            .purge_synced_older_than(self.config.retention_days)
            .await
        {
            Ok(removed) => Some(removed),
            Err(e) => {
                warn!("Retention purge failed: {}", e);
                None
            }
        };
        if let Err(e) = self
            .store
            .purge_history_older_than(self.config.history_retention_days)
            .await
        {
            warn!("History purge failed: {}", e);
        }

        let duration = start.elapsed();
        info!(
            "Sync pass completed in {:?}: {} synced, {} failed, {} unconfirmed",
            duration, synced, failed, unconfirmed
        );

        SyncOutcome::Completed(SyncReport {
            pass_id,
            synced,
            failed,
            unconfirmed,
            purged,
            duration,
        })
    }

    fn abort_pass(&self, err: Error) -> SyncOutcome {
        error!("Sync failed: {}", err);
        self.bus.publish(
            SyncEvent::new(EventStatus::Error, "Sync failed")
                .with_data(json!({ "error": err.to_string() })),
        );
        SyncOutcome::Aborted(err.to_string())
    }

    /// Download reference data for offline use.
    ///
    /// Each failed fetch is logged and skipped so the previous snapshot of
    /// that kind stays cached. Checklist items are refreshed for the
    /// checklists fetched in this run only.
    pub async fn refresh_reference_data(&self) -> RefreshOutcome {
        if !self.is_online() {
            info!("Cannot cache data - offline");
            return RefreshOutcome::Skipped(SkipReason::Offline);
        }

        self.bus
            .notify(EventStatus::Caching, "Downloading data for offline use...");

        match self.refresh_all().await {
            Ok(report) => {
                info!(
                    "Data cached for offline use ({} kinds, {} checklist items, {} failures)",
                    report.cached.len(),
                    report.checklist_items,
                    report.failures.len()
                );
                self.bus.publish(
                    SyncEvent::new(EventStatus::Cached, "Data ready for offline use").with_data(
                        json!({
                            "checklist_items": report.checklist_items,
                            "failures": report.failures.len(),
                        }),
                    ),
                );
                RefreshOutcome::Completed(report)
            }
            Err(e) => {
                error!("Failed to cache data: {}", e);
                self.bus
                    .notify(EventStatus::Error, "Failed to download offline data");
                RefreshOutcome::Aborted(e.to_string())
            }
        }
    }

    async fn refresh_all(&self) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();
        let mut checklists = Vec::new();

        for kind in ReferenceKind::WHOLESALE {
            let records = match self.remote.fetch_reference(kind).await {
                Ok(records) => records,
                Err(e) => {
                    warn!("Failed to refresh {}: {}", kind, e);
                    report.failures.push(format!("{}: {}", kind, e));
                    continue;
                }
            };
            if kind == ReferenceKind::Checklists {
                checklists = records.clone();
            }
            match self.store.cache_reference_data(kind, records).await {
                Ok(count) => report.cached.push((kind, count)),
                Err(e @ Error::InvalidInput(_)) => {
                    warn!("Server sent unusable {}: {}", kind, e);
                    report.failures.push(format!("{}: {}", kind, e));
                    if kind == ReferenceKind::Checklists {
                        checklists.clear();
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if !self.config.refresh_checklist_items {
            return Ok(report);
        }

        for checklist in &checklists {
            let Some(checklist_id) = checklist.get("id").and_then(Key::from_json) else {
                continue;
            };
            let items = match self.remote.fetch_checklist_items(&checklist_id).await {
                Ok(items) => items,
                Err(e) => {
                    warn!("Failed to refresh items of checklist {}: {}", checklist_id, e);
                    report
                        .failures
                        .push(format!("checklist {} items: {}", checklist_id, e));
                    continue;
                }
            };
            match self.store.cache_checklist_items(&checklist_id, items).await {
                Ok(count) => report.checklist_items += count,
                Err(e @ Error::InvalidInput(_)) => {
                    warn!("Server sent unusable items for checklist {}: {}", checklist_id, e);
                    report
                        .failures
                        .push(format!("checklist {} items: {}", checklist_id, e));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedRemote, SubmitScript};
    use fsmonitor_common::ServerId;
    use fsmonitor_storage::{MemoryStore, SubmissionStatus};
    use serde_json::json;
    use tokio::sync::broadcast;

    async fn engine_with(remote: Arc<ScriptedRemote>) -> SyncEngine {
        let store = OfflineStore::new(Arc::new(MemoryStore::new()));
        store.initialize().await.unwrap();
        SyncEngine::new(
            Arc::new(store),
            remote,
            StatusBus::default(),
            SyncConfig::default(),
        )
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<EventStatus> {
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            statuses.push(event.status);
        }
        statuses
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let engine = engine_with(Arc::new(ScriptedRemote::new())).await;
        let mut rx = engine.bus().subscribe();

        assert_eq!(engine.sync_pending().await, SyncOutcome::Idle);
        assert_eq!(drain(&mut rx), vec![EventStatus::Syncing, EventStatus::Idle]);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_offline_pass_is_skipped() {
        let remote = Arc::new(ScriptedRemote::new());
        let engine = engine_with(remote.clone()).await;
        engine.store().enqueue_submission(json!({})).await.unwrap();
        engine.set_online(false);
        let mut rx = engine.bus().subscribe();

        assert_eq!(
            engine.sync_pending().await,
            SyncOutcome::Skipped(SkipReason::Offline)
        );
        assert!(drain(&mut rx).is_empty());
        assert_eq!(remote.submit_count(), 0);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_failures_are_recorded_per_item() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.script_submits([SubmitScript::Unreachable, SubmitScript::Accept(ServerId::from(7))]);
        let engine = engine_with(remote.clone()).await;
        let first = engine.store().enqueue_submission(json!({"n": 1})).await.unwrap();
        let second = engine.store().enqueue_submission(json!({"n": 2})).await.unwrap();

        let outcome = engine.sync_pending().await;
        let report = outcome.report().unwrap();
        assert_eq!((report.synced, report.failed), (1, 1));
        assert_eq!(report.purged, Some(0));

        let first = engine.store().get_submission(first).await.unwrap().unwrap();
        assert_eq!(first.status, SubmissionStatus::Failed);
        assert_eq!(first.last_error.as_deref(), Some("Network error: Connection refused"));
        let second = engine.store().get_submission(second).await.unwrap().unwrap();
        assert_eq!(second.server_id, Some(ServerId::from(7)));
    }

    #[tokio::test]
    async fn test_accepted_without_id_is_held_for_review() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.script_submits([SubmitScript::AcceptedWithoutId]);
        let engine = engine_with(remote.clone()).await;
        let id = engine.store().enqueue_submission(json!({"n": 1})).await.unwrap();
        let mut rx = engine.bus().subscribe();

        let outcome = engine.sync_pending().await;
        let report = outcome.report().unwrap();
        assert_eq!((report.synced, report.failed, report.unconfirmed), (0, 0, 1));
        let complete = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|event| event.status == EventStatus::Complete)
            .unwrap();
        assert_eq!(
            complete.data,
            Some(json!({"synced": 0, "failed": 0, "unconfirmed": 1}))
        );

        let record = engine.store().get_submission(id).await.unwrap().unwrap();
        assert!(record.needs_review());
        assert_eq!(engine.status().await.unwrap().unconfirmed_count, 1);

        // Nothing is pending, so the next pass does not resend it.
        assert_eq!(engine.sync_pending().await, SyncOutcome::Idle);
        assert_eq!(remote.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_and_releases_the_pass() {
        let remote = Arc::new(ScriptedRemote::new());
        // Never initialized, so every read fails.
        let store = OfflineStore::new(Arc::new(MemoryStore::new()));
        let engine = SyncEngine::new(
            Arc::new(store),
            remote.clone(),
            StatusBus::default(),
            SyncConfig::default(),
        );
        let mut rx = engine.bus().subscribe();

        let outcome = engine.sync_pending().await;
        assert!(matches!(outcome, SyncOutcome::Aborted(ref reason) if reason.contains("Storage")));
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let statuses: Vec<_> = events.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![EventStatus::Syncing, EventStatus::Error]);
        assert!(events[1].data.as_ref().unwrap()["error"].is_string());
        assert!(!engine.is_syncing());

        // The guard was released, so the next call runs instead of skipping.
        assert!(matches!(engine.sync_pending().await, SyncOutcome::Aborted(_)));
        assert_eq!(remote.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_pass_purges_old_history() {
        let engine = engine_with(Arc::new(ScriptedRemote::new())).await;
        let old = engine.store().enqueue_submission(json!({"n": 1})).await.unwrap();
        engine
            .store()
            .mark_synced_at(old, ServerId::from(5), chrono::Utc::now() - chrono::Duration::days(90))
            .await
            .unwrap();
        engine.store().enqueue_submission(json!({"n": 2})).await.unwrap();

        assert!(engine.sync_pending().await.report().is_some());
        let history = engine.store().completed_submissions().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_ne!(history[0]["id"], "5");
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let engine = engine_with(Arc::new(ScriptedRemote::new())).await;
        engine.store().enqueue_submission(json!({})).await.unwrap();

        let status = engine.status().await.unwrap();
        assert_eq!(
            status,
            SyncStatus {
                is_online: true,
                is_syncing: false,
                pending_count: 1,
                unconfirmed_count: 0,
            }
        );
        assert!(engine.set_online(false));
        assert!(!engine.status().await.unwrap().is_online);
    }

    #[tokio::test]
    async fn test_refresh_keeps_stale_cache_on_failure() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_reference(ReferenceKind::Stores, vec![json!({"id": 1}), json!({"id": 2})]);
        remote.set_reference(ReferenceKind::Checklists, vec![json!({"id": 10})]);
        remote.set_checklist_items(Key::Int(10), vec![json!({"id": 100}), json!({"id": 101})]);
        let engine = engine_with(remote.clone()).await;
        let mut rx = engine.bus().subscribe();

        let RefreshOutcome::Completed(report) = engine.refresh_reference_data().await else {
            panic!("refresh did not complete");
        };
        assert!(report.failures.is_empty());
        assert_eq!(report.checklist_items, 2);
        assert_eq!(drain(&mut rx), vec![EventStatus::Caching, EventStatus::Cached]);

        remote.fail_reference(ReferenceKind::Stores);
        let RefreshOutcome::Completed(report) = engine.refresh_reference_data().await else {
            panic!("refresh did not complete");
        };
        assert_eq!(report.failures.len(), 1);
        let stores = engine
            .store()
            .cached_reference_data(ReferenceKind::Stores)
            .await
            .unwrap();
        assert_eq!(stores.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_skipped_offline() {
        let remote = Arc::new(ScriptedRemote::new());
        let engine = engine_with(remote.clone()).await;
        engine.set_online(false);

        assert_eq!(
            engine.refresh_reference_data().await,
            RefreshOutcome::Skipped(SkipReason::Offline)
        );
        assert_eq!(remote.reference_fetches(), 0);
    }
}
