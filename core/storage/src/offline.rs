//! Offline database: reference-data caches and the submission queue.
//!
//! This is the only owner of persisted offline state. Callers never edit
//! submission records directly; they go through the transitions here so
//! the status invariants always hold.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use fsmonitor_common::{Error, LocalId, Result, ServerId};

use crate::schema::{
    offline_schema, ReferenceKind, Schema, CHECKLIST_ITEMS, COMPLETED_SUBMISSIONS,
    PENDING_SUBMISSIONS, USER_SESSION,
};
use crate::store::{Key, Record, RecordStore, WriteOp};
use crate::submission::{PendingSubmission, SubmissionStatus, Transition};

/// Default retention for synced submissions, in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Days a delivered submission stays in the history collection.
pub const DEFAULT_HISTORY_RETENTION_DAYS: u32 = 30;

const SESSION_KEY: &str = "current";

/// Domain operations over a [`RecordStore`].
pub struct OfflineStore {
    store: Arc<dyn RecordStore>,
    schema: Schema,
}

impl OfflineStore {
    /// Wrap a record store using the current offline schema.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_schema(store, offline_schema())
    }

    /// Wrap a record store with an explicit schema.
    pub fn with_schema(store: Arc<dyn RecordStore>, schema: Schema) -> Self {
        Self { store, schema }
    }

    /// Open the database and create missing collections.
    ///
    /// Safe to call on every start.
    pub async fn initialize(&self) -> Result<()> {
        self.store.initialize(&self.schema).await?;
        info!(
            "Offline database ready ({} backend, schema v{})",
            self.store.name(),
            self.schema.version
        );
        Ok(())
    }

    /// Underlying record store, for generic CRUD.
    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Reference data
    // ------------------------------------------------------------------

    /// Replace the cached snapshot of `kind` with `records`.
    ///
    /// Entries from the previous snapshot never survive the call.
    pub async fn cache_reference_data(&self, kind: ReferenceKind, records: Vec<Record>) -> Result<usize> {
        let count = records.len();
        self.store.replace_all(kind.collection(), records).await?;
        debug!("Cached {} {}", count, kind);
        Ok(count)
    }

    /// Read the cached snapshot of `kind`.
    pub async fn cached_reference_data(&self, kind: ReferenceKind) -> Result<Vec<Record>> {
        self.store.get_all(kind.collection()).await
    }

    /// Replace the cached items of one checklist.
    ///
    /// Each item is stamped with `checklist_id`; items of other checklists
    /// are untouched.
    pub async fn cache_checklist_items(&self, checklist_id: &Key, items: Vec<Record>) -> Result<usize> {
        let checklist_value = checklist_id.to_json();
        let existing = self
            .store
            .get_by_index(CHECKLIST_ITEMS, "checklist_id", &checklist_value)
            .await?;

        let mut ops = Vec::with_capacity(existing.len() + items.len());
        for record in existing {
            if let Some(key) = record.get("id").and_then(Key::from_json) {
                ops.push(WriteOp::delete(CHECKLIST_ITEMS, key));
            }
        }

        let count = items.len();
        for mut item in items {
            let object = item.as_object_mut().ok_or_else(|| {
                Error::InvalidInput("Checklist items must be JSON objects".to_string())
            })?;
            object.insert("checklist_id".to_string(), checklist_value.clone());
            ops.push(WriteOp::put(CHECKLIST_ITEMS, item));
        }

        self.store.transact(ops).await?;
        debug!("Cached {} items for checklist {}", count, checklist_id);
        Ok(count)
    }

    /// Cached items of one checklist.
    pub async fn checklist_items(&self, checklist_id: &Key) -> Result<Vec<Record>> {
        self.store
            .get_by_index(CHECKLIST_ITEMS, "checklist_id", &checklist_id.to_json())
            .await
    }

    // ------------------------------------------------------------------
    // Submission queue
    // ------------------------------------------------------------------

    /// Queue a submission for delivery.
    ///
    /// # Returns
    /// The local identifier assigned by the store.
    pub async fn enqueue_submission(&self, payload: Value) -> Result<LocalId> {
        let submission = PendingSubmission::new(payload, Utc::now());
        let key = self
            .store
            .put(PENDING_SUBMISSIONS, submission.to_record()?)
            .await?;
        let local_id = match key {
            Key::Int(id) => LocalId::new(id),
            Key::Text(other) => {
                return Err(Error::Storage(format!(
                    "Store assigned a non-integer submission key '{}'",
                    other
                )));
            }
        };
        info!("Saved pending submission with local id {}", local_id);
        Ok(local_id)
    }

    /// Get a submission by local id.
    pub async fn get_submission(&self, local_id: LocalId) -> Result<Option<PendingSubmission>> {
        self.store
            .get(PENDING_SUBMISSIONS, &Key::Int(local_id.get()))
            .await?
            .map(PendingSubmission::from_record)
            .transpose()
    }

    /// All queued submissions regardless of status.
    pub async fn list_submissions(&self) -> Result<Vec<PendingSubmission>> {
        self.store
            .get_all(PENDING_SUBMISSIONS)
            .await?
            .into_iter()
            .map(PendingSubmission::from_record)
            .collect()
    }

    /// Submissions with the given status.
    pub async fn list_by_status(&self, status: SubmissionStatus) -> Result<Vec<PendingSubmission>> {
        self.store
            .get_by_index(PENDING_SUBMISSIONS, "status", &status.index_value())
            .await?
            .into_iter()
            .map(PendingSubmission::from_record)
            .collect()
    }

    /// Submissions waiting for delivery. Order is not guaranteed.
    pub async fn list_pending(&self) -> Result<Vec<PendingSubmission>> {
        self.list_by_status(SubmissionStatus::Pending).await
    }

    /// Number of submissions waiting for delivery.
    pub async fn count_pending(&self) -> Result<usize> {
        self.store
            .count_by_index(
                PENDING_SUBMISSIONS,
                "status",
                &SubmissionStatus::Pending.index_value(),
            )
            .await
    }

    async fn require_submission(&self, local_id: LocalId) -> Result<PendingSubmission> {
        self.get_submission(local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Submission {} not found", local_id)))
    }

    /// Record a successful delivery.
    ///
    /// The status change and the completed copy are written atomically. On
    /// an already synced record nothing is written.
    pub async fn mark_synced(&self, local_id: LocalId, server_id: ServerId) -> Result<Transition> {
        self.mark_synced_at(local_id, server_id, Utc::now()).await
    }

    /// [`mark_synced`](Self::mark_synced) with an explicit timestamp.
    pub async fn mark_synced_at(
        &self,
        local_id: LocalId,
        server_id: ServerId,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut submission = self.require_submission(local_id).await?;

        if submission.mark_synced(server_id.clone(), now) == Transition::Unchanged {
            if submission.server_id.as_ref() != Some(&server_id) {
                warn!(
                    "Submission {} already synced as {:?}, ignoring server id {}",
                    local_id, submission.server_id, server_id
                );
            }
            return Ok(Transition::Unchanged);
        }

        let mut ops = vec![WriteOp::put(PENDING_SUBMISSIONS, submission.to_record()?)];
        if let Some(copy) = submission.completed_record()? {
            ops.push(WriteOp::put(COMPLETED_SUBMISSIONS, copy));
        }
        self.store.transact(ops).await?;

        debug!("Submission {} synced as {}", local_id, server_id);
        Ok(Transition::Applied)
    }

    /// Record a failed delivery attempt.
    pub async fn mark_failed(&self, local_id: LocalId, error: &str) -> Result<()> {
        self.mark_failed_at(local_id, error, Utc::now()).await
    }

    /// [`mark_failed`](Self::mark_failed) with an explicit timestamp.
    pub async fn mark_failed_at(&self, local_id: LocalId, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut submission = self.require_submission(local_id).await?;
        submission.mark_failed(error, now)?;
        self.store
            .put(PENDING_SUBMISSIONS, submission.to_record()?)
            .await?;
        debug!(
            "Submission {} failed (attempt {}): {}",
            local_id, submission.attempts, error
        );
        Ok(())
    }

    /// Record a delivery the server accepted without a usable answer.
    ///
    /// The record becomes failed and is excluded from automatic requeue.
    pub async fn mark_unconfirmed(&self, local_id: LocalId, error: &str) -> Result<()> {
        self.mark_unconfirmed_at(local_id, error, Utc::now()).await
    }

    /// [`mark_unconfirmed`](Self::mark_unconfirmed) with an explicit timestamp.
    pub async fn mark_unconfirmed_at(
        &self,
        local_id: LocalId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut submission = self.require_submission(local_id).await?;
        submission.mark_unconfirmed(error, now)?;
        self.store
            .put(PENDING_SUBMISSIONS, submission.to_record()?)
            .await?;
        warn!("Submission {} delivery unconfirmed: {}", local_id, error);
        Ok(())
    }

    /// Keep a payload the server accepted without a usable answer.
    ///
    /// The record is stored as an unconfirmed failure so an operator can
    /// resolve it; it is never queued for delivery.
    pub async fn record_unconfirmed(&self, payload: Value, error: &str) -> Result<LocalId> {
        let mut submission = PendingSubmission::new(payload, Utc::now());
        submission.mark_unconfirmed(error, Utc::now())?;
        let key = self
            .store
            .put(PENDING_SUBMISSIONS, submission.to_record()?)
            .await?;
        let Key::Int(id) = key else {
            return Err(Error::Storage(format!(
                "Store assigned a non-integer submission key '{}'",
                key
            )));
        };
        let local_id = LocalId::new(id);
        warn!("Saved unconfirmed submission with local id {}", local_id);
        Ok(local_id)
    }

    /// Failed submissions waiting for an operator decision.
    pub async fn list_unconfirmed(&self) -> Result<Vec<PendingSubmission>> {
        Ok(self
            .list_by_status(SubmissionStatus::Failed)
            .await?
            .into_iter()
            .filter(PendingSubmission::needs_review)
            .collect())
    }

    /// Return one failed submission to pending, even an unconfirmed one.
    ///
    /// # Errors
    /// - `NotFound` when the submission does not exist
    pub async fn requeue_submission(&self, local_id: LocalId) -> Result<Transition> {
        let mut submission = self.require_submission(local_id).await?;
        let transition = submission.force_requeue();
        if transition == Transition::Applied {
            self.store
                .put(PENDING_SUBMISSIONS, submission.to_record()?)
                .await?;
            info!("Requeued submission {}", local_id);
        }
        Ok(transition)
    }

    /// Move failed submissions accepted by `should_requeue` back to pending.
    ///
    /// Unconfirmed submissions are never moved.
    ///
    /// # Returns
    /// Local ids of the requeued submissions.
    pub async fn requeue_failed<F>(&self, should_requeue: F) -> Result<Vec<LocalId>>
    where
        F: Fn(&PendingSubmission) -> bool + Send,
    {
        let failed = self.list_by_status(SubmissionStatus::Failed).await?;
        let mut ops = Vec::new();
        let mut requeued = Vec::new();

        for mut submission in failed {
            if !should_requeue(&submission) {
                continue;
            }
            if submission.requeue() == Transition::Applied {
                requeued.push(submission.id()?);
                ops.push(WriteOp::put(PENDING_SUBMISSIONS, submission.to_record()?));
            }
        }

        if !ops.is_empty() {
            self.store.transact(ops).await?;
            info!("Requeued {} failed submissions", requeued.len());
        }
        Ok(requeued)
    }

    /// Delete synced submissions older than `days`.
    pub async fn purge_synced_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        self.purge_synced_before(cutoff).await
    }

    /// Delete synced submissions whose `synced_at` is strictly before `cutoff`.
    ///
    /// Pending and failed submissions are never touched.
    pub async fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let synced = self.list_by_status(SubmissionStatus::Synced).await?;
        let mut ops = Vec::new();
        for submission in synced {
            let expired = submission.synced_at.is_some_and(|at| at < cutoff);
            if expired && submission.status == SubmissionStatus::Synced {
                ops.push(WriteOp::delete(
                    PENDING_SUBMISSIONS,
                    Key::Int(submission.id()?.get()),
                ));
            }
        }

        let removed = ops.len();
        if removed > 0 {
            self.store.transact(ops).await?;
        }
        info!("Cleaned up {} old synced submissions", removed);
        Ok(removed)
    }

    /// Delete history entries older than `days`.
    pub async fn purge_history_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        self.purge_history_before(cutoff).await
    }

    /// Delete completed copies whose `synced_at` is strictly before `cutoff`.
    pub async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut ops = Vec::new();
        for record in self.store.get_all(COMPLETED_SUBMISSIONS).await? {
            let synced_at = record
                .get("synced_at")
                .cloned()
                .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok());
            let Some(synced_at) = synced_at else {
                warn!("History entry without a valid synced_at: {}", record);
                continue;
            };
            if synced_at < cutoff {
                if let Some(key) = record.get("id").and_then(Key::from_json) {
                    ops.push(WriteOp::delete(COMPLETED_SUBMISSIONS, key));
                }
            }
        }

        let removed = ops.len();
        if removed > 0 {
            self.store.transact(ops).await?;
        }
        debug!("Removed {} history entries", removed);
        Ok(removed)
    }

    /// History of delivered submissions.
    pub async fn completed_submissions(&self) -> Result<Vec<Record>> {
        self.store.get_all(COMPLETED_SUBMISSIONS).await
    }

    // ------------------------------------------------------------------
    // Session cache
    // ------------------------------------------------------------------

    /// Cache the signed-in user's session.
    pub async fn save_session(&self, session: Value) -> Result<()> {
        let Value::Object(mut fields) = session else {
            return Err(Error::InvalidInput("Session must be a JSON object".to_string()));
        };
        fields.insert("key".to_string(), Value::from(SESSION_KEY));
        self.store.put(USER_SESSION, Value::Object(fields)).await?;
        Ok(())
    }

    /// Cached session, if any.
    pub async fn session(&self) -> Result<Option<Value>> {
        self.store.get(USER_SESSION, &Key::from(SESSION_KEY)).await
    }

    /// Forget the cached session.
    pub async fn clear_session(&self) -> Result<()> {
        self.store.delete(USER_SESSION, &Key::from(SESSION_KEY)).await
    }
}
