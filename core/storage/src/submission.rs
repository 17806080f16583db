//! Queued submission records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use fsmonitor_common::{Error, LocalId, Result, ServerId};

use crate::store::Record;

/// Lifecycle status of a queued submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Waiting for delivery.
    Pending,
    /// Acknowledged by the server.
    Synced,
    /// Last delivery attempt failed; eligible for requeue.
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Synced => "synced",
            SubmissionStatus::Failed => "failed",
        }
    }

    /// Value stored in the `status` index.
    pub fn index_value(&self) -> Value {
        Value::from(self.as_str())
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of applying a transition to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record changed and must be written back.
    Applied,
    /// The record already was in the target state.
    Unchanged,
}

/// A domain submission awaiting (or past) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSubmission {
    /// Assigned by the store on insert.
    pub local_id: Option<LocalId>,
    /// Opaque domain payload, delivered verbatim.
    pub payload: Value,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub server_id: Option<ServerId>,
    pub synced_at: Option<DateTime<Utc>>,
    /// Time of the most recent failed attempt.
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// The server accepted a delivery without a usable answer. Such
    /// records are never resent automatically.
    #[serde(default)]
    pub unconfirmed: bool,
}

impl PendingSubmission {
    /// Create a new pending submission for `payload`.
    pub fn new(payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            local_id: None,
            payload,
            status: SubmissionStatus::Pending,
            created_at: now,
            last_error: None,
            attempts: 0,
            server_id: None,
            synced_at: None,
            last_attempt_at: None,
            unconfirmed: false,
        }
    }

    /// Store-assigned identifier.
    ///
    /// # Errors
    /// - Record was never persisted
    pub fn id(&self) -> Result<LocalId> {
        self.local_id
            .ok_or_else(|| Error::InvalidInput("Submission has no local id".to_string()))
    }

    /// Mark as delivered.
    ///
    /// Pending and failed records move to synced. A record that is already
    /// synced is left untouched.
    pub fn mark_synced(&mut self, server_id: ServerId, now: DateTime<Utc>) -> Transition {
        if self.status == SubmissionStatus::Synced {
            return Transition::Unchanged;
        }
        self.status = SubmissionStatus::Synced;
        self.server_id = Some(server_id);
        self.synced_at = Some(now);
        self.last_error = None;
        self.unconfirmed = false;
        Transition::Applied
    }

    /// Record a failed delivery attempt.
    ///
    /// # Errors
    /// - Record is already synced
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status == SubmissionStatus::Synced {
            return Err(Error::Conflict(format!(
                "Submission {} is already synced",
                self.local_id.map(|id| id.to_string()).unwrap_or_default()
            )));
        }
        self.status = SubmissionStatus::Failed;
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// Record a delivery the server accepted without a usable answer.
    ///
    /// # Errors
    /// - Record is already synced
    pub fn mark_unconfirmed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.mark_failed(error, now)?;
        self.unconfirmed = true;
        Ok(())
    }

    /// Whether an operator has to decide what happens to this record.
    pub fn needs_review(&self) -> bool {
        self.status == SubmissionStatus::Failed && self.unconfirmed
    }

    /// Return a failed record to the pending queue, keeping its attempt count.
    ///
    /// Unconfirmed records stay failed; see [`force_requeue`](Self::force_requeue).
    pub fn requeue(&mut self) -> Transition {
        if self.status != SubmissionStatus::Failed || self.unconfirmed {
            return Transition::Unchanged;
        }
        self.status = SubmissionStatus::Pending;
        Transition::Applied
    }

    /// Return any failed record to the pending queue, unconfirmed or not.
    pub fn force_requeue(&mut self) -> Transition {
        if self.status != SubmissionStatus::Failed {
            return Transition::Unchanged;
        }
        self.unconfirmed = false;
        self.status = SubmissionStatus::Pending;
        Transition::Applied
    }

    /// Whether the status/server id invariant holds.
    pub fn is_consistent(&self) -> bool {
        (self.status == SubmissionStatus::Synced) == self.server_id.is_some()
    }

    /// Convert to a store record.
    ///
    /// An unassigned local id is omitted so the store allocates one.
    pub fn to_record(&self) -> Result<Record> {
        let mut record = serde_json::to_value(self)?;
        if self.local_id.is_none() {
            if let Some(object) = record.as_object_mut() {
                object.remove("local_id");
            }
        }
        Ok(record)
    }

    /// Parse a store record.
    pub fn from_record(record: Record) -> Result<Self> {
        serde_json::from_value(record)
            .map_err(|e| Error::Storage(format!("Corrupted submission record: {}", e)))
    }

    /// Read-optimized copy written to the completed history on sync.
    pub fn completed_record(&self) -> Result<Option<Record>> {
        let (Some(server_id), Some(synced_at)) = (&self.server_id, self.synced_at) else {
            return Ok(None);
        };
        Ok(Some(serde_json::json!({
            "id": server_id,
            "local_id": self.local_id,
            "payload": self.payload,
            "created_at": self.created_at,
            "synced_at": synced_at,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission() -> PendingSubmission {
        let mut s = PendingSubmission::new(json!({"storeId": 3}), Utc::now());
        s.local_id = Some(LocalId::new(1));
        s
    }

    #[test]
    fn test_new_submission_is_pending() {
        let s = submission();
        assert_eq!(s.status, SubmissionStatus::Pending);
        assert_eq!(s.attempts, 0);
        assert!(s.is_consistent());
    }

    #[test]
    fn test_mark_synced_is_idempotent() {
        let mut s = submission();
        assert_eq!(s.mark_synced(ServerId::from(99), Utc::now()), Transition::Applied);
        let first_synced_at = s.synced_at;

        assert_eq!(s.mark_synced(ServerId::from(99), Utc::now()), Transition::Unchanged);
        assert_eq!(s.server_id, Some(ServerId::from(99)));
        assert_eq!(s.synced_at, first_synced_at);
        assert!(s.is_consistent());
    }

    #[test]
    fn test_failed_increments_attempts_and_keeps_payload() {
        let mut s = submission();
        s.mark_failed("Server returned 500", Utc::now()).unwrap();
        s.mark_failed("connection refused", Utc::now()).unwrap();

        assert_eq!(s.status, SubmissionStatus::Failed);
        assert_eq!(s.attempts, 2);
        assert_eq!(s.last_error.as_deref(), Some("connection refused"));
        assert_eq!(s.payload, json!({"storeId": 3}));
        assert!(s.is_consistent());
    }

    #[test]
    fn test_cannot_fail_synced_record() {
        let mut s = submission();
        s.mark_synced(ServerId::from(1), Utc::now());
        assert!(matches!(s.mark_failed("late", Utc::now()), Err(Error::Conflict(_))));
        assert_eq!(s.attempts, 0);
    }

    #[test]
    fn test_requeue_only_from_failed() {
        let mut s = submission();
        assert_eq!(s.requeue(), Transition::Unchanged);

        s.mark_failed("timeout", Utc::now()).unwrap();
        assert_eq!(s.requeue(), Transition::Applied);
        assert_eq!(s.status, SubmissionStatus::Pending);
        assert_eq!(s.attempts, 1);
    }

    #[test]
    fn test_unconfirmed_needs_explicit_requeue() {
        let mut s = submission();
        s.mark_unconfirmed("Response has no 'id' field", Utc::now()).unwrap();
        assert_eq!(s.status, SubmissionStatus::Failed);
        assert_eq!(s.attempts, 1);
        assert!(s.needs_review());

        assert_eq!(s.requeue(), Transition::Unchanged);
        assert_eq!(s.status, SubmissionStatus::Failed);

        assert_eq!(s.force_requeue(), Transition::Applied);
        assert_eq!(s.status, SubmissionStatus::Pending);
        assert!(!s.needs_review());
    }

    #[test]
    fn test_sync_clears_unconfirmed() {
        let mut s = submission();
        s.mark_unconfirmed("Failed to parse response", Utc::now()).unwrap();
        assert_eq!(s.mark_synced(ServerId::from(8), Utc::now()), Transition::Applied);
        assert!(!s.unconfirmed);
        assert!(!s.needs_review());
    }

    #[test]
    fn test_records_without_flag_still_parse() {
        let record = json!({
            "local_id": 3,
            "payload": {},
            "status": "failed",
            "created_at": "2026-01-05T10:00:00Z",
            "last_error": "timeout",
            "attempts": 1,
            "server_id": null,
            "synced_at": null
        });
        let s = PendingSubmission::from_record(record).unwrap();
        assert!(!s.unconfirmed);
        assert_eq!(s.last_attempt_at, None);
    }

    #[test]
    fn test_unsaved_record_omits_local_id() {
        let s = PendingSubmission::new(json!({}), Utc::now());
        let record = s.to_record().unwrap();
        assert!(record.get("local_id").is_none());
        assert_eq!(record["status"], "pending");
    }

    #[test]
    fn test_completed_record_requires_sync() {
        let mut s = submission();
        assert!(s.completed_record().unwrap().is_none());

        s.mark_synced(ServerId::from(42), Utc::now());
        let copy = s.completed_record().unwrap().unwrap();
        assert_eq!(copy["id"], "42");
        assert_eq!(copy["local_id"], 1);
    }
}
