//! Requeue policy with exponential backoff for failed submissions.
//!
//! The sync engine never retries on its own: a failed submission stays
//! failed until this policy (or an operator) moves it back to pending.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use fsmonitor_common::{LocalId, Result};
use fsmonitor_storage::{OfflineStore, PendingSubmission, SubmissionStatus};

/// Configuration for requeueing failed submissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequeuePolicy {
    /// Submissions with this many failed attempts stay failed.
    pub max_attempts: u32,
    /// Delay after the first failure.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RequeuePolicy {
    /// Create a new policy allowing `max_attempts` failed deliveries.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the wait after failed attempt number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Whether `submission` should go back to pending at `now`.
    ///
    /// Only failed submissions under the attempt cap qualify, and only once
    /// the backoff delay since their last failed attempt has elapsed.
    /// Unconfirmed submissions never qualify.
    pub fn should_requeue(&self, submission: &PendingSubmission, now: DateTime<Utc>) -> bool {
        if submission.status != SubmissionStatus::Failed || submission.unconfirmed {
            return false;
        }
        if submission.attempts >= self.max_attempts {
            return false;
        }
        let Some(last_attempt) = submission.last_attempt_at else {
            return true;
        };
        let delay = self.delay_for_attempt(submission.attempts.saturating_sub(1));
        (now - last_attempt)
            .to_std()
            .map(|elapsed| elapsed >= delay)
            .unwrap_or(false)
    }

    /// Requeue every failed submission the policy accepts at `now`.
    pub async fn apply(&self, store: &OfflineStore, now: DateTime<Utc>) -> Result<Vec<LocalId>> {
        let requeued = store
            .requeue_failed(|submission| self.should_requeue(submission, now))
            .await?;
        if !requeued.is_empty() {
            debug!("Requeue policy moved {} submissions to pending", requeued.len());
        }
        Ok(requeued)
    }
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
