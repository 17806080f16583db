//! In-memory remote service with scripted answers (for testing and demos).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use fsmonitor_common::{Error, Result, ServerId};
use fsmonitor_storage::{Key, Record, ReferenceKind};

use crate::transport::RemoteService;

/// Scripted answer to one `submit` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitScript {
    /// 2xx with the given id.
    Accept(ServerId),
    /// Non-2xx with the given status code.
    Reject(u16),
    /// Transport failure.
    Unreachable,
    /// 2xx whose body carries no id.
    AcceptedWithoutId,
}

#[derive(Default)]
struct ScriptState {
    submit_script: VecDeque<SubmitScript>,
    next_id: i64,
    submitted: Vec<Value>,
    reference: HashMap<ReferenceKind, Vec<Record>>,
    failing: HashSet<ReferenceKind>,
    checklist_items: HashMap<Key, Vec<Record>>,
    reference_fetches: usize,
}

/// [`RemoteService`] answering from an in-memory script.
///
/// Submissions without a scripted answer are accepted with increasing ids
/// starting at 1. Reference kinds without data answer with an empty array.
pub struct ScriptedRemote {
    state: Mutex<ScriptState>,
    latency: Duration,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                next_id: 1,
                ..ScriptState::default()
            }),
            latency: Duration::ZERO,
        }
    }

    /// Delay every call by `latency`, so calls suspend like real I/O.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue answers for the next `submit` calls, in order.
    pub fn script_submits(&self, answers: impl IntoIterator<Item = SubmitScript>) {
        self.lock().submit_script.extend(answers);
    }

    pub fn set_reference(&self, kind: ReferenceKind, records: Vec<Record>) {
        let mut state = self.lock();
        state.failing.remove(&kind);
        state.reference.insert(kind, records);
    }

    /// Make fetches of `kind` fail with a server error.
    pub fn fail_reference(&self, kind: ReferenceKind) {
        self.lock().failing.insert(kind);
    }

    pub fn set_checklist_items(&self, checklist_id: Key, items: Vec<Record>) {
        self.lock().checklist_items.insert(checklist_id, items);
    }

    /// Payloads received by `submit`, including rejected ones.
    pub fn submitted(&self) -> Vec<Value> {
        self.lock().submitted.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.lock().submitted.len()
    }

    /// Number of reference and checklist item fetches served.
    pub fn reference_fetches(&self) -> usize {
        self.lock().reference_fetches
    }

    async fn wait(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for ScriptedRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteService for ScriptedRemote {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, payload: &Value) -> Result<ServerId> {
        self.wait().await;
        let mut state = self.lock();
        state.submitted.push(payload.clone());

        let answer = match state.submit_script.pop_front() {
            Some(answer) => answer,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                SubmitScript::Accept(ServerId::from(id))
            }
        };

        match answer {
            SubmitScript::Accept(id) => Ok(id),
            SubmitScript::Reject(status) => {
                Err(Error::Delivery(format!("Server returned {}", status)))
            }
            SubmitScript::Unreachable => Err(Error::Network("Connection refused".to_string())),
            SubmitScript::AcceptedWithoutId => {
                Err(Error::Unconfirmed("Response has no 'id' field".to_string()))
            }
        }
    }

    async fn fetch_reference(&self, kind: ReferenceKind) -> Result<Vec<Record>> {
        self.wait().await;
        let mut state = self.lock();
        state.reference_fetches += 1;
        if state.failing.contains(&kind) {
            return Err(Error::Delivery("Server returned 500".to_string()));
        }
        Ok(state.reference.get(&kind).cloned().unwrap_or_default())
    }

    async fn fetch_checklist_items(&self, checklist_id: &Key) -> Result<Vec<Record>> {
        self.wait().await;
        let mut state = self.lock();
        state.reference_fetches += 1;
        if state.failing.contains(&ReferenceKind::ChecklistItems) {
            return Err(Error::Delivery("Server returned 500".to_string()));
        }
        Ok(state
            .checklist_items
            .get(checklist_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unscripted_submits_are_accepted() {
        let remote = ScriptedRemote::new();
        assert_eq!(remote.submit(&json!({})).await.unwrap(), ServerId::from(1));
        assert_eq!(remote.submit(&json!({})).await.unwrap(), ServerId::from(2));
        assert_eq!(remote.submit_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_answers_in_order() {
        let remote = ScriptedRemote::new();
        remote.script_submits([
            SubmitScript::Reject(500),
            SubmitScript::Unreachable,
            SubmitScript::AcceptedWithoutId,
        ]);

        assert!(matches!(remote.submit(&json!({})).await, Err(Error::Delivery(_))));
        assert!(matches!(remote.submit(&json!({})).await, Err(Error::Network(_))));
        assert!(matches!(remote.submit(&json!({})).await, Err(Error::Unconfirmed(_))));
        assert!(remote.submit(&json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_reference_failure_toggle() {
        let remote = ScriptedRemote::new();
        remote.fail_reference(ReferenceKind::Stores);
        assert!(remote.fetch_reference(ReferenceKind::Stores).await.is_err());

        remote.set_reference(ReferenceKind::Stores, vec![json!({"id": 1})]);
        assert_eq!(remote.fetch_reference(ReferenceKind::Stores).await.unwrap().len(), 1);
        assert_eq!(remote.reference_fetches(), 2);
    }
}
