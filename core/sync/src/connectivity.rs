//! Connectivity and lifecycle coordination.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fsmonitor_common::{Error, LocalId, Result, ServerId};

use crate::engine::{SyncEngine, SyncOutcome};
use crate::events::EventStatus;
use crate::scheduler::{BackgroundSync, SYNC_TAG};

/// Network reachability as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

/// Result of [`Coordinator::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// The server accepted the submission directly.
    Delivered(ServerId),
    /// Saved offline; it will be delivered by a later pass.
    Queued(LocalId),
    /// The server took it without a usable answer. Saved for review and
    /// never resent automatically.
    Unconfirmed(LocalId),
}

/// Reacts to connectivity changes and exposes the user-facing sync actions.
pub struct Coordinator {
    engine: Arc<SyncEngine>,
    background: Option<BackgroundSync>,
}

impl Coordinator {
    /// Coordinator without a background scheduler.
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            background: None,
        }
    }

    pub fn with_background(mut self, background: BackgroundSync) -> Self {
        self.background = Some(background);
        self
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Connection restored: go online, announce it, then sync.
    pub async fn handle_online(&self) -> SyncOutcome {
        info!("Connection restored");
        self.engine.set_online(true);
        self.engine
            .bus()
            .notify(EventStatus::Online, "Connection restored");
        self.engine.sync_pending().await
    }

    /// Connection lost. A running pass is not cancelled.
    pub fn handle_offline(&self) {
        info!("Connection lost");
        self.engine.set_online(false);
        self.engine.bus().notify(EventStatus::Offline, "Working offline");
    }

    /// Apply a reported state, acting only when it differs from the current one.
    pub async fn apply(&self, state: Connectivity) -> Option<SyncOutcome> {
        if state.is_online() == self.engine.is_online() {
            debug!("Connectivity unchanged ({:?})", state);
            return None;
        }
        match state {
            Connectivity::Online => Some(self.handle_online().await),
            Connectivity::Offline => {
                self.handle_offline();
                None
            }
        }
    }

    /// Follow connectivity reports until the sender is dropped.
    pub async fn watch(&self, mut states: watch::Receiver<Connectivity>) {
        loop {
            let state = *states.borrow_and_update();
            self.apply(state).await;
            if states.changed().await.is_err() {
                debug!("Connectivity source closed");
                break;
            }
        }
    }

    /// User-triggered sync.
    ///
    /// # Errors
    /// - `Offline` when there is no connection; nothing is touched
    pub async fn manual_sync(&self) -> Result<SyncOutcome> {
        if !self.engine.is_online() {
            return Err(Error::Offline("Cannot sync - you are offline".to_string()));
        }
        Ok(self.engine.sync_pending().await)
    }

    /// Ask the background scheduler for a pass.
    ///
    /// # Returns
    /// Whether a registration happened. Without a scheduler this is `false`.
    pub fn request_background_sync(&self) -> bool {
        let Some(background) = &self.background else {
            debug!("No background scheduler, skipping registration");
            return false;
        };
        let registered = background.register(SYNC_TAG);
        if registered {
            info!("Background sync registered");
        } else {
            warn!("Background sync registration failed");
        }
        registered
    }

    /// Submit a payload, delivering directly when possible.
    ///
    /// When offline, or when the direct attempt fails, the payload is
    /// queued and a background pass is requested. A payload the server
    /// accepted without returning an id is kept for review instead.
    pub async fn submit(&self, payload: Value) -> Result<SubmitOutcome> {
        if self.engine.is_online() {
            match self.engine.remote().submit(&payload).await {
                Ok(server_id) => {
                    info!("Submission delivered as server id {}", server_id);
                    return Ok(SubmitOutcome::Delivered(server_id));
                }
                Err(Error::Unconfirmed(reason)) => {
                    warn!("Server accepted submission without an id: {}", reason);
                    let local_id = self
                        .engine
                        .store()
                        .record_unconfirmed(payload, &reason)
                        .await?;
                    return Ok(SubmitOutcome::Unconfirmed(local_id));
                }
                Err(e) => warn!("Online submit failed, saving offline: {}", e),
            }
        }

        let local_id = self.engine.store().enqueue_submission(payload).await?;
        self.request_background_sync();
        Ok(SubmitOutcome::Queued(local_id))
    }
}
