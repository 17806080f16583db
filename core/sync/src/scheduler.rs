//! Background sync worker and its registration handle.

use chrono::Utc;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use fsmonitor_common::{Error, Result};

use crate::engine::{SyncEngine, SyncOutcome};
use crate::retry::RequeuePolicy;

/// Tag registered when submissions are waiting for connectivity.
pub const SYNC_TAG: &str = "sync-pending-audits";

const CHANNEL_CAPACITY: usize = 32;

/// Message sent to the background worker.
#[derive(Debug)]
pub enum SyncRequest {
    /// Best-effort wake-up for a named task.
    Register(String),
    /// Explicit pass whose outcome the sender waits for.
    Pass,
    /// Stop the worker.
    Shutdown,
}

type Envelope = (SyncRequest, Option<oneshot::Sender<SyncOutcome>>);

/// Handle for waking the background worker.
#[derive(Debug, Clone)]
pub struct BackgroundSync {
    request_tx: mpsc::Sender<Envelope>,
}

impl BackgroundSync {
    /// Create a handle and the worker it talks to.
    ///
    /// With `periodic` set the worker also runs a pass on that interval.
    pub fn new(periodic: Option<Duration>) -> (Self, BackgroundWorker) {
        let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self { request_tx },
            BackgroundWorker {
                request_rx,
                periodic,
            },
        )
    }

    /// Register a wake-up for `tag` without waiting.
    ///
    /// # Returns
    /// `false` when the worker is gone. A full queue already holds a
    /// pending wake-up and counts as registered.
    pub fn register(&self, tag: &str) -> bool {
        match self
            .request_tx
            .try_send((SyncRequest::Register(tag.to_string()), None))
        {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Background queue full, wake-up for '{}' coalesced", tag);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the worker for a pass and wait for its outcome.
    pub async fn request_pass(&self) -> Result<SyncOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Pass, Some(response_tx)))
            .await
            .map_err(|_| Error::Config("Background worker not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Config("Background worker stopped before answering".to_string()))
    }

    /// Stop the worker after its current pass.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }

    pub fn is_running(&self) -> bool {
        !self.request_tx.is_closed()
    }
}

/// Worker side of [`BackgroundSync`]; run it in a spawned task.
pub struct BackgroundWorker {
    request_rx: mpsc::Receiver<Envelope>,
    periodic: Option<Duration>,
}

impl BackgroundWorker {
    /// Run passes through `engine`, applying `policy` before each one.
    pub async fn run_with_engine(self, engine: Arc<SyncEngine>, policy: RequeuePolicy) {
        self.run(move || {
            let engine = engine.clone();
            let policy = policy.clone();
            async move {
                if let Err(e) = policy.apply(engine.store(), Utc::now()).await {
                    warn!("Requeue policy failed: {}", e);
                }
                engine.sync_pending().await
            }
        })
        .await
    }

    /// Run the worker loop until shutdown or until every handle is dropped.
    ///
    /// Wake-ups queued while a pass runs are coalesced into one pass.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncOutcome> + Send,
    {
        let mut periodic_interval = self.periodic.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!("Background sync worker started");

        loop {
            tokio::select! {
                message = self.request_rx.recv() => {
                    let Some((request, responder)) = message else {
                        info!("All background sync handles dropped");
                        break;
                    };

                    let mut tags = BTreeSet::new();
                    let mut responders: Vec<_> = responder.into_iter().collect();
                    let mut shutdown = false;

                    match request {
                        SyncRequest::Shutdown => {
                            info!("Background sync worker shutting down");
                            break;
                        }
                        SyncRequest::Register(tag) => {
                            tags.insert(tag);
                        }
                        SyncRequest::Pass => {}
                    }

                    while let Ok((request, responder)) = self.request_rx.try_recv() {
                        responders.extend(responder);
                        match request {
                            SyncRequest::Register(tag) => {
                                tags.insert(tag);
                            }
                            SyncRequest::Pass => {}
                            SyncRequest::Shutdown => {
                                shutdown = true;
                                break;
                            }
                        }
                    }

                    debug!("Running background pass (tags: {:?})", tags);
                    let outcome = sync_fn().await;
                    log_outcome("Background", &outcome);
                    for responder in responders {
                        let _ = responder.send(outcome.clone());
                    }

                    if shutdown {
                        info!("Background sync worker shutting down");
                        break;
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic_interval) => {
                    debug!("Triggering periodic sync");
                    let outcome = sync_fn().await;
                    log_outcome("Periodic", &outcome);
                }
            }
        }
    }

    async fn wait_for_periodic(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

fn log_outcome(kind: &str, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(report) => info!(
            "{} sync completed: {} synced, {} failed, {} unconfirmed",
            kind, report.synced, report.failed, report.unconfirmed
        ),
        SyncOutcome::Aborted(reason) => error!("{} sync failed: {}", kind, reason),
        SyncOutcome::Skipped(reason) => debug!("{} sync skipped: {:?}", kind, reason),
        SyncOutcome::Idle => debug!("{} sync found nothing pending", kind),
    }
}
