//! FS Monitoring sync engine.
//!
//! This module delivers queued submissions and keeps reference data fresh:
//! - Sync passes over the pending queue, one at a time
//! - Requeue policy with exponential backoff for failed items
//! - Connectivity coordination and direct-or-queued submission
//! - Background worker with coalesced wake-ups and periodic passes
//! - Status events on a broadcast bus

pub mod connectivity;
pub mod engine;
pub mod events;
pub mod retry;
pub mod scheduler;
pub mod scripted;
pub mod transport;

// Re-export main types
pub use connectivity::{Connectivity, Coordinator, SubmitOutcome};
pub use engine::{
    RefreshOutcome, RefreshReport, SkipReason, SyncConfig, SyncEngine, SyncOutcome, SyncReport,
    SyncStatus,
};
pub use events::{EventStatus, StatusBus, SyncEvent};
pub use retry::RequeuePolicy;
pub use scheduler::{BackgroundSync, BackgroundWorker, SyncRequest, SYNC_TAG};
pub use scripted::{ScriptedRemote, SubmitScript};
pub use transport::{Endpoints, HttpRemote, RemoteService};
