//! Offline persistence for FS Monitoring.
//!
//! A trait-based record store with in-memory and SQLite backends, and the
//! domain layer on top of it: reference-data caches, the submission queue
//! and the session cache.
//!
//! # Design Principles
//! - Backend isolation: domain code only sees [`RecordStore`]
//! - Atomic writes: multi-record changes go through `transact`
//! - Additive migrations: schema upgrades never drop data

pub mod store;
pub mod schema;
pub mod memory;
pub mod sqlite;
pub mod registry;
pub mod submission;
pub mod offline;

pub use store::{Key, Record, RecordStore, WriteOp};
pub use schema::{
    offline_schema, CollectionDef, IndexDef, ReferenceKind, Schema, RESPONSE_CACHES,
    RESPONSE_CACHE_ENTRIES, SCHEMA_VERSION,
};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use registry::{BackendRegistry, StoreLocation, StoreOpener};
pub use submission::{PendingSubmission, SubmissionStatus, Transition};
pub use offline::{OfflineStore, DEFAULT_HISTORY_RETENTION_DAYS, DEFAULT_RETENTION_DAYS};
