//! Application layer for the FS Monitoring offline subsystem.
//!
//! Loads configuration and builds the store, remote, sync engine,
//! coordinator, interceptor and background worker exactly once.

pub mod app;
pub mod config;

pub use app::OfflineApp;
pub use config::{AppConfig, BackgroundConfig, ServerConfig, StorageConfig, CONFIG_FILENAME};
