//! Common utilities and types shared across the FS Monitoring offline crates.
//!
//! This module provides the error taxonomy and the identifier types that the
//! store, the sync engine and the interception layer all agree on.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{LocalId, ServerId};
