//! Named record store backends.
//!
//! Configuration selects a backend by name (`memory` or `sqlite`); the
//! registry turns that name and a location into an opened store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use fsmonitor_common::{Error, Result};

use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::store::RecordStore;

/// Where a backend keeps its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Records live as long as the process.
    Transient,
    /// A database file, created with its parent directories on first open.
    File(PathBuf),
}

/// Opens a store at a location.
pub type StoreOpener = fn(&StoreLocation) -> Result<Arc<dyn RecordStore>>;

/// Backends available to the offline database, by name.
pub struct BackendRegistry {
    openers: BTreeMap<String, StoreOpener>,
}

impl BackendRegistry {
    /// A registry with no backends.
    pub fn empty() -> Self {
        Self {
            openers: BTreeMap::new(),
        }
    }

    /// The `memory` and `sqlite` backends.
    pub fn builtin() -> Self {
        let mut openers: BTreeMap<String, StoreOpener> = BTreeMap::new();
        openers.insert("memory".to_string(), open_memory);
        openers.insert("sqlite".to_string(), open_sqlite);
        Self { openers }
    }

    /// Add a backend.
    ///
    /// # Errors
    /// - `AlreadyExists` when `name` is taken
    pub fn with_backend(mut self, name: impl Into<String>, opener: StoreOpener) -> Result<Self> {
        let name = name.into();
        if self.openers.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Storage backend '{}' is already registered",
                name
            )));
        }
        self.openers.insert(name, opener);
        Ok(self)
    }

    /// Open the named backend at `location`.
    ///
    /// # Errors
    /// - `Config` for an unknown backend
    /// - whatever the backend reports while opening
    pub fn open(&self, name: &str, location: &StoreLocation) -> Result<Arc<dyn RecordStore>> {
        let opener = self.openers.get(name).ok_or_else(|| {
            Error::Config(format!(
                "Unknown storage backend '{}' (available: {})",
                name,
                self.backends().join(", ")
            ))
        })?;
        opener(location)
    }

    /// Backend names, sorted.
    pub fn backends(&self) -> Vec<&str> {
        self.openers.keys().map(String::as_str).collect()
    }

    pub fn supports(&self, name: &str) -> bool {
        self.openers.contains_key(name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn open_memory(location: &StoreLocation) -> Result<Arc<dyn RecordStore>> {
    if let StoreLocation::File(path) = location {
        debug!("memory backend ignores {}", path.display());
    }
    Ok(Arc::new(MemoryStore::new()))
}

fn open_sqlite(location: &StoreLocation) -> Result<Arc<dyn RecordStore>> {
    let store = match location {
        StoreLocation::Transient => SqliteStore::in_memory()?,
        StoreLocation::File(path) => SqliteStore::open(path)?,
    };
    Ok(Arc::new(store))
}
