//! Record store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use fsmonitor_common::{Error, Result};

use crate::schema::{CollectionDef, Schema};

/// A stored record. Records are JSON objects; the collection's key path
/// names the field holding the primary key.
pub type Record = Value;

/// Primary key of a record within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Convert a JSON value into a key.
    ///
    /// Only integers and non-empty strings are valid keys.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Key::Int),
            Value::String(s) if !s.is_empty() => Some(Key::Text(s.clone())),
            _ => None,
        }
    }

    /// Convert the key back into a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            Key::Int(i) => Value::from(*i),
            Key::Text(s) => Value::from(s.clone()),
        }
    }
}

impl From<i64> for Key {
    fn from(id: i64) -> Self {
        Key::Int(id)
    }
}

impl From<&str> for Key {
    fn from(id: &str) -> Self {
        Key::Text(id.to_string())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A single write inside an atomic batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert or replace a record.
    Put { collection: String, record: Record },
    /// Delete a record by key; deleting a missing key is not an error.
    Delete { collection: String, key: Key },
}

impl WriteOp {
    pub fn put(collection: impl Into<String>, record: Record) -> Self {
        WriteOp::Put {
            collection: collection.into(),
            record,
        }
    }

    pub fn delete(collection: impl Into<String>, key: Key) -> Self {
        WriteOp::Delete {
            collection: collection.into(),
            key,
        }
    }
}

/// Generic keyed collection store with secondary indexes.
///
/// Every single-collection operation is atomic. `replace_all` and
/// `transact` are atomic across all records they touch. All operations
/// fail with `Error::Storage` before `initialize` has succeeded.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Open the store and create all collections and indexes of `schema`.
    ///
    /// # Postconditions
    /// - Existing collections and their data are preserved
    /// - Missing collections and indexes are created
    /// - The persisted schema version equals `schema.version`
    ///
    /// # Errors
    /// - Persisted version is newer than `schema.version`
    /// - Backend unavailable
    async fn initialize(&self, schema: &Schema) -> Result<()>;

    /// Schema version currently persisted (0 for a fresh store).
    async fn schema_version(&self) -> Result<u32>;

    /// Get all records of a collection.
    async fn get_all(&self, collection: &str) -> Result<Vec<Record>>;

    /// Get a record by key.
    async fn get(&self, collection: &str, key: &Key) -> Result<Option<Record>>;

    /// Insert or replace a record.
    ///
    /// For auto-increment collections a record without a key is assigned the
    /// next identifier, which is written into the record's key field.
    ///
    /// # Returns
    /// The key the record was stored under.
    async fn put(&self, collection: &str, record: Record) -> Result<Key>;

    /// Delete a record by key. Missing keys are ignored.
    async fn delete(&self, collection: &str, key: &Key) -> Result<()>;

    /// Insert or replace many records in one atomic unit.
    async fn bulk_put(&self, collection: &str, records: Vec<Record>) -> Result<()>;

    /// Remove every record of a collection.
    async fn clear(&self, collection: &str) -> Result<()>;

    /// Clear a collection and insert `records`, atomically.
    async fn replace_all(&self, collection: &str, records: Vec<Record>) -> Result<()>;

    /// Records whose indexed field equals `value`.
    ///
    /// # Errors
    /// - Index not declared on the collection
    async fn get_by_index(&self, collection: &str, index: &str, value: &Value)
        -> Result<Vec<Record>>;

    /// Number of records whose indexed field equals `value`.
    async fn count_by_index(&self, collection: &str, index: &str, value: &Value) -> Result<usize>;

    /// Apply a batch of writes across collections; either all apply or none.
    async fn transact(&self, ops: Vec<WriteOp>) -> Result<()>;
}

/// Resolve the key of `record` under `def`, if present.
pub(crate) fn record_key(def: &CollectionDef, record: &Record) -> Result<Option<Key>> {
    let object = record.as_object().ok_or_else(|| {
        Error::InvalidInput(format!("Records in '{}' must be JSON objects", def.name))
    })?;
    match object.get(&def.key_path) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Key::from_json(value).map(Some).ok_or_else(|| {
            Error::InvalidInput(format!(
                "Invalid key '{}' for collection '{}'",
                value, def.name
            ))
        }),
    }
}

/// Resolve the key of `record`, requiring it to be present.
pub(crate) fn require_key(def: &CollectionDef, record: &Record) -> Result<Key> {
    record_key(def, record)?.ok_or_else(|| {
        Error::InvalidInput(format!(
            "Record for '{}' is missing key field '{}'",
            def.name, def.key_path
        ))
    })
}
