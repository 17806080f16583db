//! Identifier types used throughout the offline subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned by the local store to a queued submission.
///
/// Stable for the life of the record; never reused while the record exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(i64);

impl LocalId {
    /// Wrap a raw store key.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier the server returned for a delivered submission.
///
/// Servers answer with either a numeric or a string `id`; both are kept
/// in their textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    /// Create a new ServerId.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ServerId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Extract the identifier from a JSON value (number or string).
    ///
    /// # Errors
    /// - Returns error for null, objects, arrays, booleans and empty strings
    pub fn from_json(value: &serde_json::Value) -> crate::Result<Self> {
        match value {
            serde_json::Value::Number(n) => Self::new(n.to_string()),
            serde_json::Value::String(s) => Self::new(s.clone()),
            other => Err(crate::Error::InvalidInput(format!(
                "Unsupported server id: {}",
                other
            ))),
        }
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for ServerId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
