//! Collection schema and the persisted layout of the offline database.

use serde::{Deserialize, Serialize};
use std::fmt;

use fsmonitor_common::{Error, Result};

/// Cached stores (reference data).
pub const STORES: &str = "stores";
/// Cached checklists (reference data).
pub const CHECKLISTS: &str = "checklists";
/// Cached checklist items, indexed by checklist.
pub const CHECKLIST_ITEMS: &str = "checklist_items";
/// Cached hygiene employees (reference data).
pub const HYGIENE_EMPLOYEES: &str = "hygiene_employees";
/// Cached hygiene checklist items (reference data).
pub const HYGIENE_CHECKLIST_ITEMS: &str = "hygiene_checklist_items";
/// Cached hygiene settings, keyed by setting key.
pub const HYGIENE_SETTINGS: &str = "hygiene_settings";
/// Submissions not yet acknowledged by the server.
pub const PENDING_SUBMISSIONS: &str = "pending_submissions";
/// Read-optimized copies of delivered submissions.
pub const COMPLETED_SUBMISSIONS: &str = "completed_submissions";
/// Cached user session.
pub const USER_SESSION: &str = "user_session";
/// Named HTTP response caches, in creation order.
pub const RESPONSE_CACHES: &str = "response_caches";
/// Entries of the HTTP response caches, indexed by cache name.
pub const RESPONSE_CACHE_ENTRIES: &str = "response_cache_entries";

/// Current version of the offline database layout.
pub const SCHEMA_VERSION: u32 = 3;

/// Secondary index over a single record field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub field: String,
}

/// Definition of a named collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDef {
    pub name: String,
    /// Record field holding the primary key.
    pub key_path: String,
    /// Assign integer keys to records stored without one.
    pub auto_increment: bool,
    pub indexes: Vec<IndexDef>,
}

impl CollectionDef {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn with_index(mut self, name: impl Into<String>, field: impl Into<String>) -> Self {
        self.indexes.push(IndexDef {
            name: name.into(),
            field: field.into(),
        });
        self
    }

    /// Find an index by name.
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// A versioned set of collections.
///
/// Versions only ever add collections or indexes; nothing is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    pub collections: Vec<CollectionDef>,
}

impl Schema {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            collections: Vec::new(),
        }
    }

    pub fn with_collection(mut self, def: CollectionDef) -> Self {
        self.collections.push(def);
        self
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionDef> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Check names are plain identifiers and unique.
    ///
    /// Backends embed collection and field names in queries, so anything
    /// outside `[A-Za-z_][A-Za-z0-9_]*` is rejected.
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(Error::InvalidInput("Schema version must be >= 1".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for def in &self.collections {
            check_identifier(&def.name)?;
            check_identifier(&def.key_path)?;
            if !seen.insert(def.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "Duplicate collection '{}'",
                    def.name
                )));
            }
            for index in &def.indexes {
                check_identifier(&index.name)?;
                check_identifier(&index.field)?;
            }
        }
        Ok(())
    }
}

fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid identifier '{}'", name)))
    }
}

/// Layout of version 1: audit reference data, the submission queue and the
/// session cache.
pub fn schema_v1() -> Schema {
    Schema::new(1)
        .with_collection(CollectionDef::new(STORES, "id"))
        .with_collection(CollectionDef::new(CHECKLISTS, "id"))
        .with_collection(
            CollectionDef::new(CHECKLIST_ITEMS, "id").with_index("checklist_id", "checklist_id"),
        )
        .with_collection(
            CollectionDef::new(PENDING_SUBMISSIONS, "local_id")
                .auto_increment()
                .with_index("status", "status")
                .with_index("created_at", "created_at"),
        )
        .with_collection(
            CollectionDef::new(COMPLETED_SUBMISSIONS, "id").with_index("synced_at", "synced_at"),
        )
        .with_collection(CollectionDef::new(USER_SESSION, "key"))
}

/// Layout of version 2: version 1 plus the hygiene checklist caches.
pub fn schema_v2() -> Schema {
    let mut schema = schema_v1()
        .with_collection(CollectionDef::new(HYGIENE_EMPLOYEES, "id"))
        .with_collection(CollectionDef::new(HYGIENE_CHECKLIST_ITEMS, "id"))
        .with_collection(CollectionDef::new(HYGIENE_SETTINGS, "key"));
    schema.version = 2;
    schema
}

/// Current layout: version 2 plus the HTTP response caches.
pub fn offline_schema() -> Schema {
    let mut schema = schema_v2()
        .with_collection(CollectionDef::new(RESPONSE_CACHES, "name"))
        .with_collection(
            CollectionDef::new(RESPONSE_CACHE_ENTRIES, "id").with_index("cache", "cache"),
        );
    schema.version = SCHEMA_VERSION;
    schema
}

/// Kinds of reference data cached for offline form rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Stores,
    Checklists,
    ChecklistItems,
    HygieneEmployees,
    HygieneChecklistItems,
    HygieneSettings,
}

impl ReferenceKind {
    /// Kinds refreshed wholesale from a single endpoint.
    ///
    /// Checklist items are fetched per checklist and are not listed here.
    pub const WHOLESALE: [ReferenceKind; 5] = [
        ReferenceKind::Stores,
        ReferenceKind::Checklists,
        ReferenceKind::HygieneEmployees,
        ReferenceKind::HygieneChecklistItems,
        ReferenceKind::HygieneSettings,
    ];

    /// Collection the kind is cached in.
    pub fn collection(&self) -> &'static str {
        match self {
            ReferenceKind::Stores => STORES,
            ReferenceKind::Checklists => CHECKLISTS,
            ReferenceKind::ChecklistItems => CHECKLIST_ITEMS,
            ReferenceKind::HygieneEmployees => HYGIENE_EMPLOYEES,
            ReferenceKind::HygieneChecklistItems => HYGIENE_CHECKLIST_ITEMS,
            ReferenceKind::HygieneSettings => HYGIENE_SETTINGS,
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.collection())
    }
}
