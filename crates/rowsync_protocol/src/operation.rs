//! Queued remote operations.

use crate::filter::FilterSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Read rows.
    Select,
    /// Insert one or more rows.
    Insert,
    /// Patch the rows matching the filters.
    Update,
    /// Soft-delete the rows matching the filters.
    Delete,
    /// Insert or replace by id.
    Upsert,
}

impl Method {
    /// Returns the lowercase method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Select => "select",
            Method::Insert => "insert",
            Method::Update => "update",
            Method::Delete => "delete",
            Method::Upsert => "upsert",
        }
    }

    /// Returns true for every method except `Select`.
    pub fn is_write(&self) -> bool {
        !matches!(self, Method::Select)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency key of a [`PendingOperation`].
///
/// Assigned once when the operation is created and carried unchanged
/// through every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpKey(Uuid);

impl OpKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(id, updated_at)` of a row as it was when an operation was queued.
///
/// Used to mark the row synced only if it has not changed since.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowVersion {
    /// Row id.
    pub id: String,
    /// `updated_at` at queue time.
    pub updated_at: Option<String>,
}

impl RowVersion {
    /// Creates a row version.
    pub fn new(id: impl Into<String>, updated_at: Option<String>) -> Self {
        Self {
            id: id.into(),
            updated_at,
        }
    }
}

/// A remote call waiting in the outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Idempotency key.
    pub op_key: OpKey,
    /// Target table.
    pub table: String,
    /// Remote method.
    pub method: Method,
    /// Row object(s) or patch.
    pub payload: Option<Value>,
    /// Row filters for update/delete.
    pub filters: FilterSet,
    /// Local rows to reconcile once the call lands.
    pub rows: Vec<RowVersion>,
    /// Attempts made so far.
    pub retry_count: u32,
}

impl PendingOperation {
    /// Creates an operation with a fresh key.
    pub fn new(table: impl Into<String>, method: Method) -> Self {
        Self {
            op_key: OpKey::generate(),
            table: table.into(),
            method,
            payload: None,
            filters: FilterSet::new(),
            rows: Vec::new(),
            retry_count: 0,
        }
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the filters.
    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    /// Sets the rows to reconcile.
    pub fn with_rows(mut self, rows: Vec<RowVersion>) -> Self {
        self.rows = rows;
        self
    }

    /// Returns the ids of the rows this operation touches.
    pub fn row_ids(&self) -> Vec<String> {
        self.rows.iter().map(|row| row.id.clone()).collect()
    }
}
