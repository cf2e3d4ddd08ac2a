//! Managed rows.
//!
//! Every managed table carries five reserved columns. They are lifted into
//! typed fields on [`Row`]; everything else stays in an open column map.

use crate::error::{ProtocolError, ProtocolResult};
use crate::timestamp::{self, Epoch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row as a plain JSON object.
pub type RowMap = serde_json::Map<String, Value>;

/// Stable unique key.
pub const ID: &str = "id";
/// Creation timestamp.
pub const CREATED_AT: &str = "created_at";
/// Last mutation timestamp, used for last-write-wins.
pub const UPDATED_AT: &str = "updated_at";
/// Soft-delete marker.
pub const DELETED_AT: &str = "deleted_at";
/// Last successful push; `NULL` means the row is pending.
pub const SYNCED_AT: &str = "synced_at";

/// All reserved column names.
pub const RESERVED_COLUMNS: [&str; 5] = [ID, CREATED_AT, UPDATED_AT, DELETED_AT, SYNCED_AT];

/// A row of a managed table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RowMap", into = "RowMap")]
pub struct Row {
    /// Row id, immutable and unique within its table.
    pub id: String,
    /// Creation timestamp.
    pub created_at: Option<String>,
    /// Last mutation timestamp.
    pub updated_at: Option<String>,
    /// Soft-delete marker.
    pub deleted_at: Option<String>,
    /// Last push timestamp.
    pub synced_at: Option<String>,
    /// User columns.
    pub columns: RowMap,
}

impl Row {
    /// Creates a row with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            updated_at: None,
            deleted_at: None,
            synced_at: None,
            columns: RowMap::new(),
        }
    }

    /// Sets a column, routing reserved names to their typed field.
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        // Builder for fixtures; invalid reserved values are dropped.
        let _ = self.set(column, value.into());
        self
    }

    /// Validates a JSON object and lifts its reserved columns.
    pub fn from_map(mut map: RowMap) -> ProtocolResult<Self> {
        let id = match map.remove(ID) {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(Value::String(_)) => {
                return Err(ProtocolError::InvalidRow("id must not be empty".into()))
            }
            Some(other) => {
                return Err(ProtocolError::InvalidRow(format!(
                    "id must be a string, got {other}"
                )))
            }
            None => return Err(ProtocolError::InvalidRow("missing id".into())),
        };

        Ok(Self {
            id,
            created_at: take_timestamp(&mut map, CREATED_AT)?,
            updated_at: take_timestamp(&mut map, UPDATED_AT)?,
            deleted_at: take_timestamp(&mut map, DELETED_AT)?,
            synced_at: take_timestamp(&mut map, SYNCED_AT)?,
            columns: map,
        })
    }

    /// Returns the row as a JSON object.
    ///
    /// `created_at`/`updated_at` are omitted when unset; the nullable
    /// markers are always present so that writing the map clears them.
    pub fn to_map(&self) -> RowMap {
        self.clone().into_map()
    }

    /// Consumes the row into a JSON object.
    pub fn into_map(self) -> RowMap {
        let mut map = self.columns;
        map.insert(ID.into(), Value::String(self.id));
        if let Some(created_at) = self.created_at {
            map.insert(CREATED_AT.into(), Value::String(created_at));
        }
        if let Some(updated_at) = self.updated_at {
            map.insert(UPDATED_AT.into(), Value::String(updated_at));
        }
        map.insert(DELETED_AT.into(), opt_string(self.deleted_at));
        map.insert(SYNCED_AT.into(), opt_string(self.synced_at));
        map
    }

    /// Returns the object sent to the remote store (no `synced_at`).
    pub fn to_remote_map(&self) -> RowMap {
        let mut map = self.to_map();
        map.remove(SYNCED_AT);
        map
    }

    /// Returns a column value; reserved columns are returned as strings.
    pub fn get(&self, column: &str) -> Option<Value> {
        match column {
            ID => Some(Value::String(self.id.clone())),
            CREATED_AT => self.created_at.clone().map(Value::String),
            UPDATED_AT => self.updated_at.clone().map(Value::String),
            DELETED_AT => self.deleted_at.clone().map(Value::String),
            SYNCED_AT => self.synced_at.clone().map(Value::String),
            _ => self.columns.get(column).cloned(),
        }
    }

    /// Sets a column value, validating reserved columns.
    pub fn set(&mut self, column: &str, value: Value) -> ProtocolResult<()> {
        match column {
            ID => match value {
                Value::String(id) if !id.trim().is_empty() => {
                    self.id = id;
                    Ok(())
                }
                _ => Err(ProtocolError::InvalidRow(
                    "id must be a non-empty string".into(),
                )),
            },
            CREATED_AT => {
                self.created_at = timestamp_value(CREATED_AT, value)?;
                Ok(())
            }
            UPDATED_AT => {
                self.updated_at = timestamp_value(UPDATED_AT, value)?;
                Ok(())
            }
            DELETED_AT => {
                self.deleted_at = timestamp_value(DELETED_AT, value)?;
                Ok(())
            }
            SYNCED_AT => {
                self.synced_at = timestamp_value(SYNCED_AT, value)?;
                Ok(())
            }
            _ => {
                self.columns.insert(column.to_string(), value);
                Ok(())
            }
        }
    }

    /// Returns true if the row carries a soft-delete marker.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns true if the row has no outstanding local change.
    pub fn is_synced(&self) -> bool {
        self.synced_at.is_some() && self.deleted_at.is_none()
    }

    /// Parses `updated_at`, falling back to `epoch`.
    pub fn updated_at_or(&self, epoch: Epoch) -> DateTime<Utc> {
        timestamp::parse_or_epoch(self.updated_at.as_deref(), epoch)
    }
}

impl TryFrom<RowMap> for Row {
    type Error = ProtocolError;

    fn try_from(map: RowMap) -> ProtocolResult<Self> {
        Self::from_map(map)
    }
}

impl From<Row> for RowMap {
    fn from(row: Row) -> Self {
        row.into_map()
    }
}

fn opt_string(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

fn take_timestamp(map: &mut RowMap, column: &str) -> ProtocolResult<Option<String>> {
    match map.remove(column) {
        Some(value) => timestamp_value(column, value),
        None => Ok(None),
    }
}

fn timestamp_value(column: &str, value: Value) -> ProtocolResult<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(ProtocolError::InvalidRow(format!(
            "{column} must be a string or null, got {other}"
        ))),
    }
}
