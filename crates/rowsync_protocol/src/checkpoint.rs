//! Pull checkpoints.

use crate::filter::{FilterSet, FilterSignature};
use crate::query::KeysetCursor;
use crate::timestamp::{self, LOCAL_EPOCH};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Per `(table, filter signature)` pull progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Table name.
    pub table_name: String,
    /// Signature of the filter set the pull ran with.
    pub filter_key: FilterSignature,
    /// The filter set as JSON, kept for inspection.
    pub filter_json: String,
    /// `updated_at` of the last pulled row.
    pub last_synced_at: String,
    /// Id of the last pulled row, breaking timestamp ties.
    pub last_synced_at_pk: Option<String>,
    /// Newest `deleted_at` applied locally.
    pub last_deleted_at: String,
    /// When the record last changed.
    pub updated_at: String,
}

impl CheckpointRecord {
    /// Returns the record for a table that has never been pulled.
    pub fn initial(table: &str, filters: &FilterSet) -> Self {
        Self {
            table_name: table.to_string(),
            filter_key: filters.signature(),
            filter_json: filters.to_json(),
            last_synced_at: LOCAL_EPOCH.to_string(),
            last_synced_at_pk: None,
            last_deleted_at: LOCAL_EPOCH.to_string(),
            updated_at: timestamp::now(),
        }
    }

    /// Returns the keyset cursor for the next updated-rows page.
    pub fn cursor(&self) -> KeysetCursor {
        KeysetCursor::new(self.last_synced_at.clone(), self.last_synced_at_pk.clone())
    }

    /// Applies `advance` without ever moving a field backward.
    ///
    /// `(last_synced_at, last_synced_at_pk)` moves only if the proposed pair
    /// sorts after the stored pair; `last_deleted_at` takes the later value.
    pub fn merged(&self, advance: &CheckpointAdvance) -> Self {
        let mut next = self.clone();

        if let Some(proposed) = &advance.last_synced_at {
            let ordering = timestamp::compare(proposed, &self.last_synced_at).then_with(|| {
                advance
                    .last_synced_at_pk
                    .as_deref()
                    .cmp(&self.last_synced_at_pk.as_deref())
            });
            if ordering == Ordering::Greater {
                next.last_synced_at = proposed.clone();
                next.last_synced_at_pk = advance.last_synced_at_pk.clone();
            }
        }

        if let Some(proposed) = &advance.last_deleted_at {
            if timestamp::compare(proposed, &self.last_deleted_at) == Ordering::Greater {
                next.last_deleted_at = proposed.clone();
            }
        }

        if next != *self {
            next.updated_at = timestamp::now();
        }
        next
    }

    /// Rewinds the fields named by `scope` to the local epoch.
    pub fn reset(&self, scope: ResetScope) -> Self {
        let mut next = self.clone();
        if matches!(scope, ResetScope::All | ResetScope::Synced) {
            next.last_synced_at = LOCAL_EPOCH.to_string();
            next.last_synced_at_pk = None;
        }
        if matches!(scope, ResetScope::All | ResetScope::Deleted) {
            next.last_deleted_at = LOCAL_EPOCH.to_string();
        }
        next.updated_at = timestamp::now();
        next
    }
}

/// A proposed checkpoint move.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointAdvance {
    /// Proposed `last_synced_at`.
    pub last_synced_at: Option<String>,
    /// Proposed `last_synced_at_pk`, paired with `last_synced_at`.
    pub last_synced_at_pk: Option<String>,
    /// Proposed `last_deleted_at`.
    pub last_deleted_at: Option<String>,
}

impl CheckpointAdvance {
    /// Moves the updated-rows cursor to `(updated_at, id)`.
    pub fn synced(updated_at: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            last_synced_at: Some(updated_at.into()),
            last_synced_at_pk: Some(id.into()),
            last_deleted_at: None,
        }
    }

    /// Moves the deletion cursor to `deleted_at`.
    pub fn deleted(deleted_at: impl Into<String>) -> Self {
        Self {
            last_deleted_at: Some(deleted_at.into()),
            ..Self::default()
        }
    }

    /// Returns true if nothing is proposed.
    pub fn is_empty(&self) -> bool {
        self.last_synced_at.is_none() && self.last_deleted_at.is_none()
    }
}

/// Which checkpoint fields a reset rewinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    /// Both cursors.
    #[default]
    All,
    /// The updated-rows cursor.
    Synced,
    /// The deletion cursor.
    Deleted,
}

impl fmt::Display for ResetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResetScope::All => "all",
            ResetScope::Synced => "synced",
            ResetScope::Deleted => "deleted",
        })
    }
}

impl FromStr for ResetScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(ResetScope::All),
            "synced" => Ok(ResetScope::Synced),
            "deleted" => Ok(ResetScope::Deleted),
            other => Err(format!("unknown reset scope: {other}")),
        }
    }
}
