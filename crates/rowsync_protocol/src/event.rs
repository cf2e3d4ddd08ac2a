//! Table change notifications.

use serde::{Deserialize, Serialize};

/// Why a table's local contents changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// A routed write outside a transaction.
    LocalWrite,
    /// Rows merged by a pull.
    Pull,
    /// Rows hard-deleted by a pull.
    PullDelete,
    /// Rows marked synced by a push or the queue.
    Push,
    /// Tombstoned rows purged after the remote confirmed them.
    Purge,
    /// A committed transaction.
    Transaction,
    /// Older rows fetched on demand.
    Backfill,
}

/// Emitted after local rows of a table change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    /// Table name.
    pub table: String,
    /// Cause of the change.
    pub reason: ChangeReason,
    /// Rows affected.
    pub rows: usize,
}

impl TableChange {
    /// Creates a change event.
    pub fn new(table: impl Into<String>, reason: ChangeReason, rows: usize) -> Self {
        Self {
            table: table.into(),
            reason,
            rows,
        }
    }
}
