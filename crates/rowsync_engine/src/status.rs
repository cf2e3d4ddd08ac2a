//! Observable sync status.
//!
//! Status is informational only; nothing in the engine reads it back to
//! decide what to sync.

use parking_lot::RwLock;
use rowsync_protocol::{timestamp, Conflict};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is pushing local changes.
    Pushing,
    /// Engine is pulling remote changes.
    Pulling,
    /// Engine has completed a sync cycle.
    Synced,
    /// The last cycle left at least one table in error.
    Error,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pulling | SyncState::Pushing)
    }
}

/// Per-row or per-table status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local changes are waiting.
    Pending,
    /// Last attempt succeeded.
    Success,
    /// Last attempt failed.
    Error,
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of sync cycles completed.
    pub cycles_completed: u64,
    /// Rows sent to the remote store.
    pub rows_pushed: u64,
    /// Rows written locally by pulls.
    pub rows_pulled: u64,
    /// Rows hard-deleted locally by pulls.
    pub rows_deleted: u64,
    /// Incoming rows that lost to a newer existing row.
    pub conflicts_skipped: u64,
    /// Remote rows that met a local row with unpushed edits.
    pub conflicts_detected: u64,
    /// Total number of retries.
    pub retries: u64,
    /// Last completed cycle.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Sync status of one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    /// Outcome of the last push or pull.
    pub status: SyncStatus,
    /// When the last successful push finished.
    pub last_push_at: Option<String>,
    /// When the last successful pull finished.
    pub last_pull_at: Option<String>,
    /// Last error message.
    pub last_error: Option<String>,
    /// Per-row status of rows touched since the last reset.
    #[serde(skip)]
    pub rows: HashMap<String, SyncStatus>,
}

impl Default for TableStatus {
    fn default() -> Self {
        Self {
            status: SyncStatus::Success,
            last_push_at: None,
            last_pull_at: None,
            last_error: None,
            rows: HashMap::new(),
        }
    }
}

/// Conflicts kept by [`StatusBoard::recent_conflicts`].
pub const RECENT_CONFLICTS: usize = 100;

/// Shared status of the engine, its tables and their rows.
#[derive(Debug)]
pub struct StatusBoard {
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    tables: RwLock<HashMap<String, TableStatus>>,
    conflicts: RwLock<VecDeque<Conflict>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    /// Creates an idle board.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            tables: RwLock::new(HashMap::new()),
            conflicts: RwLock::new(VecDeque::new()),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Sets the state.
    pub fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Updates the stats in place.
    pub fn record(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.write());
    }

    /// Records a conflict, dropping the oldest beyond [`RECENT_CONFLICTS`].
    pub fn record_conflict(&self, conflict: Conflict) {
        self.stats.write().conflicts_detected += 1;
        let mut conflicts = self.conflicts.write();
        conflicts.push_back(conflict);
        while conflicts.len() > RECENT_CONFLICTS {
            conflicts.pop_front();
        }
    }

    /// Returns recorded conflicts, oldest first.
    pub fn recent_conflicts(&self) -> Vec<Conflict> {
        self.conflicts.read().iter().cloned().collect()
    }

    /// Returns the status of a table.
    pub fn table(&self, table: &str) -> Option<TableStatus> {
        self.tables.read().get(table).cloned()
    }

    /// Returns the status of a row.
    pub fn row(&self, table: &str, id: &str) -> Option<SyncStatus> {
        self.tables.read().get(table)?.rows.get(id).copied()
    }

    /// Marks rows as waiting for the remote store.
    pub fn rows_pending<'a>(&self, table: &str, ids: impl IntoIterator<Item = &'a str>) {
        self.set_rows(table, ids, SyncStatus::Pending);
        self.with_table(table, |status| status.status = SyncStatus::Pending);
    }

    /// Sets the status of rows.
    pub fn set_rows<'a>(&self, table: &str, ids: impl IntoIterator<Item = &'a str>, status: SyncStatus) {
        self.with_table(table, |entry| {
            for id in ids {
                entry.rows.insert(id.to_string(), status);
            }
        });
    }

    /// Records a finished push of a table.
    pub fn push_finished(&self, table: &str, error: Option<String>) {
        self.with_table(table, |status| {
            match &error {
                None => {
                    status.status = SyncStatus::Success;
                    status.last_push_at = Some(timestamp::now());
                    status.last_error = None;
                }
                Some(message) => {
                    status.status = SyncStatus::Error;
                    status.last_error = Some(message.clone());
                }
            }
        });
        if let Some(message) = error {
            self.stats.write().last_error = Some(message);
        }
    }

    /// Records a finished pull of a table.
    pub fn pull_finished(&self, table: &str, error: Option<String>) {
        self.with_table(table, |status| match &error {
            None => {
                if status.status != SyncStatus::Error {
                    status.status = SyncStatus::Success;
                }
                status.last_pull_at = Some(timestamp::now());
            }
            Some(message) => {
                status.status = SyncStatus::Error;
                status.last_error = Some(message.clone());
            }
        });
        if let Some(message) = error {
            self.stats.write().last_error = Some(message);
        }
    }

    /// Returns true if any table is in error.
    pub fn any_table_failed(&self) -> bool {
        self.tables
            .read()
            .values()
            .any(|status| status.status == SyncStatus::Error)
    }

    /// Clears everything.
    pub fn reset(&self) {
        *self.state.write() = SyncState::Idle;
        *self.stats.write() = SyncStats::default();
        self.tables.write().clear();
        self.conflicts.write().clear();
    }

    fn with_table(&self, table: &str, f: impl FnOnce(&mut TableStatus)) {
        let mut tables = self.tables.write();
        f(tables.entry(table.to_string()).or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_protocol::{ConflictAction, Origin, Row, UPDATED_AT};

    #[test]
    fn state_checks() {
        assert!(SyncState::Pulling.is_active());
        assert!(SyncState::Pushing.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(!SyncState::Synced.is_active());
    }

    #[test]
    fn rows_and_tables() {
        let board = StatusBoard::new();
        board.rows_pending("todos", ["a", "b"]);
        assert_eq!(board.row("todos", "a"), Some(SyncStatus::Pending));
        assert_eq!(board.table("todos").unwrap().status, SyncStatus::Pending);

        board.set_rows("todos", ["a"], SyncStatus::Success);
        board.push_finished("todos", None);
        assert_eq!(board.row("todos", "a"), Some(SyncStatus::Success));
        assert!(board.table("todos").unwrap().last_push_at.is_some());

        board.push_finished("notes", Some("503".into()));
        assert!(board.any_table_failed());
        assert_eq!(board.stats().last_error.as_deref(), Some("503"));

        board.reset();
        assert!(board.table("todos").is_none());
        assert_eq!(board.state(), SyncState::Idle);
    }

    #[test]
    fn conflict_log_is_bounded() {
        let board = StatusBoard::new();
        let local = Row::new("a").with(UPDATED_AT, "2024-01-01T00:00:00.000Z");
        for minute in 0..RECENT_CONFLICTS + 5 {
            let remote = Row::new("a").with(UPDATED_AT, format!("2024-01-02T00:{:02}:00.000Z", minute % 60));
            if let Some(conflict) = Conflict::detect("todos", &remote, Origin::Remote, Some(&local)) {
                board.record_conflict(conflict);
            }
        }
        assert_eq!(board.stats().conflicts_detected, (RECENT_CONFLICTS + 5) as u64);
        let recent = board.recent_conflicts();
        assert_eq!(recent.len(), RECENT_CONFLICTS);
        assert_eq!(recent[0].action, ConflictAction::Update);

        board.reset();
        assert!(board.recent_conflicts().is_empty());
    }

    #[test]
    fn pull_does_not_clear_push_error() {
        let board = StatusBoard::new();
        board.push_finished("todos", Some("boom".into()));
        board.pull_finished("todos", None);
        assert_eq!(board.table("todos").unwrap().status, SyncStatus::Error);
    }
}
