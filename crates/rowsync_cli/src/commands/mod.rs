//! CLI command implementations.

pub mod checkpoints;
pub mod clear;
pub mod reset;
pub mod status;

use rowsync_engine::{CheckpointStore, LocalStore, SqliteDriver};
use rowsync_protocol::FilterSet;
use std::path::Path;
use std::sync::Arc;

/// Result type shared by the commands.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const MAX_BIND_PARAMS: usize = 999;

/// An opened local store with its checkpoint table.
pub struct Store {
    /// Row store.
    pub local: LocalStore,
    /// Checkpoint store over the same connection.
    pub checkpoints: CheckpointStore,
}

/// Opens an existing database file.
pub async fn open(path: &Path) -> CliResult<Store> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    let driver = SqliteDriver::open(path)?;
    let local = LocalStore::new(Arc::new(driver), MAX_BIND_PARAMS);
    let checkpoints = CheckpointStore::new(local.clone());
    checkpoints.ensure_schema().await?;
    tracing::debug!(path = %path.display(), "opened local store");
    Ok(Store { local, checkpoints })
}

/// Parses a `--filters` argument; absent means no filters.
pub fn parse_filters(raw: Option<&str>) -> CliResult<FilterSet> {
    match raw {
        None => Ok(FilterSet::new()),
        Some(json) => {
            let filters = FilterSet::from_json(json)?;
            filters.validate()?;
            Ok(filters)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) const SCHEMA: &str = "CREATE TABLE todos (
        id TEXT PRIMARY KEY, title TEXT,
        created_at TEXT, updated_at TEXT, deleted_at TEXT, synced_at TEXT
    );
    CREATE TABLE notes (
        id TEXT PRIMARY KEY, body TEXT,
        created_at TEXT, updated_at TEXT, deleted_at TEXT, synced_at TEXT
    );
    CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT);";

    pub(crate) fn database(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("local.db");
        let driver = SqliteDriver::open(&path).unwrap();
        driver.execute_batch(SCHEMA).unwrap();
        driver
            .execute_batch(
                "INSERT INTO todos (id, updated_at, synced_at) VALUES ('a', '2024-01-01T00:00:00.000Z', NULL);
                 INSERT INTO todos (id, updated_at, synced_at) VALUES ('b', '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z');
                 INSERT INTO todos (id, updated_at, deleted_at) VALUES ('c', '2024-01-02T00:00:00.000Z', '2024-01-02T00:00:00.000Z');",
            )
            .unwrap();
        path
    }
}
