//! Status command implementation.

use super::{open, CliResult, Store};
use rowsync_engine::{LocalDriver, CHECKPOINT_TABLE};
use rowsync_protocol::{CheckpointRecord, SYNCED_AT};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// Store status.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Database path.
    pub path: String,
    /// Per-table status.
    pub tables: Vec<TableReport>,
}

/// Status of one synced table.
#[derive(Debug, Serialize)]
pub struct TableReport {
    /// Table name.
    pub table: String,
    /// Rows never pushed or changed since the last push.
    pub pending_upserts: usize,
    /// Tombstones waiting for push.
    pub pending_deletes: usize,
    /// Pull checkpoints of the table.
    pub checkpoints: Vec<CheckpointRecord>,
}

/// Runs the status command.
pub async fn run(path: &Path, tables: &[String], format: &str) -> CliResult<()> {
    let store = open(path).await?;
    let report = collect(&store, path, tables).await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    Ok(())
}

/// Gathers counts and checkpoints for `tables`, or every synced table
/// when empty.
pub async fn collect(store: &Store, path: &Path, tables: &[String]) -> CliResult<StatusReport> {
    let tables = if tables.is_empty() {
        synced_tables(store).await?
    } else {
        for table in tables {
            if !store.local.table_exists(table).await? {
                return Err(format!("Table {table} not found").into());
            }
        }
        tables.to_vec()
    };

    let checkpoints = store.checkpoints.list().await?;
    let mut reports = Vec::with_capacity(tables.len());
    for table in tables {
        let counts = store.local.pending_counts(&table).await?;
        reports.push(TableReport {
            checkpoints: checkpoints
                .iter()
                .filter(|record| record.table_name == table)
                .cloned()
                .collect(),
            table,
            pending_upserts: counts.upserts,
            pending_deletes: counts.deletes,
        });
    }

    Ok(StatusReport {
        path: path.display().to_string(),
        tables: reports,
    })
}

/// Tables carrying the sync bookkeeping columns.
async fn synced_tables(store: &Store) -> CliResult<Vec<String>> {
    let rows = store
        .local
        .driver()
        .query(
            "SELECT m.name AS name FROM sqlite_master m
             WHERE m.type = 'table'
               AND m.name NOT LIKE 'sqlite_%'
               AND m.name <> ?
               AND EXISTS (SELECT 1 FROM pragma_table_info(m.name) WHERE name = ?)
             ORDER BY m.name",
            &[
                Value::String(CHECKPOINT_TABLE.to_string()),
                Value::String(SYNCED_AT.to_string()),
            ],
        )
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|mut row| match row.remove("name") {
            Some(Value::String(name)) => Some(name),
            _ => None,
        })
        .collect())
}

fn print_text_output(report: &StatusReport) {
    println!("rowsync Store Status");
    println!("====================");
    println!();
    println!("Path: {}", report.path);

    if report.tables.is_empty() {
        println!();
        println!("No synced tables found.");
        return;
    }

    for table in &report.tables {
        println!();
        println!("{}:", table.table);
        println!("  Pending upserts: {}", table.pending_upserts);
        println!("  Pending deletes: {}", table.pending_deletes);
        if table.checkpoints.is_empty() {
            println!("  Checkpoints:     none (never pulled)");
        }
        for record in &table.checkpoints {
            println!(
                "  Checkpoint [{}]: synced {} ({}), deleted {}",
                record.filter_key,
                record.last_synced_at,
                record.last_synced_at_pk.as_deref().unwrap_or("-"),
                record.last_deleted_at
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::database;
    use rowsync_protocol::{CheckpointAdvance, FilterSet};

    #[tokio::test]
    async fn counts_pending_rows_of_synced_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = database(&dir);
        let store = open(&path).await.unwrap();
        store
            .checkpoints
            .advance(
                "todos",
                &FilterSet::new(),
                CheckpointAdvance::synced("2024-01-01T00:00:00.000Z", "b"),
            )
            .await
            .unwrap();

        let report = collect(&store, &path, &[]).await.unwrap();
        let names: Vec<&str> = report.tables.iter().map(|t| t.table.as_str()).collect();
        assert_eq!(names, ["notes", "todos"]);

        let todos = &report.tables[1];
        assert_eq!(todos.pending_upserts, 1);
        assert_eq!(todos.pending_deletes, 1);
        assert_eq!(todos.checkpoints.len(), 1);
        assert!(report.tables[0].checkpoints.is_empty());
    }

    #[tokio::test]
    async fn unknown_table_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = database(&dir);
        let store = open(&path).await.unwrap();
        assert!(collect(&store, &path, &["missing".to_string()]).await.is_err());
    }
}
