//! Reset command implementation.

use super::{open, parse_filters, CliResult};
use rowsync_protocol::ResetScope;
use std::path::Path;

/// Runs the reset command.
pub async fn run(path: &Path, table: &str, filters: Option<&str>, scope: ResetScope) -> CliResult<()> {
    let filters = parse_filters(filters)?;
    let store = open(path).await?;
    if !store.local.table_exists(table).await? {
        tracing::warn!(table, "table does not exist in the local store");
    }

    let record = store.checkpoints.reset(table, &filters, scope).await?;
    println!("Reset {} checkpoint of {} [{}]", scope, table, record.filter_key);
    println!("  Last synced:  {}", record.last_synced_at);
    println!("  Last deleted: {}", record.last_deleted_at);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::database;
    use rowsync_protocol::{CheckpointAdvance, FilterSet};

    #[tokio::test]
    async fn rewinds_only_the_requested_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = database(&dir);
        {
            let store = open(&path).await.unwrap();
            let all = FilterSet::new();
            store
                .checkpoints
                .advance("todos", &all, CheckpointAdvance::synced("2024-01-01T00:00:00.000Z", "b"))
                .await
                .unwrap();
            store
                .checkpoints
                .advance("todos", &all, CheckpointAdvance::deleted("2024-01-02T00:00:00.000Z"))
                .await
                .unwrap();
        }

        run(&path, "todos", None, ResetScope::Synced).await.unwrap();

        let store = open(&path).await.unwrap();
        let record = store.checkpoints.get("todos", &FilterSet::new()).await.unwrap();
        assert_eq!(record.last_synced_at_pk, None);
        assert_eq!(record.last_deleted_at, "2024-01-02T00:00:00.000Z");
    }
}
