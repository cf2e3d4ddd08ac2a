//! Persistent pull checkpoints.

use crate::error::{SyncError, SyncResult};
use crate::local::LocalStore;
use parking_lot::Mutex;
use rowsync_protocol::{
    CheckpointAdvance, CheckpointRecord, FilterSet, FilterSignature, ResetScope, RowMap,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the checkpoint table.
pub const CHECKPOINT_TABLE: &str = "_rowsync_checkpoints";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS _rowsync_checkpoints (
    table_name TEXT NOT NULL,
    filter_key TEXT NOT NULL,
    filter_json TEXT NOT NULL DEFAULT '[]',
    last_synced_at TEXT NOT NULL,
    last_synced_at_pk TEXT,
    last_deleted_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (table_name, filter_key)
)";

const UPSERT: &str = "INSERT INTO _rowsync_checkpoints
    (table_name, filter_key, filter_json, last_synced_at, last_synced_at_pk, last_deleted_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (table_name, filter_key) DO UPDATE SET
        filter_json = excluded.filter_json,
        last_synced_at = excluded.last_synced_at,
        last_synced_at_pk = excluded.last_synced_at_pk,
        last_deleted_at = excluded.last_deleted_at,
        updated_at = excluded.updated_at";

type CheckpointKey = (String, FilterSignature);

/// Pull progress per `(table, filter signature)`.
///
/// Writes take the local write gate themselves, so callers must not hold
/// it when calling in.
pub struct CheckpointStore {
    local: LocalStore,
    locks: Mutex<HashMap<CheckpointKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CheckpointStore {
    /// Creates a store over the local row store.
    pub fn new(local: LocalStore) -> Self {
        Self {
            local,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the checkpoint table if needed.
    pub async fn ensure_schema(&self) -> SyncResult<()> {
        let _gate = self.local.lock_writes().await;
        self.local.driver().execute(SCHEMA, &[]).await?;
        Ok(())
    }

    /// Returns the checkpoint, creating the epoch record on first use.
    pub async fn get(&self, table: &str, filters: &FilterSet) -> SyncResult<CheckpointRecord> {
        let signature = filters.signature();
        if let Some(record) = self.load(table, &signature).await? {
            return Ok(record);
        }
        let record = CheckpointRecord::initial(table, filters);
        let _gate = self.local.lock_writes().await;
        self.local
            .driver()
            .execute(
                "INSERT INTO _rowsync_checkpoints
                    (table_name, filter_key, filter_json, last_synced_at, last_synced_at_pk, last_deleted_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (table_name, filter_key) DO NOTHING",
                &params(&record),
            )
            .await?;
        drop(_gate);
        Ok(self.load(table, &signature).await?.unwrap_or(record))
    }

    /// Moves the checkpoint forward; fields never move backward.
    pub async fn advance(
        &self,
        table: &str,
        filters: &FilterSet,
        advance: CheckpointAdvance,
    ) -> SyncResult<CheckpointRecord> {
        let key_lock = self.key_lock(table, &filters.signature());
        let _serial = key_lock.lock().await;

        let current = self.get(table, filters).await?;
        let next = current.merged(&advance);
        if next != current {
            self.store(&next).await?;
            debug!(
                table,
                last_synced_at = %next.last_synced_at,
                last_deleted_at = %next.last_deleted_at,
                "checkpoint advanced"
            );
        }
        Ok(next)
    }

    /// Rewinds the fields named by `scope` so the next pull starts over.
    pub async fn reset(
        &self,
        table: &str,
        filters: &FilterSet,
        scope: ResetScope,
    ) -> SyncResult<CheckpointRecord> {
        let key_lock = self.key_lock(table, &filters.signature());
        let _serial = key_lock.lock().await;

        let next = self.get(table, filters).await?.reset(scope);
        self.store(&next).await?;
        info!(table, %scope, "checkpoint reset");
        Ok(next)
    }

    /// Deletes the checkpoint of one filter set, or every checkpoint of
    /// the table when `filters` is `None`.
    pub async fn clear(&self, table: &str, filters: Option<&FilterSet>) -> SyncResult<usize> {
        let _gate = self.local.lock_writes().await;
        let removed = match filters {
            Some(filters) => {
                self.local
                    .driver()
                    .execute(
                        "DELETE FROM _rowsync_checkpoints WHERE table_name = ? AND filter_key = ?",
                        &[
                            Value::String(table.to_string()),
                            Value::String(filters.signature().to_string()),
                        ],
                    )
                    .await?
            }
            None => {
                self.local
                    .driver()
                    .execute(
                        "DELETE FROM _rowsync_checkpoints WHERE table_name = ?",
                        &[Value::String(table.to_string())],
                    )
                    .await?
            }
        };
        info!(table, removed, "checkpoints cleared");
        Ok(removed)
    }

    /// Lists every checkpoint.
    pub async fn list(&self) -> SyncResult<Vec<CheckpointRecord>> {
        self.local
            .driver()
            .query(
                "SELECT * FROM _rowsync_checkpoints ORDER BY table_name, filter_key",
                &[],
            )
            .await?
            .into_iter()
            .map(record_from_row)
            .collect()
    }

    async fn load(&self, table: &str, signature: &FilterSignature) -> SyncResult<Option<CheckpointRecord>> {
        self.local
            .driver()
            .query_first(
                "SELECT * FROM _rowsync_checkpoints WHERE table_name = ? AND filter_key = ?",
                &[
                    Value::String(table.to_string()),
                    Value::String(signature.to_string()),
                ],
            )
            .await?
            .map(record_from_row)
            .transpose()
    }

    async fn store(&self, record: &CheckpointRecord) -> SyncResult<()> {
        let _gate = self.local.lock_writes().await;
        self.local.driver().execute(UPSERT, &params(record)).await?;
        Ok(())
    }

    fn key_lock(&self, table: &str, signature: &FilterSignature) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry((table.to_string(), signature.clone()))
                .or_default(),
        )
    }
}

fn params(record: &CheckpointRecord) -> [Value; 7] {
    [
        Value::String(record.table_name.clone()),
        Value::String(record.filter_key.to_string()),
        Value::String(record.filter_json.clone()),
        Value::String(record.last_synced_at.clone()),
        record
            .last_synced_at_pk
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        Value::String(record.last_deleted_at.clone()),
        Value::String(record.updated_at.clone()),
    ]
}

fn record_from_row(mut row: RowMap) -> SyncResult<CheckpointRecord> {
    let mut text = |column: &str| -> SyncResult<String> {
        match row.remove(column) {
            Some(Value::String(value)) => Ok(value),
            other => Err(SyncError::local(format!(
                "checkpoint column {column} holds {other:?}"
            ))),
        }
    };
    let table_name = text("table_name")?;
    let filter_key = FilterSignature::from_raw(text("filter_key")?);
    let filter_json = text("filter_json")?;
    let last_synced_at = text("last_synced_at")?;
    let last_deleted_at = text("last_deleted_at")?;
    let updated_at = text("updated_at")?;
    let last_synced_at_pk = match row.remove("last_synced_at_pk") {
        Some(Value::String(pk)) => Some(pk),
        _ => None,
    };
    Ok(CheckpointRecord {
        table_name,
        filter_key,
        filter_json,
        last_synced_at,
        last_synced_at_pk,
        last_deleted_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteDriver;
    use rowsync_protocol::timestamp::LOCAL_EPOCH;

    async fn store() -> CheckpointStore {
        let driver = SqliteDriver::open_in_memory().unwrap();
        let store = CheckpointStore::new(LocalStore::new(Arc::new(driver), 999));
        store.ensure_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn get_creates_epoch_record() {
        let store = store().await;
        let record = store.get("todos", &FilterSet::new()).await.unwrap();
        assert_eq!(record.last_synced_at, LOCAL_EPOCH);
        assert_eq!(record.filter_key.as_str(), "all");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn advance_is_monotonic_and_persistent() {
        let store = store().await;
        let filters = FilterSet::new().eq("owner", "u1");
        store
            .advance("todos", &filters, CheckpointAdvance::synced("2024-02-01T00:00:00Z", "b"))
            .await
            .unwrap();
        let record = store
            .advance("todos", &filters, CheckpointAdvance::synced("2024-01-01T00:00:00Z", "z"))
            .await
            .unwrap();
        assert_eq!(record.last_synced_at, "2024-02-01T00:00:00Z");

        let loaded = store.get("todos", &filters).await.unwrap();
        assert_eq!(loaded.last_synced_at_pk.as_deref(), Some("b"));
        assert!(loaded.filter_json.contains("owner"));
    }

    #[tokio::test]
    async fn concurrent_advances_keep_the_max() {
        let store = Arc::new(store().await);
        let mut tasks = Vec::new();
        for day in 1..=9 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .advance(
                        "todos",
                        &FilterSet::new(),
                        CheckpointAdvance::deleted(format!("2024-01-0{day}T00:00:00Z")),
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let record = store.get("todos", &FilterSet::new()).await.unwrap();
        assert_eq!(record.last_deleted_at, "2024-01-09T00:00:00Z");
    }

    #[tokio::test]
    async fn reset_and_clear() {
        let store = store().await;
        let all = FilterSet::new();
        store
            .advance("todos", &all, CheckpointAdvance::synced("2024-02-01T00:00:00Z", "b"))
            .await
            .unwrap();
        let record = store.reset("todos", &all, ResetScope::Synced).await.unwrap();
        assert_eq!(record.last_synced_at, LOCAL_EPOCH);
        assert!(record.last_synced_at_pk.is_none());

        store.get("todos", &FilterSet::new().eq("owner", "u1")).await.unwrap();
        assert_eq!(store.clear("todos", Some(&all)).await.unwrap(), 1);
        assert_eq!(store.clear("todos", None).await.unwrap(), 1);
        assert!(store.list().await.unwrap().is_empty());
    }
}
