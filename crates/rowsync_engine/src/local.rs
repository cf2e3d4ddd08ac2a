//! Local row store.
//!
//! [`LocalDriver`] is the low-level interface the engine needs from the
//! embedded store: parameterized statements plus transaction primitives.
//! [`LocalStore`] owns every piece of SQL the engine issues against it.
//!
//! Statements issued from outside the transaction coordinator must hold
//! the write gate ([`LocalStore::lock_writes`]) so they never interleave
//! into an open transaction on the shared connection.

use crate::error::SyncResult;
use async_trait::async_trait;
use rowsync_protocol::timestamp;
use rowsync_protocol::{
    validate_identifier, Filter, FilterOp, FilterSet, OrderBy, Row, RowMap, RowVersion,
    CREATED_AT, DELETED_AT, ID, RESERVED_COLUMNS, SYNCED_AT, UPDATED_AT,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// A SQL statement with positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with `?` placeholders.
    pub sql: String,
    /// Parameter values.
    pub params: Vec<Value>,
}

impl Statement {
    /// Creates a statement.
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Low-level access to the embedded row store.
#[async_trait]
pub trait LocalDriver: Send + Sync {
    /// Runs a statement and returns the number of rows it changed.
    async fn execute(&self, sql: &str, params: &[Value]) -> SyncResult<usize>;

    /// Runs a statement and returns every row it produced.
    async fn query(&self, sql: &str, params: &[Value]) -> SyncResult<Vec<RowMap>>;

    /// Runs a statement and returns its first row.
    async fn query_first(&self, sql: &str, params: &[Value]) -> SyncResult<Option<RowMap>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Runs all statements or none, returning the rows they produced.
    ///
    /// Must work both inside and outside an explicit transaction.
    async fn execute_atomic(&self, statements: Vec<Statement>) -> SyncResult<Vec<RowMap>>;

    /// Opens an explicit transaction.
    async fn begin(&self) -> SyncResult<()>;

    /// Commits the explicit transaction.
    async fn commit(&self) -> SyncResult<()>;

    /// Rolls the explicit transaction back.
    async fn rollback(&self) -> SyncResult<()>;
}

/// Pending push work of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PendingCounts {
    /// Rows awaiting an upsert.
    pub upserts: usize,
    /// Tombstones awaiting a remote delete.
    pub deletes: usize,
}

impl PendingCounts {
    /// Returns the total.
    pub fn total(&self) -> usize {
        self.upserts + self.deletes
    }
}

/// Options of a local select.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions<'a> {
    /// Sort keys.
    pub order: &'a [OrderBy],
    /// Row limit.
    pub limit: Option<usize>,
    /// Row offset.
    pub offset: Option<usize>,
    /// Include soft-deleted rows.
    pub include_deleted: bool,
}

/// SQL generation over a [`LocalDriver`].
#[derive(Clone)]
pub struct LocalStore {
    driver: Arc<dyn LocalDriver>,
    max_bind_params: usize,
    gate: Arc<Mutex<()>>,
}

impl LocalStore {
    /// Wraps a driver.
    pub fn new(driver: Arc<dyn LocalDriver>, max_bind_params: usize) -> Self {
        Self {
            driver,
            max_bind_params: max_bind_params.max(1),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the driver.
    pub fn driver(&self) -> &Arc<dyn LocalDriver> {
        &self.driver
    }

    /// Acquires the write gate.
    pub async fn lock_writes(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.gate).lock_owned().await
    }

    /// Opens an explicit transaction.
    pub async fn begin(&self) -> SyncResult<()> {
        self.driver.begin().await
    }

    /// Commits the explicit transaction.
    pub async fn commit(&self) -> SyncResult<()> {
        self.driver.commit().await
    }

    /// Rolls the explicit transaction back.
    pub async fn rollback(&self) -> SyncResult<()> {
        self.driver.rollback().await
    }

    /// Selects rows matching `filters`.
    pub async fn select(
        &self,
        table: &str,
        filters: &FilterSet,
        options: SelectOptions<'_>,
    ) -> SyncResult<Vec<Row>> {
        let mut params = Vec::new();
        let mut conditions = where_conditions(filters, &mut params)?;
        if !options.include_deleted {
            conditions.push(format!("{} IS NULL", quote(DELETED_AT)?));
        }
        let mut sql = format!("SELECT * FROM {}{}", quote(table)?, where_clause(&conditions));
        if !options.order.is_empty() {
            let keys = options
                .order
                .iter()
                .map(|o| -> SyncResult<String> {
                    let direction = if o.descending { "DESC" } else { "ASC" };
                    Ok(format!("{} {direction}", quote(&o.column)?))
                })
                .collect::<SyncResult<Vec<_>>>()?;
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        match (options.limit, options.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        to_rows(self.driver.query(&sql, &params).await?)
    }

    /// Fills the reserved columns of rows about to be inserted.
    ///
    /// Missing ids get a UUID v4; `created_at` defaults to now; `updated_at`
    /// is always now; the row starts pending and not deleted.
    pub fn prepare_new_rows(rows: Vec<RowMap>) -> SyncResult<Vec<Row>> {
        let now = timestamp::now();
        rows.into_iter()
            .map(|mut map| -> SyncResult<Row> {
                if map.get(ID).map_or(true, Value::is_null) {
                    map.insert(ID.into(), Value::String(uuid::Uuid::new_v4().to_string()));
                }
                let mut row = Row::from_map(map)?;
                row.created_at.get_or_insert_with(|| now.clone());
                row.updated_at = Some(now.clone());
                row.deleted_at = None;
                row.synced_at = None;
                Ok(row)
            })
            .collect()
    }

    /// Inserts new rows and returns them as stored.
    pub async fn insert(&self, table: &str, rows: Vec<RowMap>) -> SyncResult<Vec<Row>> {
        let rows = Self::prepare_new_rows(rows)?;
        let statements = rows
            .iter()
            .map(|row| insert_statement(table, &row.to_map(), None))
            .collect::<SyncResult<Vec<_>>>()?;
        to_rows(self.driver.execute_atomic(statements).await?)
    }

    /// Inserts or replaces rows by id; the rows become pending.
    pub async fn upsert(&self, table: &str, rows: Vec<RowMap>) -> SyncResult<Vec<Row>> {
        let now = timestamp::now();
        let mut statements = Vec::with_capacity(rows.len());
        for mut row in Self::prepare_new_rows(rows)? {
            row.updated_at = Some(now.clone());
            statements.push(insert_statement(table, &row.to_map(), Some(ConflictUpdate::AllButCreated))?);
        }
        to_rows(self.driver.execute_atomic(statements).await?)
    }

    /// Applies `patch` to the live rows matching `filters`.
    ///
    /// Reserved columns in the patch are ignored; `updated_at` is set to
    /// now and the rows become pending.
    pub async fn update(&self, table: &str, patch: &RowMap, filters: &FilterSet) -> SyncResult<Vec<Row>> {
        let now = timestamp::now();
        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for (column, value) in patch {
            if RESERVED_COLUMNS.contains(&column.as_str()) {
                continue;
            }
            assignments.push(format!("{} = ?", quote(column)?));
            params.push(value.clone());
        }
        assignments.push(format!("{} = ?", quote(UPDATED_AT)?));
        params.push(Value::String(now));
        assignments.push(format!("{} = NULL", quote(SYNCED_AT)?));

        let mut conditions = where_conditions(filters, &mut params)?;
        conditions.push(format!("{} IS NULL", quote(DELETED_AT)?));
        let sql = format!(
            "UPDATE {} SET {}{} RETURNING *",
            quote(table)?,
            assignments.join(", "),
            where_clause(&conditions)
        );
        to_rows(self.driver.query(&sql, &params).await?)
    }

    /// Soft-deletes the live rows matching `filters`.
    pub async fn soft_delete(&self, table: &str, filters: &FilterSet) -> SyncResult<Vec<Row>> {
        let now = timestamp::now();
        let mut params = vec![Value::String(now.clone()), Value::String(now)];
        let mut conditions = where_conditions(filters, &mut params)?;
        conditions.push(format!("{} IS NULL", quote(DELETED_AT)?));
        let sql = format!(
            "UPDATE {} SET {} = ?, {} = ?, {} = NULL{} RETURNING *",
            quote(table)?,
            quote(DELETED_AT)?,
            quote(UPDATED_AT)?,
            quote(SYNCED_AT)?,
            where_clause(&conditions)
        );
        to_rows(self.driver.query(&sql, &params).await?)
    }

    /// Writes rows received from the remote store, marking them synced.
    pub async fn apply_remote_rows(&self, table: &str, rows: &[Row], synced_at: &str) -> SyncResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let statements = rows
            .iter()
            .map(|row| {
                let mut row = row.clone();
                row.synced_at = Some(synced_at.to_string());
                insert_statement(table, &row.to_map(), Some(ConflictUpdate::All))
            })
            .collect::<SyncResult<Vec<_>>>()?;
        let count = statements.len();
        self.driver.execute_atomic(statements).await?;
        debug!(table, rows = count, "applied remote rows");
        Ok(count)
    }

    /// Physically deletes rows by id, in chunks of at most `max_bind_params`.
    pub async fn hard_delete_ids(&self, table: &str, ids: &[String]) -> SyncResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let statements = ids
            .chunks(self.max_bind_params)
            .map(|chunk| -> SyncResult<Statement> {
                Ok(Statement::new(
                    format!(
                        "DELETE FROM {} WHERE {} IN ({}) RETURNING {}",
                        quote(table)?,
                        quote(ID)?,
                        placeholders(chunk.len()),
                        quote(ID)?
                    ),
                    chunk.iter().cloned().map(Value::String).collect(),
                ))
            })
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(self.driver.execute_atomic(statements).await?.len())
    }

    /// Returns live rows that were never pushed or changed since.
    pub async fn unsynced_rows(&self, table: &str) -> SyncResult<Vec<Row>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} IS NULL AND {} IS NULL ORDER BY {} ASC, {} ASC",
            quote(table)?,
            quote(SYNCED_AT)?,
            quote(DELETED_AT)?,
            quote(UPDATED_AT)?,
            quote(ID)?
        );
        to_rows(self.driver.query(&sql, &[]).await?)
    }

    /// Returns tombstoned rows waiting for the remote store.
    pub async fn deleted_rows(&self, table: &str) -> SyncResult<Vec<Row>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} IS NOT NULL ORDER BY {} ASC, {} ASC",
            quote(table)?,
            quote(DELETED_AT)?,
            quote(DELETED_AT)?,
            quote(ID)?
        );
        to_rows(self.driver.query(&sql, &[]).await?)
    }

    /// Sets `synced_at` on live rows whose `updated_at` still matches.
    pub async fn mark_synced(&self, table: &str, rows: &[RowVersion], synced_at: &str) -> SyncResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {} = ? AND {} IS ? AND {} IS NULL RETURNING {}",
            quote(table)?,
            quote(SYNCED_AT)?,
            quote(ID)?,
            quote(UPDATED_AT)?,
            quote(DELETED_AT)?,
            quote(ID)?
        );
        let statements = rows
            .iter()
            .map(|row| {
                Statement::new(
                    sql.clone(),
                    vec![
                        Value::String(synced_at.to_string()),
                        Value::String(row.id.clone()),
                        row.updated_at.clone().map(Value::String).unwrap_or(Value::Null),
                    ],
                )
            })
            .collect();
        Ok(self.driver.execute_atomic(statements).await?.len())
    }

    /// Physically deletes tombstones whose `updated_at` still matches.
    pub async fn purge_deleted(&self, table: &str, rows: &[RowVersion]) -> SyncResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} = ? AND {} IS ? AND {} IS NOT NULL RETURNING {}",
            quote(table)?,
            quote(ID)?,
            quote(UPDATED_AT)?,
            quote(DELETED_AT)?,
            quote(ID)?
        );
        let statements = rows
            .iter()
            .map(|row| {
                Statement::new(
                    sql.clone(),
                    vec![
                        Value::String(row.id.clone()),
                        row.updated_at.clone().map(Value::String).unwrap_or(Value::Null),
                    ],
                )
            })
            .collect();
        Ok(self.driver.execute_atomic(statements).await?.len())
    }

    /// Loads rows by id, including tombstones.
    pub async fn rows_by_ids(&self, table: &str, ids: &[String]) -> SyncResult<HashMap<String, Row>> {
        let mut found = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(self.max_bind_params) {
            let sql = format!(
                "SELECT * FROM {} WHERE {} IN ({})",
                quote(table)?,
                quote(ID)?,
                placeholders(chunk.len())
            );
            let params: Vec<Value> = chunk.iter().cloned().map(Value::String).collect();
            for row in to_rows(self.driver.query(&sql, &params).await?)? {
                found.insert(row.id.clone(), row);
            }
        }
        Ok(found)
    }

    /// Returns the oldest `updated_at` among live rows matching `filters`.
    pub async fn earliest_updated_at(&self, table: &str, filters: &FilterSet) -> SyncResult<Option<String>> {
        let mut params = Vec::new();
        let mut conditions = where_conditions(filters, &mut params)?;
        conditions.push(format!("{} IS NULL", quote(DELETED_AT)?));
        conditions.push(format!("{} IS NOT NULL", quote(UPDATED_AT)?));
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY {} ASC LIMIT 1",
            quote(UPDATED_AT)?,
            quote(table)?,
            where_clause(&conditions),
            quote(UPDATED_AT)?
        );
        Ok(self
            .driver
            .query_first(&sql, &params)
            .await?
            .and_then(|mut row| match row.remove(UPDATED_AT) {
                Some(Value::String(at)) => Some(at),
                _ => None,
            }))
    }

    /// Counts rows waiting for push.
    pub async fn pending_counts(&self, table: &str) -> SyncResult<PendingCounts> {
        let sql = format!(
            "SELECT \
               COALESCE(SUM(CASE WHEN {s} IS NULL AND {d} IS NULL THEN 1 ELSE 0 END), 0) AS upserts, \
               COALESCE(SUM(CASE WHEN {d} IS NOT NULL THEN 1 ELSE 0 END), 0) AS deletes \
             FROM {t}",
            s = quote(SYNCED_AT)?,
            d = quote(DELETED_AT)?,
            t = quote(table)?
        );
        let row = self.driver.query_first(&sql, &[]).await?.unwrap_or_default();
        let count = |name: &str| {
            row.get(name)
                .and_then(Value::as_u64)
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(0)
        };
        Ok(PendingCounts {
            upserts: count("upserts"),
            deletes: count("deletes"),
        })
    }

    /// Returns true if `table` exists in the store.
    pub async fn table_exists(&self, table: &str) -> SyncResult<bool> {
        let row = self
            .driver
            .query_first(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                &[Value::String(table.to_string())],
            )
            .await?;
        Ok(row.is_some())
    }
}

#[derive(Clone, Copy)]
enum ConflictUpdate {
    All,
    AllButCreated,
}

fn insert_statement(table: &str, row: &RowMap, on_conflict: Option<ConflictUpdate>) -> SyncResult<Statement> {
    let mut columns = Vec::with_capacity(row.len());
    let mut params = Vec::with_capacity(row.len());
    for (column, value) in row {
        columns.push(quote(column)?);
        params.push(value.clone());
    }
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(table)?,
        columns.join(", "),
        placeholders(columns.len())
    );
    if let Some(mode) = on_conflict {
        let updates = row
            .keys()
            .filter(|column| column.as_str() != ID)
            .filter(|column| !(matches!(mode, ConflictUpdate::AllButCreated) && column.as_str() == CREATED_AT))
            .map(|column| -> SyncResult<String> {
                let quoted = quote(column)?;
                Ok(format!("{quoted} = excluded.{quoted}"))
            })
            .collect::<SyncResult<Vec<_>>>()?;
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT({}) DO NOTHING", quote(ID)?));
        } else {
            sql.push_str(&format!(" ON CONFLICT({}) DO UPDATE SET {}", quote(ID)?, updates.join(", ")));
        }
    }
    sql.push_str(" RETURNING *");
    Ok(Statement::new(sql, params))
}

/// Quotes a validated identifier.
pub(crate) fn quote(name: &str) -> SyncResult<String> {
    validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

fn where_conditions(filters: &FilterSet, params: &mut Vec<Value>) -> SyncResult<Vec<String>> {
    filters.iter().map(|filter| condition(filter, params)).collect()
}

fn condition(filter: &Filter, params: &mut Vec<Value>) -> SyncResult<String> {
    let column = quote(&filter.column)?;
    let binary = |op: &str, params: &mut Vec<Value>| {
        params.push(filter.value.clone());
        format!("{column} {op} ?")
    };
    Ok(match filter.op {
        FilterOp::Eq => binary("=", params),
        FilterOp::Neq => binary("<>", params),
        FilterOp::Gt => binary(">", params),
        FilterOp::Gte => binary(">=", params),
        FilterOp::Lt => binary("<", params),
        FilterOp::Lte => binary("<=", params),
        FilterOp::Like => binary("LIKE", params),
        FilterOp::IsNull => format!("{column} IS NULL"),
        FilterOp::NotNull => format!("{column} IS NOT NULL"),
        FilterOp::In => {
            let values = match &filter.value {
                Value::Array(values) => values.clone(),
                other => vec![other.clone()],
            };
            if values.is_empty() {
                "0".to_string()
            } else {
                let sql = format!("{column} IN ({})", placeholders(values.len()));
                params.extend(values);
                sql
            }
        }
    })
}

fn to_rows(maps: Vec<RowMap>) -> SyncResult<Vec<Row>> {
    maps.into_iter()
        .map(|map| Row::from_map(map).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteDriver;
    use serde_json::json;

    async fn store() -> LocalStore {
        let driver = SqliteDriver::open_in_memory().unwrap();
        driver
            .execute_batch(
                "CREATE TABLE todos (
                    id TEXT PRIMARY KEY, title TEXT, done INTEGER,
                    created_at TEXT, updated_at TEXT, deleted_at TEXT, synced_at TEXT
                )",
            )
            .unwrap();
        LocalStore::new(Arc::new(driver), 2)
    }

    fn obj(value: Value) -> RowMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn insert_fills_reserved_columns() {
        let store = store().await;
        let rows = store
            .insert("todos", vec![obj(json!({ "title": "a" })), obj(json!({ "id": "x", "title": "b" }))])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].id.is_empty());
        assert_eq!(rows[1].id, "x");
        assert!(rows.iter().all(|r| r.updated_at.is_some() && r.synced_at.is_none()));
        assert_eq!(store.pending_counts("todos").await.unwrap().upserts, 2);
    }

    #[tokio::test]
    async fn update_and_soft_delete_reset_synced_at() {
        let store = store().await;
        store.insert("todos", vec![obj(json!({ "id": "a", "title": "t" }))]).await.unwrap();
        let row = store.rows_by_ids("todos", &["a".into()]).await.unwrap().remove("a").unwrap();
        let version = RowVersion::new("a", row.updated_at.clone());
        assert_eq!(store.mark_synced("todos", &[version], "2030-01-01T00:00:00Z").await.unwrap(), 1);
        assert!(store.unsynced_rows("todos").await.unwrap().is_empty());

        let filters = FilterSet::new().eq("id", "a");
        let updated = store.update("todos", &obj(json!({ "title": "u" })), &filters).await.unwrap();
        assert_eq!(updated[0].get("title"), Some(json!("u")));
        assert!(updated[0].synced_at.is_none());

        let deleted = store.soft_delete("todos", &filters).await.unwrap();
        assert!(deleted[0].is_deleted());
        assert_eq!(deleted[0].deleted_at, deleted[0].updated_at);
        assert!(store.select("todos", &FilterSet::new(), SelectOptions::default()).await.unwrap().is_empty());
        assert_eq!(store.deleted_rows("todos").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_synced_skips_rows_changed_since() {
        let store = store().await;
        store.insert("todos", vec![obj(json!({ "id": "a" }))]).await.unwrap();
        let stale = RowVersion::new("a", Some("1999-01-01T00:00:00.000Z".into()));
        assert_eq!(store.mark_synced("todos", &[stale], &timestamp::now()).await.unwrap(), 0);
        assert_eq!(store.unsynced_rows("todos").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hard_delete_chunks_by_bind_limit() {
        let store = store().await;
        let rows = (0..5).map(|i| obj(json!({ "id": format!("r{i}") }))).collect();
        store.insert("todos", rows).await.unwrap();
        let ids: Vec<String> = (0..5).map(|i| format!("r{i}")).collect();
        assert_eq!(store.hard_delete_ids("todos", &ids).await.unwrap(), 5);
        assert_eq!(store.rows_by_ids("todos", &ids).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn apply_remote_rows_overwrites_and_marks_synced() {
        let store = store().await;
        store.insert("todos", vec![obj(json!({ "id": "a", "title": "local" }))]).await.unwrap();
        let remote = Row::new("a")
            .with("title", "remote")
            .with(UPDATED_AT, "2099-01-01T00:00:00.000Z");
        store.apply_remote_rows("todos", &[remote], "2099-01-02T00:00:00.000Z").await.unwrap();
        let row = store.rows_by_ids("todos", &["a".into()]).await.unwrap().remove("a").unwrap();
        assert_eq!(row.get("title"), Some(json!("remote")));
        assert!(row.is_synced());
    }

    #[tokio::test]
    async fn select_filters_orders_and_limits() {
        let store = store().await;
        let rows = ["c", "a", "b"].iter().map(|id| obj(json!({ "id": id, "done": 1 }))).collect();
        store.insert("todos", rows).await.unwrap();
        let order = [OrderBy::desc("id")];
        let rows = store
            .select(
                "todos",
                &FilterSet::new().with(Filter::is_in("id", ["a", "b", "c"])),
                SelectOptions { order: &order, limit: Some(2), ..SelectOptions::default() },
            )
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["c", "b"]);
    }

    #[tokio::test]
    async fn rejects_unsafe_identifiers() {
        let store = store().await;
        let err = store
            .select("todos; DROP TABLE todos", &FilterSet::new(), SelectOptions::default())
            .await;
        assert!(err.is_err());
    }
}
