//! Remote store abstraction.
//!
//! [`RemoteStore`] is the engine's view of the remote relational store's
//! wire client. [`MemoryRemote`] implements it in memory for tests and
//! demos; it evaluates filters, ordering and keyset cursors the way a
//! relational store would and records every call it receives.

use crate::error::RemoteError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rowsync_protocol::{compare_values, FilterSet, RemoteQuery, RowMap, ID};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

/// Result of a remote call.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Remote relational store.
///
/// Write methods return the rows as stored by the remote.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reads rows.
    async fn select(&self, table: &str, query: &RemoteQuery) -> RemoteResult<Vec<RowMap>>;

    /// Inserts rows; fails with a duplicate-key error if any id exists.
    async fn insert(&self, table: &str, rows: Vec<RowMap>) -> RemoteResult<Vec<RowMap>>;

    /// Applies `patch` to the rows matching `filters`.
    async fn update(&self, table: &str, patch: RowMap, filters: &FilterSet) -> RemoteResult<Vec<RowMap>>;

    /// Inserts rows or merges them into existing rows keyed by `on_conflict`.
    async fn upsert(&self, table: &str, rows: Vec<RowMap>, on_conflict: &str) -> RemoteResult<Vec<RowMap>>;

    /// Physically deletes the rows matching `filters`.
    async fn delete(&self, table: &str, filters: &FilterSet) -> RemoteResult<Vec<RowMap>>;

    /// Calls a remote function.
    async fn rpc(&self, function: &str, args: Value) -> RemoteResult<Value>;
}

/// Reachability probe.
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Returns true if the remote store is believed reachable.
    async fn is_online(&self) -> bool;
}

/// A probe that always reports online.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

#[async_trait]
impl Connectivity for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// A probe toggled by hand.
#[derive(Debug)]
pub struct ManualConnectivity {
    online: AtomicBool,
}

impl ManualConnectivity {
    /// Creates a probe with an initial state.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Sets the reported state.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, AtomicOrdering::SeqCst);
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl Connectivity for ManualConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(AtomicOrdering::SeqCst)
    }
}

/// Remote method names, as recorded by [`MemoryRemote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteMethod {
    /// `select`
    Select,
    /// `insert`
    Insert,
    /// `update`
    Update,
    /// `upsert`
    Upsert,
    /// `delete`
    Delete,
    /// `rpc`
    Rpc,
}

/// A call received by [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    /// Method.
    pub method: RemoteMethod,
    /// Table, or function name for RPC.
    pub target: String,
    /// Rows sent with the call.
    pub rows: usize,
}

struct InjectedFailure {
    method: Option<RemoteMethod>,
    error: RemoteError,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<String, RowMap>>,
    calls: Vec<RemoteCall>,
    failures: VecDeque<InjectedFailure>,
    latency: Duration,
}

/// In-memory remote store.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts rows into a table directly, bypassing call recording.
    pub fn seed<I>(&self, table: &str, rows: I)
    where
        I: IntoIterator<Item = RowMap>,
    {
        let mut state = self.state.lock();
        let target = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(id) = row.get(ID).and_then(Value::as_str) {
                target.insert(id.to_string(), row);
            }
        }
    }

    /// Returns every row of a table ordered by id.
    pub fn rows(&self, table: &str) -> Vec<RowMap> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns one row by id.
    pub fn row(&self, table: &str, id: &str) -> Option<RowMap> {
        self.state.lock().tables.get(table)?.get(id).cloned()
    }

    /// Makes the next `count` calls fail with `error`.
    pub fn fail_next(&self, count: usize, error: RemoteError) {
        self.push_failures(None, count, error);
    }

    /// Makes the next `count` calls of `method` fail with `error`.
    pub fn fail_next_on(&self, method: RemoteMethod, count: usize, error: RemoteError) {
        self.push_failures(Some(method), count, error);
    }

    fn push_failures(&self, method: Option<RemoteMethod>, count: usize, error: RemoteError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.failures.push_back(InjectedFailure {
                method,
                error: error.clone(),
            });
        }
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Returns the recorded calls.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// Returns how many calls of `method` were received.
    pub fn call_count(&self, method: RemoteMethod) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    /// Returns how many write calls (everything but select) were received.
    pub fn write_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.method != RemoteMethod::Select)
            .count()
    }

    /// Forgets the recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Records a call, waits out the latency, then applies any injected failure.
    async fn enter(&self, method: RemoteMethod, target: &str, rows: usize) -> RemoteResult<()> {
        let latency = {
            let mut state = self.state.lock();
            state.calls.push(RemoteCall {
                method,
                target: target.to_string(),
                rows,
            });
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        let position = state
            .failures
            .iter()
            .position(|failure| failure.method.map_or(true, |m| m == method));
        match position.and_then(|index| state.failures.remove(index)) {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }

    fn apply_upsert(&self, table: &str, rows: Vec<RowMap>, on_conflict: &str) -> RemoteResult<Vec<RowMap>> {
        let mut state = self.state.lock();
        let target = state.tables.entry(table.to_string()).or_default();
        let mut stored = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            let key = row
                .get(on_conflict)
                .cloned()
                .ok_or_else(|| missing_column(on_conflict, index))?;
            let existing_id = if on_conflict == ID {
                key.as_str().map(str::to_string)
            } else {
                target
                    .iter()
                    .find(|(_, r)| compare_values(r.get(on_conflict).unwrap_or(&Value::Null), &key) == Some(Ordering::Equal))
                    .map(|(id, _)| id.clone())
            };
            let merged = match existing_id.as_ref().and_then(|id| target.get(id)) {
                Some(existing) => {
                    let mut merged = existing.clone();
                    merged.extend(row);
                    merged
                }
                None => row,
            };
            let id = merged
                .get(ID)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| missing_column(ID, index))?;
            target.insert(id, merged.clone());
            stored.push(merged);
        }
        Ok(stored)
    }
}

fn missing_column(column: &str, row: usize) -> RemoteError {
    RemoteError::new(format!("null value in column \"{column}\" violates not-null constraint"))
        .with_code("23502")
        .with_row(row)
}

fn sort_rows(rows: &mut [RowMap], query: &RemoteQuery) {
    rows.sort_by(|a, b| {
        for key in &query.order {
            let left = a.get(&key.column).unwrap_or(&Value::Null);
            let right = b.get(&key.column).unwrap_or(&Value::Null);
            let ordering = match (left.is_null(), right.is_null()) {
                (true, true) => Ordering::Equal,
                // NULLS LAST ascending, NULLS FIRST descending.
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => compare_values(left, right).unwrap_or(Ordering::Equal),
            };
            let ordering = if key.descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn project(row: &RowMap, columns: Option<&[String]>) -> RowMap {
    match columns {
        None => row.clone(),
        Some(columns) => columns
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
            .collect(),
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(&self, table: &str, query: &RemoteQuery) -> RemoteResult<Vec<RowMap>> {
        self.enter(RemoteMethod::Select, table, 0).await?;
        let state = self.state.lock();
        let mut rows: Vec<RowMap> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| query.filters.matches(row))
                    .filter(|row| query.after.as_ref().map_or(true, |cursor| cursor.admits(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_rows(&mut rows, query);
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows
            .iter()
            .skip(offset)
            .take(limit)
            .map(|row| project(row, query.columns.as_deref()))
            .collect())
    }

    async fn insert(&self, table: &str, rows: Vec<RowMap>) -> RemoteResult<Vec<RowMap>> {
        self.enter(RemoteMethod::Insert, table, rows.len()).await?;
        let mut state = self.state.lock();
        let target = state.tables.entry(table.to_string()).or_default();
        let mut ids = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let id = row
                .get(ID)
                .and_then(Value::as_str)
                .ok_or_else(|| missing_column(ID, index))?;
            if target.contains_key(id) || ids.contains(&id) {
                return Err(RemoteError::duplicate_key(format!(
                    "duplicate key value violates unique constraint \"{table}_pkey\""
                ))
                .with_row(index));
            }
            ids.push(id);
        }
        let ids: Vec<String> = ids.into_iter().map(str::to_string).collect();
        for (id, row) in ids.into_iter().zip(rows.iter()) {
            target.insert(id, row.clone());
        }
        Ok(rows)
    }

    async fn update(&self, table: &str, patch: RowMap, filters: &FilterSet) -> RemoteResult<Vec<RowMap>> {
        self.enter(RemoteMethod::Update, table, 1).await?;
        let mut state = self.state.lock();
        let Some(target) = state.tables.get_mut(table) else {
            return Ok(Vec::new());
        };
        let mut updated = Vec::new();
        for row in target.values_mut().filter(|row| filters.matches(row)) {
            for (column, value) in &patch {
                if column != ID {
                    row.insert(column.clone(), value.clone());
                }
            }
            updated.push(row.clone());
        }
        Ok(updated)
    }

    async fn upsert(&self, table: &str, rows: Vec<RowMap>, on_conflict: &str) -> RemoteResult<Vec<RowMap>> {
        self.enter(RemoteMethod::Upsert, table, rows.len()).await?;
        self.apply_upsert(table, rows, on_conflict)
    }

    async fn delete(&self, table: &str, filters: &FilterSet) -> RemoteResult<Vec<RowMap>> {
        self.enter(RemoteMethod::Delete, table, 0).await?;
        let mut state = self.state.lock();
        let Some(target) = state.tables.get_mut(table) else {
            return Ok(Vec::new());
        };
        let doomed: Vec<String> = target
            .iter()
            .filter(|(_, row)| filters.matches(row))
            .map(|(id, _)| id.clone())
            .collect();
        Ok(doomed.iter().filter_map(|id| target.remove(id)).collect())
    }

    async fn rpc(&self, function: &str, args: Value) -> RemoteResult<Value> {
        let rows = args
            .get("rows")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        self.enter(RemoteMethod::Rpc, function, rows).await?;
        match function {
            "bulk_upsert" => {
                let table = args
                    .get("table")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RemoteError::new("bulk_upsert requires a table"))?;
                let on_conflict = args.get("on_conflict").and_then(Value::as_str).unwrap_or(ID);
                let rows = args
                    .get("rows")
                    .and_then(Value::as_array)
                    .ok_or_else(|| RemoteError::new("bulk_upsert requires rows"))?
                    .iter()
                    .map(|row| match row {
                        Value::Object(map) => Ok(map.clone()),
                        _ => Err(RemoteError::new("bulk_upsert rows must be objects")),
                    })
                    .collect::<RemoteResult<Vec<_>>>()?;
                let stored = self.apply_upsert(table, rows, on_conflict)?;
                Ok(Value::Array(stored.into_iter().map(Value::Object).collect()))
            }
            other => Err(RemoteError::new(format!("function {other} does not exist")).with_code("42883")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_protocol::{Filter, FilterOp, KeysetCursor, OrderBy};
    use serde_json::json;

    fn obj(value: Value) -> RowMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn seeded() -> MemoryRemote {
        let remote = MemoryRemote::new();
        remote.seed(
            "todos",
            [
                obj(json!({ "id": "a", "updated_at": "2024-01-01T00:00:00Z", "deleted_at": null })),
                obj(json!({ "id": "b", "updated_at": "2024-01-01T00:00:00Z", "deleted_at": null })),
                obj(json!({ "id": "c", "updated_at": "2024-01-02T00:00:00Z", "deleted_at": "2024-01-02T00:00:00Z" })),
            ],
        );
        remote
    }

    #[tokio::test]
    async fn select_applies_cursor_order_and_limit() {
        let remote = seeded();
        let query = RemoteQuery::new(FilterSet::new())
            .order_by(OrderBy::asc("updated_at"))
            .order_by(OrderBy::asc("id"))
            .after(KeysetCursor::new("2024-01-01T00:00:00Z", Some("a".into())))
            .limit(1);
        let rows = remote.select("todos", &query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("b"));

        let live = RemoteQuery::new(FilterSet::new().with(Filter::is_null("deleted_at"))).columns(["id"]);
        let rows = remote.select("todos", &live).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 1);
    }

    #[tokio::test]
    async fn insert_reports_duplicate_keys() {
        let remote = seeded();
        let err = remote
            .insert("todos", vec![obj(json!({ "id": "z" })), obj(json!({ "id": "a" }))])
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(err.row, Some(1));
        assert!(remote.row("todos", "z").is_none());
    }

    #[tokio::test]
    async fn upsert_merges_columns() {
        let remote = seeded();
        remote
            .upsert("todos", vec![obj(json!({ "id": "a", "title": "x" }))], "id")
            .await
            .unwrap();
        let row = remote.row("todos", "a").unwrap();
        assert_eq!(row["title"], json!("x"));
        assert_eq!(row["updated_at"], json!("2024-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn update_and_delete_use_filters() {
        let remote = seeded();
        let filters = FilterSet::new().with(Filter::new("updated_at", FilterOp::Lt, "2024-01-02T00:00:00Z"));
        let updated = remote
            .update("todos", obj(json!({ "title": "old" })), &filters)
            .await
            .unwrap();
        assert_eq!(updated.len(), 2);
        let removed = remote.delete("todos", &filters).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(remote.rows("todos").len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let remote = seeded();
        remote.fail_next_on(RemoteMethod::Upsert, 1, RemoteError::new("503"));
        assert!(remote.select("todos", &RemoteQuery::default()).await.is_ok());
        assert!(remote.upsert("todos", vec![], "id").await.is_err());
        assert!(remote.upsert("todos", vec![], "id").await.is_ok());
        assert_eq!(remote.call_count(RemoteMethod::Upsert), 2);
        assert_eq!(remote.write_count(), 2);
    }

    #[tokio::test]
    async fn bulk_upsert_rpc() {
        let remote = MemoryRemote::new();
        let out = remote
            .rpc("bulk_upsert", json!({ "table": "todos", "rows": [{ "id": "a" }] }))
            .await
            .unwrap();
        assert_eq!(out.as_array().map(Vec::len), Some(1));
        assert!(remote.rpc("nope", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn manual_connectivity() {
        let network = ManualConnectivity::new(false);
        assert!(!network.is_online().await);
        network.set_online(true);
        assert!(network.is_online().await);
        assert!(AlwaysOnline.is_online().await);
    }
}
