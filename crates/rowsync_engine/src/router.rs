//! Sync-mode routing of read and write requests.
//!
//! | mode          | writes                                   | selects        |
//! |---------------|------------------------------------------|----------------|
//! | `localOnly`   | local                                    | local          |
//! | `localFirst`  | local, remote half queued                | local          |
//! | `remoteFirst` | remote, then the result applied locally  | both, merged   |
//! | `remoteOnly`  | remote                                   | both, merged   |

use crate::config::RemoteDeleteMode;
use crate::context::SyncContext;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::local::{LocalStore, SelectOptions};
use crate::queue::{QueueTicket, RemoteCallQueue};
use crate::transaction::{self, TxBuffer};
use parking_lot::Mutex;
use rowsync_protocol::timestamp;
use rowsync_protocol::{
    ChangeReason, DataSource, FetchPolicy, Filter, FilterSet, Method, PendingOperation,
    QueryRequest, RemoteQuery, Row, RowMap, RowVersion, SyncMode, ValidationError, DELETED_AT,
    ID, RESERVED_COLUMNS, UPDATED_AT,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Result of a routed request.
#[derive(Debug)]
pub struct QueryResponse {
    /// Rows read or written.
    pub data: Vec<Row>,
    /// Store the rows come from.
    pub source: DataSource,
    /// Outcome of the queued remote half of a `localFirst` write.
    pub pending: Option<QueueTicket>,
}

impl QueryResponse {
    fn new(data: Vec<Row>, source: DataSource) -> Self {
        Self {
            data,
            source,
            pending: None,
        }
    }
}

/// Where local writes of a request go.
#[derive(Clone, Copy)]
pub(crate) enum Scope<'a> {
    /// A standalone request; takes the write gate itself.
    Direct,
    /// Inside an open transaction that already holds the gate.
    Transaction(&'a Mutex<TxBuffer>),
}

/// Dispatches requests by [`SyncMode`].
pub struct SyncModeRouter {
    ctx: SyncContext,
    queue: Arc<RemoteCallQueue>,
}

impl SyncModeRouter {
    pub(crate) fn new(ctx: SyncContext, queue: Arc<RemoteCallQueue>) -> Self {
        Self { ctx, queue }
    }

    /// Runs one request.
    pub async fn execute(&self, request: QueryRequest) -> SyncResult<QueryResponse> {
        self.route(request, Scope::Direct).await
    }

    pub(crate) async fn route(&self, request: QueryRequest, scope: Scope<'_>) -> SyncResult<QueryResponse> {
        request.validate()?;
        if request.method == Method::Select {
            return self.select(&request).await;
        }
        if matches!(scope, Scope::Direct) {
            if let Some(tx_id) = transaction::current() {
                debug!(%tx_id, table = %request.table, "write outside the transaction router");
                return Err(SyncError::NestedTransaction);
            }
        }
        match request.mode {
            SyncMode::LocalOnly | SyncMode::LocalFirst => self.write_local_first(&request, scope).await,
            SyncMode::RemoteFirst | SyncMode::RemoteOnly => {
                if matches!(scope, Scope::Transaction(_)) {
                    return Err(ValidationError::UnsupportedMode(format!(
                        "{} writes cannot run inside a transaction",
                        request.mode
                    ))
                    .into());
                }
                self.write_remote_first(&request).await
            }
        }
    }

    async fn select(&self, request: &QueryRequest) -> SyncResult<QueryResponse> {
        let options = SelectOptions {
            order: &request.order,
            limit: request.limit,
            offset: request.offset,
            include_deleted: request.include_deleted,
        };
        let local = self.ctx.local.select(&request.table, &request.filters, options);
        if !request.mode.is_remote() {
            return Ok(QueryResponse::new(local.await?, DataSource::Local));
        }

        let (local, remote) = tokio::join!(local, self.remote_select(request));
        let (local, remote) = match (local, remote) {
            (Ok(local), Ok(remote)) => (local, remote),
            (local, remote) => {
                let err = SyncError::merge(local.err(), remote.err());
                return Err(err.unwrap_or_else(|| SyncError::local("select failed")));
            }
        };
        Ok(match request.effective_fetch_policy() {
            FetchPolicy::RemoteFirst => QueryResponse::new(remote, DataSource::Remote),
            FetchPolicy::LocalFirst => QueryResponse::new(local, DataSource::Local),
        })
    }

    async fn remote_select(&self, request: &QueryRequest) -> Result<Vec<Row>, RemoteError> {
        let mut filters = request.filters.clone();
        if !request.include_deleted {
            filters.push(Filter::is_null(DELETED_AT));
        }
        let mut query = RemoteQuery::new(filters);
        for order in &request.order {
            query = query.order_by(order.clone());
        }
        if let Some(limit) = request.limit {
            query = query.limit(limit);
        }
        if let Some(offset) = request.offset {
            query = query.offset(offset);
        }
        let rows = self.ctx.remote.select(&request.table, &query).await?;
        remote_rows(rows)
    }

    async fn write_local_first(&self, request: &QueryRequest, scope: Scope<'_>) -> SyncResult<QueryResponse> {
        let table = request.table.as_str();
        let local = &self.ctx.local;
        let gate = match scope {
            Scope::Direct => Some(local.lock_writes().await),
            Scope::Transaction(_) => None,
        };
        let rows = match request.method {
            Method::Insert => local.insert(table, request.payload_rows()?).await?,
            Method::Upsert => local.upsert(table, request.payload_rows()?).await?,
            Method::Update => local.update(table, &request.patch()?, &request.filters).await?,
            Method::Delete => local.soft_delete(table, &request.filters).await?,
            Method::Select => Vec::new(),
        };
        drop(gate);
        if matches!(scope, Scope::Direct) {
            self.ctx.emit(table, ChangeReason::LocalWrite, rows.len());
        }
        debug!(table, method = %request.method, mode = %request.mode, rows = rows.len(), "local write");

        let op = match request.mode {
            SyncMode::LocalFirst => remote_half(request, &rows)?,
            _ => None,
        };
        let mut response = QueryResponse::new(rows, DataSource::Local);
        if request.mode == SyncMode::LocalOnly {
            self.ctx
                .status
                .rows_pending(table, response.data.iter().map(|r| r.id.as_str()));
        }
        match (op, scope) {
            (Some(op), Scope::Direct) => response.pending = Some(self.queue.enqueue(op)),
            (Some(op), Scope::Transaction(buffer)) => {
                let mut buffer = buffer.lock();
                buffer.record(table, request.method, response.data.len());
                buffer.remote_calls.push(op);
            }
            (None, Scope::Transaction(buffer)) => {
                buffer.lock().record(table, request.method, response.data.len());
            }
            (None, Scope::Direct) => {}
        }
        Ok(response)
    }

    async fn write_remote_first(&self, request: &QueryRequest) -> SyncResult<QueryResponse> {
        let table = request.table.as_str();
        let remote = &self.ctx.remote;
        let now = timestamp::now();
        let returned = match request.method {
            Method::Insert => {
                let rows = remote_payload(LocalStore::prepare_new_rows(request.payload_rows()?)?);
                remote.insert(table, rows).await?
            }
            Method::Upsert => {
                let rows = remote_payload(LocalStore::prepare_new_rows(request.payload_rows()?)?);
                remote.upsert(table, rows, ID).await?
            }
            Method::Update => {
                let mut patch = remote_patch(&request.patch()?);
                patch.insert(UPDATED_AT.into(), Value::String(now.clone()));
                remote.update(table, patch, &request.filters).await?
            }
            Method::Delete => {
                let returned = remote.update(table, tombstone(&now), &request.filters).await?;
                if self.ctx.config.remote_delete == RemoteDeleteMode::Purge && !returned.is_empty() {
                    let ids = FilterSet::new().with(Filter::is_in(ID, returned_ids(&returned)));
                    remote.delete(table, &ids).await?;
                }
                returned
            }
            Method::Select => Vec::new(),
        };
        let rows = remote_rows(returned)?;
        debug!(table, method = %request.method, mode = %request.mode, rows = rows.len(), "remote write");

        if request.mode == SyncMode::RemoteFirst && !rows.is_empty() {
            let local = &self.ctx.local;
            let changed = {
                let _gate = local.lock_writes().await;
                match request.method {
                    Method::Delete => {
                        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
                        local.hard_delete_ids(table, &ids).await?
                    }
                    _ => local.apply_remote_rows(table, &rows, &now).await?,
                }
            };
            self.ctx.emit(table, ChangeReason::LocalWrite, changed);
        }
        Ok(QueryResponse::new(rows, DataSource::Remote))
    }
}

/// Builds the queued remote half of a `localFirst` write.
///
/// Upserts are never queued; the next push carries them.
fn remote_half(request: &QueryRequest, rows: &[Row]) -> SyncResult<Option<PendingOperation>> {
    if rows.is_empty() {
        return Ok(None);
    }
    let versions: Vec<RowVersion> = rows
        .iter()
        .map(|r| RowVersion::new(r.id.clone(), r.updated_at.clone()))
        .collect();
    let by_id = || FilterSet::new().with(Filter::is_in(ID, rows.iter().map(|r| r.id.clone())));
    let stamp = rows[0].updated_at.clone().unwrap_or_else(timestamp::now);
    let op = match request.method {
        Method::Insert => PendingOperation::new(&request.table, Method::Insert).with_payload(Value::Array(
            rows.iter().map(|r| Value::Object(r.to_remote_map())).collect(),
        )),
        Method::Update => {
            let mut patch = remote_patch(&request.patch()?);
            patch.insert(UPDATED_AT.into(), Value::String(stamp));
            PendingOperation::new(&request.table, Method::Update)
                .with_payload(Value::Object(patch))
                .with_filters(by_id())
        }
        Method::Delete => PendingOperation::new(&request.table, Method::Delete)
            .with_payload(Value::Object(tombstone(&stamp)))
            .with_filters(by_id()),
        Method::Upsert | Method::Select => return Ok(None),
    };
    Ok(Some(op.with_rows(versions)))
}

fn tombstone(at: &str) -> RowMap {
    let mut patch = RowMap::new();
    patch.insert(DELETED_AT.into(), Value::String(at.to_string()));
    patch.insert(UPDATED_AT.into(), Value::String(at.to_string()));
    patch
}

fn remote_patch(patch: &RowMap) -> RowMap {
    patch
        .iter()
        .filter(|(column, _)| !RESERVED_COLUMNS.contains(&column.as_str()))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

fn remote_payload(rows: Vec<Row>) -> Vec<RowMap> {
    rows.iter().map(Row::to_remote_map).collect()
}

fn returned_ids(rows: &[RowMap]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get(ID).and_then(Value::as_str).map(str::to_string))
        .collect()
}

fn remote_rows(rows: Vec<RowMap>) -> Result<Vec<Row>, RemoteError> {
    rows.into_iter()
        .map(|row| Row::from_map(row).map_err(|err| RemoteError::new(format!("malformed remote row: {err}"))))
        .collect()
}
