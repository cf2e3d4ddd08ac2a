//! Push orchestration.
//!
//! Local rows with `synced_at IS NULL` are upserted and tombstones are
//! sent as soft deletes, chunk by chunk. Before a chunk is sent the remote
//! versions of its rows are read; a row the remote already holds in a
//! newer version is left for the next pull. Rows are only marked synced or
//! purged after the remote accepted them, so a failed push loses nothing.

use crate::config::RemoteDeleteMode;
use crate::context::SyncContext;
use crate::error::{RemoteError, SyncResult};
use crate::flight::InFlight;
use crate::remote::RemoteResult;
use crate::status::SyncStatus;
use futures::stream::{self, StreamExt};
use rowsync_protocol::timestamp;
use rowsync_protocol::{
    resolve, ChangeReason, ConflictAction, Filter, FilterSet, Origin, RemoteQuery, Row, RowMap,
    RowVersion, ID, UPDATED_AT,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info, warn};

/// Counters of one table's push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TablePushReport {
    /// Table pushed.
    pub table: String,
    /// Rows the remote accepted (or already had).
    pub upserted: usize,
    /// Tombstones the remote accepted and that were purged locally.
    pub deleted: usize,
    /// Rows held back because the remote copy is newer.
    pub skipped_newer: usize,
    /// Chunks that exhausted their retries.
    pub failed_chunks: usize,
}

impl TablePushReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    /// Returns true if every chunk went through.
    pub fn is_success(&self) -> bool {
        self.failed_chunks == 0
    }
}

/// Counters of one push over every table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Per-table reports; tables with a push already in flight are absent.
    pub tables: Vec<TablePushReport>,
}

impl PushReport {
    /// Total rows upserted.
    pub fn upserted(&self) -> usize {
        self.tables.iter().map(|t| t.upserted).sum()
    }

    /// Total tombstones pushed.
    pub fn deleted(&self) -> usize {
        self.tables.iter().map(|t| t.deleted).sum()
    }

    /// Returns the report of one table.
    pub fn table(&self, table: &str) -> Option<&TablePushReport> {
        self.tables.iter().find(|t| t.table == table)
    }
}

/// Pushes local changes to the remote store.
pub struct PushOrchestrator {
    ctx: SyncContext,
    flights: InFlight,
}

impl PushOrchestrator {
    pub(crate) fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            flights: InFlight::new(),
        }
    }

    /// Pushes every pushable table, a bounded number at a time.
    ///
    /// Never fails: per-table errors end up in the table status.
    pub async fn push_all(&self) -> PushReport {
        let concurrency = self.ctx.config.table_concurrency.max(1);
        let tables = stream::iter(self.ctx.config.push_tables())
            .map(|table| async move { self.push_table(&table).await })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
        PushReport {
            tables: tables.into_iter().flatten().collect(),
        }
    }

    /// Pushes one table. Returns `None` if a push of it is already running.
    pub async fn push_table(&self, table: &str) -> Option<TablePushReport> {
        let Some(_flight) = self.flights.try_acquire(table) else {
            debug!(table, "push already running");
            return None;
        };
        let mut report = TablePushReport::new(table);
        let mut last_error = None;
        let chunk_size = self.ctx.config.push_chunk_size.max(1);

        match self.ctx.local.unsynced_rows(table).await {
            Ok(rows) => {
                for chunk in rows.chunks(chunk_size) {
                    if let Err(err) = self.push_upserts(table, chunk, &mut report).await {
                        self.chunk_failed(table, chunk, &err.to_string(), &mut report);
                        last_error = Some(err.to_string());
                    }
                }
            }
            Err(err) => last_error = Some(err.to_string()),
        }
        match self.ctx.local.deleted_rows(table).await {
            Ok(rows) => {
                for chunk in rows.chunks(chunk_size) {
                    if let Err(err) = self.push_deletes(table, chunk, &mut report).await {
                        self.chunk_failed(table, chunk, &err.to_string(), &mut report);
                        last_error = Some(err.to_string());
                    }
                }
            }
            Err(err) => last_error = Some(err.to_string()),
        }

        self.ctx.status.record(|stats| {
            stats.rows_pushed += (report.upserted + report.deleted) as u64;
        });
        self.ctx.status.push_finished(table, last_error);
        if report.upserted + report.deleted > 0 || !report.is_success() {
            info!(
                table,
                upserted = report.upserted,
                deleted = report.deleted,
                skipped_newer = report.skipped_newer,
                failed_chunks = report.failed_chunks,
                "push complete"
            );
        }
        Some(report)
    }

    async fn push_upserts(&self, table: &str, chunk: &[Row], report: &mut TablePushReport) -> SyncResult<()> {
        let (send, current, newer) = self.split_chunk(table, chunk).await?;
        report.skipped_newer += newer;

        if !send.is_empty() {
            let rows: Vec<RowMap> = send.iter().map(|row| row.to_remote_map()).collect();
            self.send_rows(table, &rows).await?;
        }

        let versions: Vec<RowVersion> = send.iter().chain(current.iter()).map(version).collect();
        let marked = {
            let _gate = self.ctx.local.lock_writes().await;
            self.ctx.local.mark_synced(table, &versions, &timestamp::now()).await?
        };
        report.upserted += marked;
        self.ctx.status.set_rows(
            table,
            versions.iter().map(|v| v.id.as_str()),
            SyncStatus::Success,
        );
        self.ctx.emit(table, ChangeReason::Push, marked);
        debug!(table, sent = send.len(), marked, "pushed upsert chunk");
        Ok(())
    }

    async fn push_deletes(&self, table: &str, chunk: &[Row], report: &mut TablePushReport) -> SyncResult<()> {
        let (send, current, newer) = self.split_chunk(table, chunk).await?;
        report.skipped_newer += newer;

        if !send.is_empty() {
            let rows: Vec<RowMap> = send.iter().map(|row| row.to_remote_map()).collect();
            self.send_rows(table, &rows).await?;
            if self.ctx.config.remote_delete == RemoteDeleteMode::Purge {
                let filters = FilterSet::new().with(Filter::is_in(ID, send.iter().map(|r| r.id.clone())));
                let remote = &self.ctx.remote;
                let filters = &filters;
                self.with_retry(table, "remote delete", move || async move {
                    remote.delete(table, filters).await.map(drop)
                })
                .await?;
            }
        }

        let versions: Vec<RowVersion> = send.iter().chain(current.iter()).map(version).collect();
        let purged = {
            let _gate = self.ctx.local.lock_writes().await;
            self.ctx.local.purge_deleted(table, &versions).await?
        };
        report.deleted += purged;
        self.ctx.emit(table, ChangeReason::Purge, purged);
        debug!(table, sent = send.len(), purged, "pushed delete chunk");
        Ok(())
    }

    /// Sorts a chunk into rows to send, rows the remote already has in
    /// exactly this version, and a count of rows the remote has newer.
    async fn split_chunk<'a>(
        &self,
        table: &str,
        chunk: &'a [Row],
    ) -> SyncResult<(Vec<&'a Row>, Vec<&'a Row>, usize)> {
        let remote = self.remote_versions(table, chunk).await?;
        let mut send = Vec::with_capacity(chunk.len());
        let mut current = Vec::new();
        let mut newer = 0;
        for row in chunk {
            let existing = remote.get(&row.id);
            match resolve(row, Origin::Local, existing) {
                ConflictAction::Insert | ConflictAction::Update => send.push(row),
                ConflictAction::Skip => {
                    let same = existing.is_some_and(|remote_row| {
                        remote_row.updated_at_or(Origin::Remote.epoch())
                            == row.updated_at_or(Origin::Local.epoch())
                    });
                    if same {
                        current.push(row);
                    } else {
                        newer += 1;
                        debug!(table, id = %row.id, "remote row is newer, leaving it for pull");
                    }
                }
            }
        }
        Ok((send, current, newer))
    }

    async fn remote_versions(&self, table: &str, chunk: &[Row]) -> SyncResult<HashMap<String, Row>> {
        let query = RemoteQuery::new(
            FilterSet::new().with(Filter::is_in(ID, chunk.iter().map(|r| r.id.clone()))),
        )
        .columns([ID, UPDATED_AT]);
        let remote = &self.ctx.remote;
        let query = &query;
        let rows = self
            .with_retry(table, "version check", move || async move {
                remote.select(table, query).await
            })
            .await?;
        rows.into_iter()
            .map(|map| -> SyncResult<(String, Row)> {
                let row = Row::from_map(map)?;
                Ok((row.id.clone(), row))
            })
            .collect()
    }

    /// Sends rows with the configured upsert path.
    ///
    /// A duplicate-key answer means an earlier attempt already landed.
    async fn send_rows(&self, table: &str, rows: &[RowMap]) -> SyncResult<()> {
        let remote = &self.ctx.remote;
        let result = match self.ctx.config.bulk_upsert_rpc.as_deref() {
            Some(function) => {
                let args = json!({
                    "table": table,
                    "rows": rows.iter().cloned().map(Value::Object).collect::<Vec<_>>(),
                });
                let args = &args;
                self.with_retry(table, "bulk upsert", move || async move {
                    remote.rpc(function, args.clone()).await.map(drop)
                })
                .await
            }
            None => {
                self.with_retry(table, "upsert", move || async move {
                    remote.upsert(table, rows.to_vec(), ID).await.map(drop)
                })
                .await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_duplicate_key() => {
                debug!(table, rows = rows.len(), "duplicate key, chunk already applied");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn with_retry<T, F, Fut>(&self, table: &str, what: &str, mut call: F) -> RemoteResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let retry = &self.ctx.config.push_retry;
        let attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(table, attempt, error = %err, ?delay, "{what} failed, retrying");
                    self.ctx.status.record(|stats| stats.retries += 1);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn chunk_failed(&self, table: &str, chunk: &[Row], error: &str, report: &mut TablePushReport) {
        report.failed_chunks += 1;
        self.ctx
            .status
            .set_rows(table, chunk.iter().map(|r| r.id.as_str()), SyncStatus::Error);
        warn!(table, rows = chunk.len(), error, "push chunk failed, rows stay pending");
    }
}

fn version(row: &&Row) -> RowVersion {
    RowVersion::new(row.id.clone(), row.updated_at.clone())
}
