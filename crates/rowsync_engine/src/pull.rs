//! Pull orchestration.
//!
//! A pull first replays remote deletions newer than `last_deleted_at`, then
//! walks live rows after the `(updated_at, id)` cursor in ascending order.
//! Every page is resolved against the local copy and written in one step
//! under the write gate, and only then recorded in the checkpoint, so a
//! crash between the two replays at most one page.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::flight::InFlight;
use rowsync_protocol::timestamp;
use rowsync_protocol::{
    ChangeReason, CheckpointAdvance, Conflict, ConflictAction, Filter, FilterOp, FilterSet,
    KeysetCursor, Origin, OrderBy, RemoteQuery, Row, DELETED_AT, ID, UPDATED_AT,
};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tracing::{debug, info, warn};

/// Counters of one completed pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Table pulled.
    pub table: String,
    /// Local rows removed because the remote deleted them.
    pub deleted: usize,
    /// Remote rows written locally.
    pub applied: usize,
    /// Remote rows that lost to a newer local row.
    pub skipped: usize,
    /// Pages of live rows fetched.
    pub pages: usize,
}

/// Outcome of [`PullOrchestrator::pull`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The pull ran to the end of the remote data.
    Completed(PullReport),
    /// Another pull of the same table was in flight; nothing was done.
    AlreadyRunning,
    /// The pull was cancelled; committed pages stay committed.
    Cancelled,
}

impl PullOutcome {
    /// Returns the report of a completed pull.
    pub fn report(&self) -> Option<&PullReport> {
        match self {
            PullOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// One page of a backward backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillPage {
    /// Rows written locally.
    pub applied: usize,
    /// Rows that lost to a newer local row.
    pub skipped: usize,
    /// Oldest `updated_at` in the page; the next call's boundary.
    pub oldest: Option<String>,
    /// Whether the remote may hold older rows.
    pub has_more: bool,
}

/// Pulls remote changes into the local store.
pub struct PullOrchestrator {
    ctx: SyncContext,
    flights: InFlight,
    generation: AtomicU64,
}

impl PullOrchestrator {
    pub(crate) fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            flights: InFlight::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Discards whatever page an in-flight pull is fetching.
    pub fn cancel_in_flight(&self) {
        self.generation.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// Returns true if a pull of `table` is running.
    pub fn is_running(&self, table: &str) -> bool {
        self.flights.is_held(table)
    }

    /// Pulls one table for one filter set.
    pub async fn pull(&self, table: &str, filters: &FilterSet) -> SyncResult<PullOutcome> {
        let Some(_flight) = self.flights.try_acquire(table) else {
            debug!(table, "pull already running");
            return Ok(PullOutcome::AlreadyRunning);
        };
        filters.validate()?;
        let generation = self.generation.load(AtomicOrdering::SeqCst);
        let mut report = PullReport {
            table: table.to_string(),
            ..PullReport::default()
        };

        let result = self.run(table, filters, generation, &mut report).await;
        self.ctx.status.record(|stats| {
            stats.rows_pulled += report.applied as u64;
            stats.rows_deleted += report.deleted as u64;
            stats.conflicts_skipped += report.skipped as u64;
        });
        match result {
            Ok(()) => {
                self.ctx.status.pull_finished(table, None);
                info!(
                    table,
                    applied = report.applied,
                    deleted = report.deleted,
                    skipped = report.skipped,
                    "pull complete"
                );
                Ok(PullOutcome::Completed(report))
            }
            Err(SyncError::Cancelled) => {
                info!(table, applied = report.applied, "pull cancelled");
                Ok(PullOutcome::Cancelled)
            }
            Err(err) => {
                warn!(table, error = %err, "pull failed");
                self.ctx.status.pull_finished(table, Some(err.to_string()));
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        table: &str,
        filters: &FilterSet,
        generation: u64,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        let checkpoint = self.ctx.checkpoints.get(table, filters).await?;
        self.pull_deletions(table, filters, &checkpoint.last_deleted_at, generation, report)
            .await?;
        self.pull_updates(table, filters, checkpoint.cursor(), generation, report)
            .await
    }

    async fn pull_deletions(
        &self,
        table: &str,
        filters: &FilterSet,
        since: &str,
        generation: u64,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        let page_size = self.ctx.config.pull_page_size.max(1);
        let base = RemoteQuery::new(
            filters
                .clone()
                .with(Filter::new(DELETED_AT, FilterOp::Gt, since)),
        )
        .columns([ID, DELETED_AT])
        .order_by(OrderBy::desc(DELETED_AT))
        .order_by(OrderBy::asc(ID))
        .limit(page_size);

        let mut newest: Option<String> = None;
        let mut offset = 0;
        loop {
            let page = self
                .ctx
                .remote
                .select(table, &base.clone().offset(offset))
                .await?;
            self.check_generation(generation)?;
            let fetched = page.len();
            let mut ids = Vec::with_capacity(fetched);
            for row in &page {
                if let Some(Value::String(id)) = row.get(ID) {
                    ids.push(id.clone());
                }
                if let Some(Value::String(deleted_at)) = row.get(DELETED_AT) {
                    newest = timestamp::later_of(newest.as_deref(), Some(deleted_at.as_str()));
                }
            }
            if !ids.is_empty() {
                let removed = {
                    let _gate = self.ctx.local.lock_writes().await;
                    self.ctx.local.hard_delete_ids(table, &ids).await?
                };
                report.deleted += removed;
                self.ctx.emit(table, ChangeReason::PullDelete, removed);
                debug!(table, rows = removed, "applied remote deletions");
            }
            offset += fetched;
            if fetched < page_size {
                break;
            }
        }

        if let Some(newest) = newest {
            self.ctx
                .checkpoints
                .advance(table, filters, CheckpointAdvance::deleted(newest))
                .await?;
        }
        Ok(())
    }

    async fn pull_updates(
        &self,
        table: &str,
        filters: &FilterSet,
        mut cursor: KeysetCursor,
        generation: u64,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        let page_size = self.ctx.config.pull_page_size.max(1);
        let live = filters.clone().with(Filter::is_null(DELETED_AT));
        loop {
            let query = RemoteQuery::new(live.clone())
                .after(cursor.clone())
                .order_by(OrderBy::asc(UPDATED_AT))
                .order_by(OrderBy::asc(ID))
                .limit(page_size);
            let page = self.ctx.remote.select(table, &query).await?;
            self.check_generation(generation)?;
            let fetched = page.len();
            if fetched == 0 {
                break;
            }
            let rows = page
                .into_iter()
                .map(Row::from_map)
                .collect::<Result<Vec<_>, _>>()?;
            let last = rows
                .last()
                .and_then(|row| row.updated_at.clone().map(|at| (at, row.id.clone())));

            let (applied, skipped) = {
                let _gate = self.ctx.local.lock_writes().await;
                self.check_generation(generation)?;
                self.merge_page(table, rows).await?
            };
            report.pages += 1;
            report.applied += applied;
            report.skipped += skipped;
            self.ctx.emit(table, ChangeReason::Pull, applied);
            debug!(table, page = report.pages, rows = applied, skipped, "pulled page");

            match last {
                Some((updated_at, id)) => {
                    let advanced = self
                        .ctx
                        .checkpoints
                        .advance(table, filters, CheckpointAdvance::synced(updated_at, id))
                        .await?;
                    cursor = advanced.cursor();
                }
                None => {
                    warn!(table, "remote page ended with a row without updated_at");
                    break;
                }
            }
            if fetched < page_size {
                break;
            }
        }
        Ok(())
    }

    /// Pages backward from `before` (or the oldest local row) without
    /// touching the checkpoint.
    pub async fn fetch_older(
        &self,
        table: &str,
        filters: &FilterSet,
        before: Option<String>,
        limit: usize,
    ) -> SyncResult<BackfillPage> {
        filters.validate()?;
        let limit = limit.max(1);
        let earliest = self.ctx.local.earliest_updated_at(table, filters).await?;
        let boundary = match (before, earliest) {
            (Some(before), Some(earliest)) => {
                if timestamp::compare(&before, &earliest) == Ordering::Less {
                    before
                } else {
                    earliest
                }
            }
            (Some(before), None) => before,
            (None, Some(earliest)) => earliest,
            (None, None) => timestamp::now(),
        };

        let query = RemoteQuery::new(
            filters
                .clone()
                .with(Filter::new(UPDATED_AT, FilterOp::Lt, boundary.as_str()))
                .with(Filter::is_null(DELETED_AT)),
        )
        .order_by(OrderBy::desc(UPDATED_AT))
        .order_by(OrderBy::desc(ID))
        .limit(limit);
        let rows = self
            .ctx
            .remote
            .select(table, &query)
            .await?
            .into_iter()
            .map(Row::from_map)
            .collect::<Result<Vec<_>, _>>()?;

        let fetched = rows.len();
        let oldest = rows.last().and_then(|row| row.updated_at.clone());
        let (applied, skipped) = {
            let _gate = self.ctx.local.lock_writes().await;
            self.merge_page(table, rows).await?
        };
        self.ctx.emit(table, ChangeReason::Backfill, applied);
        debug!(table, %boundary, rows = applied, skipped, "backfilled page");
        Ok(BackfillPage {
            applied,
            skipped,
            oldest,
            has_more: fetched == limit,
        })
    }

    /// Resolves incoming rows against their local copies and writes the
    /// winners, returning applied and skipped counts.
    ///
    /// Callers hold the write gate across the read and the write.
    async fn merge_page(&self, table: &str, rows: Vec<Row>) -> SyncResult<(usize, usize)> {
        let ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();
        let existing = self.ctx.local.rows_by_ids(table, &ids).await?;
        let yield_every = self.ctx.config.pull_yield_every.max(1);
        let mut accepted = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for (index, row) in rows.into_iter().enumerate() {
            if index > 0 && index % yield_every == 0 {
                tokio::task::yield_now().await;
            }
            let local = existing.get(&row.id);
            let action = match Conflict::detect(table, &row, Origin::Remote, local) {
                Some(conflict) => {
                    let action = conflict.action;
                    if local.is_some_and(|local| !local.is_synced()) {
                        debug!(table, id = %row.id, ?action, "remote row met unpushed local edit");
                        self.ctx.status.record_conflict(conflict);
                    }
                    action
                }
                None => ConflictAction::Insert,
            };
            if action.applies() {
                accepted.push(row);
            } else {
                skipped += 1;
            }
        }
        let applied = self
            .ctx
            .local
            .apply_remote_rows(table, &accepted, &timestamp::now())
            .await?;
        Ok((applied, skipped))
    }

    fn check_generation(&self, generation: u64) -> SyncResult<()> {
        if self.generation.load(AtomicOrdering::SeqCst) == generation {
            Ok(())
        } else {
            Err(SyncError::Cancelled)
        }
    }
}
