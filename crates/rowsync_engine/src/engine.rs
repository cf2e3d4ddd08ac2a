//! The long-lived sync engine.
//!
//! [`SyncEngine`] owns every piece of shared state: configuration, both
//! stores, the checkpoint store, orchestrators, the outbound queue, the
//! status board, the change channel, single-flight flags and timers.

use crate::checkpoint::CheckpointStore;
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::flight::InFlight;
use crate::local::{LocalDriver, LocalStore, PendingCounts};
use crate::pull::{BackfillPage, PullOrchestrator, PullOutcome, PullReport};
use crate::push::{PushOrchestrator, PushReport, TablePushReport};
use crate::queue::{QueueStats, RemoteCallQueue};
use crate::remote::{Connectivity, RemoteStore};
use crate::router::{QueryResponse, SyncModeRouter};
use crate::status::{SyncState, SyncStats, SyncStatus, TableStatus};
use crate::transaction::{TransactionCoordinator, TransactionRouter};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rowsync_protocol::{validate_identifier, Conflict, FilterSet, QueryRequest, TableChange};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CYCLE: &str = "cycle";

/// Result of one full sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleReport {
    /// Push results.
    pub push: PushReport,
    /// Results of the pulls that completed.
    pub pulls: Vec<PullReport>,
    /// Tables whose push or pull failed.
    pub failed_tables: Vec<String>,
    /// Wall time of the cycle.
    pub duration: Duration,
}

impl SyncCycleReport {
    /// Returns true if every table synced.
    pub fn is_success(&self) -> bool {
        self.failed_tables.is_empty()
    }
}

/// Result of [`SyncEngine::sync_table`].
#[derive(Debug, Clone)]
pub struct TableSyncReport {
    /// Table synced.
    pub table: String,
    /// Push result; `None` for excluded tables or a push already running.
    pub push: Option<TablePushReport>,
    /// Pull result.
    pub pull: PullOutcome,
}

/// Local-first replication engine.
pub struct SyncEngine {
    ctx: SyncContext,
    pull: PullOrchestrator,
    push: PushOrchestrator,
    queue: Arc<RemoteCallQueue>,
    router: Arc<SyncModeRouter>,
    transactions: TransactionCoordinator,
    cycles: InFlight,
    last_cycle: Mutex<Option<Instant>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl SyncEngine {
    /// Creates the engine, ensures the checkpoint schema and starts the
    /// queue worker. Must be called within a tokio runtime.
    pub async fn init(
        config: SyncConfig,
        driver: Arc<dyn LocalDriver>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn Connectivity>,
    ) -> SyncResult<Arc<Self>> {
        for table in config.managed_tables.iter().chain(&config.excluded_tables) {
            validate_identifier(table)
                .map_err(|_| SyncError::Config(format!("invalid table name {table:?}")))?;
        }
        if let Some(function) = &config.bulk_upsert_rpc {
            validate_identifier(function)
                .map_err(|_| SyncError::Config(format!("invalid function name {function:?}")))?;
        }

        let local = LocalStore::new(driver, config.max_bind_params);
        let ctx = SyncContext::new(config, local, remote, connectivity);
        ctx.checkpoints.ensure_schema().await?;

        let queue = Arc::new(RemoteCallQueue::start(ctx.clone()));
        let router = Arc::new(SyncModeRouter::new(ctx.clone(), Arc::clone(&queue)));
        let transactions =
            TransactionCoordinator::new(ctx.clone(), Arc::clone(&router), Arc::clone(&queue));
        info!(
            tables = ?ctx.config.managed_tables,
            excluded = ?ctx.config.excluded_tables,
            "sync engine initialized"
        );
        Ok(Arc::new(Self {
            pull: PullOrchestrator::new(ctx.clone()),
            push: PushOrchestrator::new(ctx.clone()),
            ctx,
            queue,
            router,
            transactions,
            cycles: InFlight::new(),
            last_cycle: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.ctx.config
    }

    /// Returns the checkpoint store.
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.ctx.checkpoints
    }

    /// Runs one full cycle: push every table, then pull every table.
    ///
    /// Returns `None` when a cycle is already running, the engine is shut
    /// down, or (unless `force`) the remote is offline or the last cycle
    /// finished less than `min_sync_interval` ago.
    pub async fn sync_all(&self, force: bool) -> Option<SyncCycleReport> {
        if self.is_shut_down() {
            return None;
        }
        let Some(_flight) = self.cycles.try_acquire(CYCLE) else {
            debug!("sync cycle already running");
            return None;
        };
        if !force {
            if !self.ctx.connectivity.is_online().await {
                debug!("remote offline, skipping sync cycle");
                return None;
            }
            let last = *self.last_cycle.lock();
            if let Some(last) = last {
                if last.elapsed() < self.ctx.config.min_sync_interval {
                    debug!("sync cycle throttled");
                    return None;
                }
            }
        }

        let started = Instant::now();
        let status = &self.ctx.status;
        status.set_state(SyncState::Pushing);
        let push = self.push.push_all().await;
        let mut failed_tables: Vec<String> = push
            .tables
            .iter()
            .filter(|table| !table.is_success())
            .map(|table| table.table.clone())
            .collect();

        status.set_state(SyncState::Pulling);
        let concurrency = self.ctx.config.table_concurrency.max(1);
        let all = FilterSet::new();
        let outcomes = stream::iter(self.ctx.config.managed_tables.clone())
            .map(|table| {
                let all = &all;
                async move {
                    let outcome = self.pull.pull(&table, all).await;
                    (table, outcome)
                }
            })
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await;
        let mut pulls = Vec::new();
        for (table, outcome) in outcomes {
            match outcome {
                Ok(PullOutcome::Completed(report)) => pulls.push(report),
                Ok(PullOutcome::AlreadyRunning | PullOutcome::Cancelled) => {}
                Err(_) => {
                    if !failed_tables.contains(&table) {
                        failed_tables.push(table);
                    }
                }
            }
        }

        *self.last_cycle.lock() = Some(Instant::now());
        let duration = started.elapsed();
        status.record(|stats| {
            stats.cycles_completed += 1;
            stats.last_sync_time = Some(Instant::now());
        });
        if failed_tables.is_empty() && !status.any_table_failed() {
            status.set_state(SyncState::Synced);
        } else {
            status.set_state(SyncState::Error);
        }
        info!(
            pushed = push.upserted() + push.deleted(),
            pulled = pulls.iter().map(|p| p.applied).sum::<usize>(),
            failed = failed_tables.len(),
            ?duration,
            "sync cycle complete"
        );
        Some(SyncCycleReport {
            push,
            pulls,
            failed_tables,
            duration,
        })
    }

    /// Pushes then pulls one managed table.
    ///
    /// Returns `Ok(None)` if a sync of the same table is already running.
    pub async fn sync_table(&self, table: &str) -> SyncResult<Option<TableSyncReport>> {
        self.ensure_running()?;
        if !self.ctx.config.is_managed(table) {
            return Err(SyncError::Config(format!("table {table} is not managed")));
        }
        let Some(_flight) = self.cycles.try_acquire(&format!("table:{table}")) else {
            debug!(table, "table sync already running");
            return Ok(None);
        };
        let push = if self.ctx.config.push_tables().iter().any(|t| t == table) {
            self.push.push_table(table).await
        } else {
            None
        };
        let pull = self.pull.pull(table, &FilterSet::new()).await?;
        Ok(Some(TableSyncReport {
            table: table.to_string(),
            push,
            pull,
        }))
    }

    /// Pushes every pushable table now.
    pub async fn push(&self) -> PushReport {
        self.push.push_all().await
    }

    /// Pulls one table for one filter set.
    pub async fn pull(&self, table: &str, filters: &FilterSet) -> SyncResult<PullOutcome> {
        self.ensure_running()?;
        self.pull.pull(table, filters).await
    }

    /// Routes a read or write by its sync mode.
    pub async fn execute(&self, request: QueryRequest) -> SyncResult<QueryResponse> {
        self.ensure_running()?;
        self.router.execute(request).await
    }

    /// Runs `f` inside a local transaction.
    pub async fn with_transaction<F, Fut, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(TransactionRouter) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.ensure_running()?;
        self.transactions.run(f).await
    }

    /// Loads one page of rows older than anything pulled so far.
    pub async fn fetch_older(
        &self,
        table: &str,
        filters: &FilterSet,
        before: Option<String>,
        limit: usize,
    ) -> SyncResult<BackfillPage> {
        self.ensure_running()?;
        self.pull.fetch_older(table, filters, before, limit).await
    }

    /// Returns the engine state.
    pub fn sync_status(&self) -> SyncState {
        self.ctx.status.state()
    }

    /// Returns the engine counters.
    pub fn stats(&self) -> SyncStats {
        self.ctx.status.stats()
    }

    /// Returns the status of a table.
    pub fn table_status(&self, table: &str) -> Option<TableStatus> {
        self.ctx.status.table(table)
    }

    /// Returns the status of a row.
    pub fn row_status(&self, table: &str, id: &str) -> Option<SyncStatus> {
        self.ctx.status.row(table, id)
    }

    /// Returns the latest remote rows that met unpushed local edits.
    pub fn recent_conflicts(&self) -> Vec<Conflict> {
        self.ctx.status.recent_conflicts()
    }

    /// Counts rows waiting for push.
    pub async fn pending_counts(&self, table: &str) -> SyncResult<PendingCounts> {
        self.ctx.local.pending_counts(table).await
    }

    /// Returns the queue counters.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Waits until the outbound queue is drained.
    pub async fn wait_for_queue(&self) {
        self.queue.wait_idle().await;
    }

    /// Subscribes to table change events.
    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.ctx.events.subscribe()
    }

    /// Cancels in-flight pulls; committed pages stay.
    pub fn cancel_pulls(&self) {
        self.pull.cancel_in_flight();
        debug!("in-flight pulls cancelled");
    }

    /// Starts the push and pull timers configured by `push_interval` and
    /// `pull_interval`. Calling it again while running does nothing.
    pub fn start_auto_sync(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        let mut timers = self.timers.lock();
        if !timers.is_empty() {
            return;
        }
        if let Some(every) = self.ctx.config.push_interval {
            timers.push(spawn_timer(Arc::downgrade(self), every, |engine| async move {
                if engine.ctx.connectivity.is_online().await {
                    engine.push.push_all().await;
                }
            }));
        }
        if let Some(every) = self.ctx.config.pull_interval {
            timers.push(spawn_timer(Arc::downgrade(self), every, |engine| async move {
                if !engine.ctx.connectivity.is_online().await {
                    return;
                }
                for table in &engine.ctx.config.managed_tables {
                    if let Err(err) = engine.pull.pull(table, &FilterSet::new()).await {
                        warn!(table = %table, error = %err, "scheduled pull failed");
                    }
                }
            }));
        }
        info!(timers = timers.len(), "auto sync started");
    }

    /// Stops the timers. Safe to call when they are not running.
    pub fn stop_auto_sync(&self) {
        let mut timers = self.timers.lock();
        if timers.is_empty() {
            return;
        }
        for timer in timers.drain(..) {
            timer.abort();
        }
        info!("auto sync stopped");
    }

    /// Clears in-memory status, queue counters and the confirmed-key cache.
    pub fn reset(&self) {
        self.ctx.status.reset();
        self.queue.reset();
        *self.last_cycle.lock() = None;
        info!("sync engine reset");
    }

    /// Stops the timers and the queue worker.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_auto_sync();
        self.pull.cancel_in_flight();
        self.queue.close();
        info!("sync engine shut down");
    }

    /// Returns true after [`SyncEngine::shutdown`].
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.is_shut_down() {
            Err(SyncError::Config("sync engine is shut down".into()))
        } else {
            Ok(())
        }
    }
}

/// Runs `tick` every `every` until the engine is dropped.
fn spawn_timer<F, Fut>(engine: Weak<SyncEngine>, every: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<SyncEngine>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(engine) = engine.upgrade() else {
                break;
            };
            tick(engine).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ManualConnectivity, MemoryRemote};
    use crate::sqlite::SqliteDriver;
    use rowsync_protocol::SyncMode;
    use serde_json::json;

    async fn engine(
        config: SyncConfig,
    ) -> (Arc<SyncEngine>, Arc<MemoryRemote>, Arc<ManualConnectivity>) {
        let driver = SqliteDriver::open_in_memory().unwrap();
        driver.execute_batch(crate::context::testing::TODOS).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let network = Arc::new(ManualConnectivity::new(true));
        let engine = SyncEngine::init(config, Arc::new(driver), remote.clone(), network.clone())
            .await
            .unwrap();
        (engine, remote, network)
    }

    #[tokio::test]
    async fn rejects_bad_table_names() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        let result = SyncEngine::init(
            SyncConfig::new(["todos; drop"]),
            Arc::new(driver),
            Arc::new(MemoryRemote::new()),
            Arc::new(ManualConnectivity::default()),
        )
        .await;
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn sync_all_skips_offline_and_throttles() {
        let (engine, _, network) = engine(SyncConfig::new(["todos"])).await;
        network.set_online(false);
        assert!(engine.sync_all(false).await.is_none());
        assert!(engine.sync_all(true).await.is_some());

        network.set_online(true);
        assert!(engine.sync_all(false).await.is_none(), "inside min_sync_interval");
        assert_eq!(engine.stats().cycles_completed, 1);
        assert_eq!(engine.sync_status(), SyncState::Synced);
    }

    #[tokio::test]
    async fn cycle_pushes_then_pulls() {
        let (engine, remote, _) = engine(SyncConfig::new(["todos"])).await;
        engine
            .execute(QueryRequest::insert("todos", json!({ "id": "a" })).mode(SyncMode::LocalOnly))
            .await
            .unwrap();
        remote.seed(
            "todos",
            [crate::context::testing::obj(json!({
                "id": "r", "updated_at": "2024-01-01T00:00:00.000Z", "deleted_at": null
            }))],
        );
        let report = engine.sync_all(true).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.push.upserted(), 1);
        assert!(remote.row("todos", "a").is_some());
        let local = engine
            .execute(QueryRequest::select("todos").mode(SyncMode::LocalOnly))
            .await
            .unwrap();
        assert_eq!(local.data.len(), 2);
        assert_eq!(engine.pending_counts("todos").await.unwrap().total(), 0);
        let pulled: usize = report.pulls.iter().map(|p| p.applied).sum();
        assert!(pulled >= 1);
    }

    #[tokio::test]
    async fn unmanaged_table_sync_is_rejected() {
        let (engine, _, _) = engine(SyncConfig::new(["todos"])).await;
        assert!(matches!(engine.sync_table("notes").await, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn auto_sync_is_idempotent_and_stoppable() {
        let config = SyncConfig::new(["todos"])
            .with_push_interval(Duration::from_millis(20))
            .with_pull_interval(Duration::from_millis(20));
        let (engine, remote, _) = engine(config).await;
        engine.start_auto_sync();
        engine.start_auto_sync();
        assert_eq!(engine.timers.lock().len(), 2);

        engine
            .execute(QueryRequest::insert("todos", json!({ "id": "a" })).mode(SyncMode::LocalOnly))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(remote.row("todos", "a").is_some());

        engine.stop_auto_sync();
        engine.stop_auto_sync();
        assert!(engine.timers.lock().is_empty());
    }

    #[tokio::test]
    async fn shutdown_rejects_further_work() {
        let (engine, _, _) = engine(SyncConfig::new(["todos"])).await;
        engine.shutdown();
        assert!(engine.sync_all(true).await.is_none());
        assert!(engine.execute(QueryRequest::select("todos")).await.is_err());
    }
}
