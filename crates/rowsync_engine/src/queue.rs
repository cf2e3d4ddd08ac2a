//! Outbound remote call queue.
//!
//! A single worker task sends queued operations strictly in FIFO order.
//! Each operation carries an [`OpKey`]; keys that the remote confirmed
//! are remembered (up to `dedup_capacity`) so a replayed operation is
//! acknowledged without a second remote write.

use crate::config::RemoteDeleteMode;
use crate::context::SyncContext;
use crate::error::{RemoteError, SyncResult};
use crate::status::SyncStatus;
use parking_lot::Mutex;
use rowsync_protocol::timestamp;
use rowsync_protocol::{
    ChangeReason, Method, OpKey, PendingOperation, RowMap, RowVersion, DELETED_AT, ID, UPDATED_AT,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counters of the queue since start or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Operations accepted.
    pub enqueued: u64,
    /// Operations the remote applied.
    pub applied: u64,
    /// Operations given up on.
    pub failed: u64,
    /// Operations acknowledged from the confirmed-key set.
    pub deduplicated: u64,
    /// Retries after a remote error.
    pub retries: u64,
    /// Waits while the remote was offline.
    pub offline_waits: u64,
}

/// Handle to the outcome of a queued operation.
#[derive(Debug)]
pub struct QueueTicket {
    op_key: OpKey,
    rx: oneshot::Receiver<bool>,
}

impl QueueTicket {
    fn resolved(op_key: OpKey, applied: bool) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(applied);
        Self { op_key, rx }
    }

    /// Returns the idempotency key of the operation.
    pub fn op_key(&self) -> OpKey {
        self.op_key
    }

    /// Waits until the remote applied the operation or the queue gave up.
    pub async fn applied(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

struct Job {
    op: PendingOperation,
    done: oneshot::Sender<bool>,
}

/// Bounded FIFO set of confirmed keys.
struct ConfirmedKeys {
    order: VecDeque<OpKey>,
    keys: HashSet<OpKey>,
    capacity: usize,
}

impl ConfirmedKeys {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            keys: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, key: &OpKey) -> bool {
        self.keys.contains(key)
    }

    fn insert(&mut self, key: OpKey) {
        if !self.keys.insert(key) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.keys.remove(&evicted);
            }
        }
    }

    fn clear(&mut self) {
        self.order.clear();
        self.keys.clear();
    }
}

/// What one operation sends.
enum Outbound {
    Nothing,
    Insert(Vec<RowMap>),
    Upsert(Vec<RowMap>),
    Update(RowMap),
    Delete(RowMap),
}

impl Outbound {
    fn from_operation(op: &PendingOperation) -> Result<Self, String> {
        Ok(match op.method {
            Method::Select => Outbound::Nothing,
            Method::Insert => Outbound::Insert(rows_of(op)?),
            Method::Upsert => Outbound::Upsert(rows_of(op)?),
            Method::Update => Outbound::Update(object_of(op)?),
            Method::Delete => match &op.payload {
                Some(_) => Outbound::Delete(object_of(op)?),
                None => {
                    let now = timestamp::now();
                    let mut patch = RowMap::new();
                    patch.insert(DELETED_AT.into(), Value::String(now.clone()));
                    patch.insert(UPDATED_AT.into(), Value::String(now));
                    Outbound::Delete(patch)
                }
            },
        })
    }
}

fn rows_of(op: &PendingOperation) -> Result<Vec<RowMap>, String> {
    match &op.payload {
        Some(Value::Object(row)) => Ok(vec![row.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row.clone()),
                other => Err(format!("row payload must be an object, got {other}")),
            })
            .collect(),
        other => Err(format!("{} needs row payload, got {other:?}", op.method)),
    }
}

fn object_of(op: &PendingOperation) -> Result<RowMap, String> {
    match &op.payload {
        Some(Value::Object(patch)) => Ok(patch.clone()),
        other => Err(format!("{} needs an object payload, got {other:?}", op.method)),
    }
}

/// Rows a successful remote call reached.
enum Touched {
    /// Every row of the payload.
    All,
    /// Only the rows the remote returned.
    Ids(HashSet<String>),
}

impl Touched {
    fn returned(rows: &[RowMap]) -> Self {
        Touched::Ids(
            rows.iter()
                .filter_map(|row| row.get(ID).and_then(Value::as_str).map(str::to_string))
                .collect(),
        )
    }

    fn contains(&self, id: &str) -> bool {
        match self {
            Touched::All => true,
            Touched::Ids(ids) => ids.contains(id),
        }
    }
}

struct Shared {
    ctx: SyncContext,
    pending: AtomicUsize,
    idle: Notify,
    stats: Mutex<QueueStats>,
    confirmed: Mutex<ConfirmedKeys>,
    closed: AtomicBool,
}

/// FIFO queue of remote calls with a single worker.
pub struct RemoteCallQueue {
    tx: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteCallQueue {
    /// Starts the worker. Must be called within a tokio runtime.
    pub(crate) fn start(ctx: SyncContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            confirmed: Mutex::new(ConfirmedKeys::new(ctx.config.dedup_capacity)),
            ctx,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            stats: Mutex::new(QueueStats::default()),
            closed: AtomicBool::new(false),
        });
        let worker = tokio::spawn(Arc::clone(&shared).run(rx));
        Self {
            tx,
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues an operation.
    pub fn enqueue(&self, op: PendingOperation) -> QueueTicket {
        let op_key = op.op_key;
        if self.shared.confirmed.lock().contains(&op_key) {
            self.shared.stats.lock().deduplicated += 1;
            debug!(%op_key, "operation already confirmed");
            return QueueTicket::resolved(op_key, true);
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            warn!(%op_key, table = %op.table, "queue closed, dropping operation");
            return QueueTicket::resolved(op_key, false);
        }

        let ids = op.row_ids();
        self.shared
            .ctx
            .status
            .rows_pending(&op.table, ids.iter().map(String::as_str));
        self.shared.stats.lock().enqueued += 1;
        self.shared.pending.fetch_add(1, Ordering::SeqCst);

        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Job { op, done }) {
            self.shared.finish_one();
            warn!(op_key = %job.op.op_key, "queue worker gone, dropping operation");
            return QueueTicket::resolved(op_key, false);
        }
        QueueTicket { op_key, rx }
    }

    /// Number of operations queued or in flight.
    pub fn len(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Returns true if nothing is queued or in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until every queued operation has been resolved.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Returns the counters.
    pub fn stats(&self) -> QueueStats {
        *self.shared.stats.lock()
    }

    /// Forgets confirmed keys and counters.
    pub fn reset(&self) {
        self.shared.confirmed.lock().clear();
        *self.shared.stats.lock() = QueueStats::default();
    }

    /// Stops the worker. Unresolved tickets resolve to `false`.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        self.shared.pending.store(0, Ordering::SeqCst);
        self.shared.idle.notify_waiters();
        info!("remote call queue closed");
    }
}

impl Shared {
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(Job { mut op, done }) = rx.recv().await {
            let applied = if self.confirmed.lock().contains(&op.op_key) {
                self.stats.lock().deduplicated += 1;
                true
            } else {
                self.process(&mut op).await
            };
            let _ = done.send(applied);
            self.finish_one();
        }
        debug!("remote call queue worker stopped");
    }

    fn finish_one(&self) {
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 {
            self.idle.notify_waiters();
        }
    }

    async fn process(&self, op: &mut PendingOperation) -> bool {
        let outbound = match Outbound::from_operation(op) {
            Ok(outbound) => outbound,
            Err(reason) => {
                warn!(op_key = %op.op_key, table = %op.table, %reason, "malformed operation");
                self.give_up(op, reason);
                return false;
            }
        };

        let config = &self.ctx.config;
        let attempts = config.queue_retry.max_attempts.max(1);
        let mut offline_waits = 0;
        let touched = loop {
            if !self.ctx.connectivity.is_online().await {
                if offline_waits >= config.offline_retry_limit {
                    warn!(op_key = %op.op_key, table = %op.table, "remote offline, giving up");
                    self.give_up(op, "remote store is offline".into());
                    return false;
                }
                offline_waits += 1;
                self.stats.lock().offline_waits += 1;
                debug!(op_key = %op.op_key, attempt = offline_waits, "remote offline, waiting");
                tokio::time::sleep(config.offline_retry_delay).await;
                continue;
            }

            match self.send(op, &outbound).await {
                Ok(touched) => break touched,
                Err(err) if err.is_duplicate_key() => {
                    debug!(op_key = %op.op_key, table = %op.table, "duplicate key, already applied");
                    break Touched::All;
                }
                Err(err) if op.retry_count + 1 < attempts => {
                    op.retry_count += 1;
                    let delay = config.queue_retry.delay_for_attempt(op.retry_count);
                    warn!(
                        op_key = %op.op_key,
                        table = %op.table,
                        attempt = op.retry_count,
                        error = %err,
                        ?delay,
                        "remote call failed, retrying"
                    );
                    self.stats.lock().retries += 1;
                    self.ctx.status.record(|stats| stats.retries += 1);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(op_key = %op.op_key, table = %op.table, error = %err, "remote call failed");
                    self.give_up(op, err.to_string());
                    return false;
                }
            }
        };

        self.confirmed.lock().insert(op.op_key);
        self.stats.lock().applied += 1;
        if let Err(err) = self.reconcile(op, &touched).await {
            // The remote has the change; the next push repairs local state.
            warn!(op_key = %op.op_key, table = %op.table, error = %err, "local reconcile failed");
        }
        true
    }

    async fn send(&self, op: &PendingOperation, outbound: &Outbound) -> Result<Touched, RemoteError> {
        let remote = &self.ctx.remote;
        let table = op.table.as_str();
        match outbound {
            Outbound::Nothing => Ok(Touched::All),
            Outbound::Insert(rows) => remote.insert(table, rows.clone()).await.map(|_| Touched::All),
            Outbound::Upsert(rows) => remote.upsert(table, rows.clone(), ID).await.map(|_| Touched::All),
            Outbound::Update(patch) => {
                let updated = remote.update(table, patch.clone(), &op.filters).await?;
                Ok(Touched::returned(&updated))
            }
            Outbound::Delete(tombstone) => {
                let updated = remote.update(table, tombstone.clone(), &op.filters).await?;
                if self.ctx.config.remote_delete == RemoteDeleteMode::Purge {
                    remote.delete(table, &op.filters).await?;
                }
                Ok(Touched::returned(&updated))
            }
        }
    }

    /// Brings the local rows the remote now holds in line with it.
    ///
    /// Rows a filtered call did not reach stay pending for the next push.
    async fn reconcile(&self, op: &PendingOperation, touched: &Touched) -> SyncResult<()> {
        let rows: Vec<RowVersion> = op
            .rows
            .iter()
            .filter(|row| touched.contains(&row.id))
            .cloned()
            .collect();
        let missed = op.rows.len() - rows.len();
        if missed > 0 {
            debug!(op_key = %op.op_key, table = %op.table, missed, "remote call missed rows, left pending");
        }
        if rows.is_empty() {
            return Ok(());
        }
        let local = &self.ctx.local;
        let table = op.table.as_str();
        match op.method {
            Method::Select => {}
            Method::Insert | Method::Update | Method::Upsert => {
                let marked = {
                    let _gate = local.lock_writes().await;
                    local.mark_synced(table, &rows, &timestamp::now()).await?
                };
                self.ctx.emit(table, ChangeReason::Push, marked);
            }
            Method::Delete => {
                let purged = {
                    let _gate = local.lock_writes().await;
                    local.purge_deleted(table, &rows).await?
                };
                self.ctx.emit(table, ChangeReason::Purge, purged);
            }
        }
        self.ctx.status.set_rows(
            table,
            rows.iter().map(|row| row.id.as_str()),
            SyncStatus::Success,
        );
        debug!(op_key = %op.op_key, table, rows = rows.len(), "operation reconciled");
        Ok(())
    }

    fn give_up(&self, op: &PendingOperation, reason: String) {
        self.stats.lock().failed += 1;
        let ids = op.row_ids();
        self.ctx
            .status
            .set_rows(&op.table, ids.iter().map(String::as_str), SyncStatus::Error);
        self.ctx.status.record(|stats| stats.last_error = Some(reason));
    }
}
