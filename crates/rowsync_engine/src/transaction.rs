//! Local transactions with deferred remote calls.
//!
//! The coordinator takes the write gate, opens an explicit transaction and
//! hands the closure a [`TransactionRouter`]. Local writes run inside the
//! transaction; their remote halves are buffered and only enqueued after
//! `COMMIT`. On error everything is rolled back and nothing is enqueued.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::queue::RemoteCallQueue;
use crate::router::{QueryResponse, Scope, SyncModeRouter};
use parking_lot::Mutex;
use rowsync_protocol::{ChangeReason, Method, PendingOperation, QueryRequest};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

tokio::task_local! {
    static TRANSACTION: String;
}

/// Returns the id of the transaction the current task runs in.
pub(crate) fn current() -> Option<String> {
    TRANSACTION.try_with(Clone::clone).ok()
}

/// A local write made inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedWrite {
    /// Table written.
    pub table: String,
    /// Write method.
    pub method: Method,
    /// Rows affected.
    pub rows: usize,
}

#[derive(Debug, Default)]
pub(crate) struct TxBuffer {
    pub(crate) local_ops: Vec<BufferedWrite>,
    pub(crate) remote_calls: Vec<PendingOperation>,
}

impl TxBuffer {
    pub(crate) fn record(&mut self, table: &str, method: Method, rows: usize) {
        self.local_ops.push(BufferedWrite {
            table: table.to_string(),
            method,
            rows,
        });
    }
}

/// Request router bound to an open transaction.
#[derive(Clone)]
pub struct TransactionRouter {
    router: Arc<SyncModeRouter>,
    buffer: Arc<Mutex<TxBuffer>>,
    tx_id: String,
}

impl TransactionRouter {
    /// Returns the transaction id.
    pub fn id(&self) -> &str {
        &self.tx_id
    }

    /// Runs a request inside the transaction.
    ///
    /// Only `localOnly` and `localFirst` writes are accepted.
    pub async fn execute(&self, request: QueryRequest) -> SyncResult<QueryResponse> {
        self.router
            .route(request, Scope::Transaction(&self.buffer))
            .await
    }

    /// Returns the local writes made so far.
    pub fn writes(&self) -> Vec<BufferedWrite> {
        self.buffer.lock().local_ops.clone()
    }
}

/// Runs closures inside local transactions.
pub struct TransactionCoordinator {
    ctx: SyncContext,
    router: Arc<SyncModeRouter>,
    queue: Arc<RemoteCallQueue>,
}

impl TransactionCoordinator {
    pub(crate) fn new(ctx: SyncContext, router: Arc<SyncModeRouter>, queue: Arc<RemoteCallQueue>) -> Self {
        Self { ctx, router, queue }
    }

    /// Runs `f` in a transaction.
    ///
    /// Fails with [`SyncError::NestedTransaction`] when called from inside
    /// another transaction.
    pub async fn run<F, Fut, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(TransactionRouter) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        if let Some(outer) = current() {
            warn!(%outer, "nested transaction rejected");
            return Err(SyncError::NestedTransaction);
        }

        let tx_id = uuid::Uuid::new_v4().to_string();
        let gate = self.ctx.local.lock_writes().await;
        self.ctx.local.begin().await?;
        debug!(%tx_id, "transaction started");

        let buffer = Arc::new(Mutex::new(TxBuffer::default()));
        let router = TransactionRouter {
            router: Arc::clone(&self.router),
            buffer: Arc::clone(&buffer),
            tx_id: tx_id.clone(),
        };
        let result = TRANSACTION.scope(tx_id.clone(), f(router)).await;

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                if let Err(rollback) = self.ctx.local.rollback().await {
                    warn!(%tx_id, error = %rollback, "rollback failed");
                }
                drop(gate);
                info!(%tx_id, error = %err, "transaction rolled back");
                return Err(match err {
                    SyncError::Local(message) => SyncError::TransactionRollback(message),
                    other => other,
                });
            }
        };
        if let Err(err) = self.ctx.local.commit().await {
            if let Err(rollback) = self.ctx.local.rollback().await {
                warn!(%tx_id, error = %rollback, "rollback after failed commit failed");
            }
            return Err(SyncError::TransactionRollback(err.to_string()));
        }
        drop(gate);

        let TxBuffer {
            local_ops,
            remote_calls,
        } = std::mem::take(&mut *buffer.lock());
        let calls = remote_calls.len();
        for op in remote_calls {
            self.queue.enqueue(op);
        }
        let mut per_table: BTreeMap<&str, usize> = BTreeMap::new();
        for write in &local_ops {
            *per_table.entry(write.table.as_str()).or_default() += write.rows;
        }
        for (table, rows) in per_table {
            self.ctx.emit(table, ChangeReason::Transaction, rows);
        }
        info!(%tx_id, writes = local_ops.len(), queued = calls, "transaction committed");
        Ok(value)
    }
}
