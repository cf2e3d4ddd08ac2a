//! Shared state handed to every orchestrator.

use crate::checkpoint::CheckpointStore;
use crate::config::SyncConfig;
use crate::local::LocalStore;
use crate::remote::{Connectivity, RemoteStore};
use crate::status::StatusBoard;
use rowsync_protocol::{ChangeReason, TableChange};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub(crate) struct SyncContext {
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) local: LocalStore,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) connectivity: Arc<dyn Connectivity>,
    pub(crate) checkpoints: Arc<CheckpointStore>,
    pub(crate) status: Arc<StatusBoard>,
    pub(crate) events: broadcast::Sender<TableChange>,
}

impl SyncContext {
    pub(crate) fn new(
        config: SyncConfig,
        local: LocalStore,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            checkpoints: Arc::new(CheckpointStore::new(local.clone())),
            config: Arc::new(config),
            local,
            remote,
            connectivity,
            status: Arc::new(StatusBoard::new()),
            events,
        }
    }

    /// Publishes a change; having no subscribers is fine.
    pub(crate) fn emit(&self, table: &str, reason: ChangeReason, rows: usize) {
        if rows > 0 {
            let _ = self.events.send(TableChange::new(table, reason, rows));
        }
    }
}
