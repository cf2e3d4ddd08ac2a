//! # rowsync engine
//!
//! Local-first replication between an embedded SQLite store and a remote
//! relational store.
//!
//! This crate provides:
//! - Checkpointed incremental pull (deletions first, then keyset-paged updates)
//! - Chunked push of unsynced rows and tombstones with last-write-wins
//! - A FIFO outbound queue with offline waits, backoff and dedup
//! - Routing of reads and writes by `SyncMode`
//! - Local transactions whose remote calls are deferred until commit
//! - Per-table and per-row status plus `TableChange` events
//!
//! ## Architecture
//!
//! A [`SyncEngine`] owns the state shared by the pull and push
//! orchestrators, the queue and the router. Local writes are serialized
//! through a single write gate; remote calls never run while it is held.
//!
//! ## Key Invariants
//!
//! - Checkpoints never move backwards
//! - A pulled row replaces the local copy only if its `updated_at` is
//!   strictly newer, whether or not the local copy was pushed
//! - A row is marked synced only after the remote accepted that version
//! - Queued remote calls apply at most once per operation key

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod context;
mod engine;
mod error;
mod flight;
mod local;
mod pull;
mod push;
mod queue;
mod remote;
mod router;
mod sqlite;
mod status;
mod transaction;

pub use checkpoint::{CheckpointStore, CHECKPOINT_TABLE};
pub use config::{RemoteDeleteMode, RetryConfig, SyncConfig};
pub use engine::{SyncCycleReport, SyncEngine, TableSyncReport};
pub use error::{RemoteError, SyncError, SyncResult, DUPLICATE_KEY_CODE};
pub use local::{LocalDriver, LocalStore, PendingCounts, SelectOptions, Statement};
pub use pull::{BackfillPage, PullOrchestrator, PullOutcome, PullReport};
pub use push::{PushOrchestrator, PushReport, TablePushReport};
pub use queue::{QueueStats, QueueTicket, RemoteCallQueue};
pub use remote::{
    AlwaysOnline, Connectivity, ManualConnectivity, MemoryRemote, RemoteCall, RemoteMethod,
    RemoteResult, RemoteStore,
};
pub use router::{QueryResponse, SyncModeRouter};
pub use sqlite::SqliteDriver;
pub use status::{StatusBoard, SyncState, SyncStats, SyncStatus, TableStatus, RECENT_CONFLICTS};
pub use transaction::{BufferedWrite, TransactionCoordinator, TransactionRouter};
