//! # rowsync protocol
//!
//! Row, filter, checkpoint and conflict types for the rowsync replication
//! engine.
//!
//! This crate provides:
//! - `Row` with its reserved sync columns
//! - `FilterSet` and the canonical `FilterSignature`
//! - `QueryRequest`, `SyncMode` and `PendingOperation`
//! - `CheckpointRecord` and the never-regress merge rule
//! - The last-write-wins conflict resolver
//! - `TableChange` events
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod conflict;
mod error;
mod event;
mod filter;
mod operation;
mod query;
mod request;
mod row;
pub mod timestamp;

pub use checkpoint::{CheckpointAdvance, CheckpointRecord, ResetScope};
pub use conflict::{resolve, Conflict, ConflictAction, Origin};
pub use error::{ProtocolError, ProtocolResult, ValidationError};
pub use event::{ChangeReason, TableChange};
pub use filter::{
    compare_values, validate_identifier, Filter, FilterOp, FilterSet, FilterSignature,
};
pub use operation::{Method, OpKey, PendingOperation, RowVersion};
pub use query::{KeysetCursor, OrderBy, RemoteQuery};
pub use request::{DataSource, FetchPolicy, QueryRequest, SyncMode};
pub use row::{Row, RowMap, CREATED_AT, DELETED_AT, ID, RESERVED_COLUMNS, SYNCED_AT, UPDATED_AT};
