//! Error types for the sync engine.

use rowsync_protocol::{ProtocolError, ValidationError};
use std::fmt;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Postgres unique-violation SQLSTATE.
pub const DUPLICATE_KEY_CODE: &str = "23505";

/// Error reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Error message.
    pub message: String,
    /// Store-specific error code, if any.
    pub code: Option<String>,
    /// Index of the offending row in a bulk request.
    pub row: Option<usize>,
}

impl RemoteError {
    /// Creates an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            row: None,
        }
    }

    /// Sets the error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Sets the offending row index.
    pub fn with_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    /// A unique-constraint violation.
    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::new(message).with_code(DUPLICATE_KEY_CODE)
    }

    /// Returns true if the store reported a unique-constraint violation.
    ///
    /// For an idempotent replay this means the write already landed.
    pub fn is_duplicate_key(&self) -> bool {
        self.code.as_deref() == Some(DUPLICATE_KEY_CODE)
            || self.message.to_ascii_lowercase().contains("duplicate key")
    }

    /// Returns true if the call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        !self.is_duplicate_key()
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code {code})")?;
        }
        if let Some(row) = self.row {
            write!(f, " at row {row}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The local row store failed.
    #[error("local store error: {0}")]
    Local(String),

    /// The remote store failed.
    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    /// Both stores failed on the same request.
    #[error("local and remote stores failed: local: {local}; remote: {remote}")]
    Common {
        /// Local failure.
        local: String,
        /// Remote failure.
        remote: RemoteError,
    },

    /// The request is malformed.
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// A transaction was opened inside another one.
    #[error("transactions cannot be nested")]
    NestedTransaction,

    /// A local failure rolled the transaction back.
    #[error("transaction rolled back: {0}")]
    TransactionRollback(String),

    /// The operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The remote store is unreachable.
    #[error("remote store is offline")]
    Offline,

    /// The engine is misconfigured or used after shutdown.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates a local store error.
    pub fn local(message: impl Into<String>) -> Self {
        Self::Local(message.into())
    }

    /// Merges the outcome of a request that hit both stores.
    ///
    /// Only local failed: `Local`. Only remote failed: `Remote`. Both
    /// failed: `Common`. Neither: `None`.
    pub fn merge(local: Option<SyncError>, remote: Option<RemoteError>) -> Option<SyncError> {
        match (local, remote) {
            (None, None) => None,
            (Some(local), None) => Some(local),
            (None, Some(remote)) => Some(SyncError::Remote(remote)),
            (Some(local), Some(remote)) => Some(SyncError::Common {
                local: local.to_string(),
                remote,
            }),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(err) => err.is_retryable(),
            SyncError::Common { remote, .. } => remote.is_retryable(),
            SyncError::Offline => true,
            _ => false,
        }
    }

    /// Returns the remote half of the error, if any.
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            SyncError::Remote(err) | SyncError::Common { remote: err, .. } => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Local(err.to_string())
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Validation(err) => Self::Validation(err),
            ProtocolError::InvalidIdentifier(name) => {
                Self::Validation(ValidationError::InvalidColumn(name))
            }
            other => Self::Local(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Local(format!("serialization error: {err}"))
    }
}
