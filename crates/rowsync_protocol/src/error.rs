//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A reserved row column had the wrong type or was missing.
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// A table or column name is not a plain identifier.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A value could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A request failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A malformed request. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The request does not name a table.
    #[error("request is missing a table name")]
    MissingTable,

    /// The table name is not a plain identifier.
    #[error("invalid table name: {0:?}")]
    InvalidTable(String),

    /// A write was issued without a payload.
    #[error("{method} on {table} requires a payload")]
    MissingPayload {
        /// Table name.
        table: String,
        /// Method name.
        method: String,
    },

    /// A payload was supplied where none is accepted.
    #[error("{method} on {table} does not accept a payload")]
    UnexpectedPayload {
        /// Table name.
        table: String,
        /// Method name.
        method: String,
    },

    /// An update/delete was issued without filters.
    #[error("{method} on {table} requires at least one filter")]
    MissingFilters {
        /// Table name.
        table: String,
        /// Method name.
        method: String,
    },

    /// An array payload was supplied where a single row is expected.
    #[error("{method} on {table} expects a single object, got an array")]
    ArrayPayload {
        /// Table name.
        table: String,
        /// Method name.
        method: String,
    },

    /// The payload (or one of its elements) is not a JSON object.
    #[error("payload for {table} must be an object or an array of objects")]
    InvalidPayload {
        /// Table name.
        table: String,
    },

    /// The payload tries to change a row id.
    #[error("update on {table} cannot change the row id")]
    ImmutableId {
        /// Table name.
        table: String,
    },

    /// The sync mode is not allowed in this context.
    #[error("{0}")]
    UnsupportedMode(String),

    /// A column name is not a plain identifier.
    #[error("invalid column name: {0:?}")]
    InvalidColumn(String),
}
