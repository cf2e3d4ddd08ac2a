//! Routed query requests.

use crate::error::ValidationError;
use crate::filter::{validate_identifier, Filter, FilterSet};
use crate::operation::Method;
use crate::query::OrderBy;
use crate::row::{RowMap, ID};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// How a request is routed between the local and remote stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Local store only; nothing is sent.
    LocalOnly,
    /// Remote store only; the local copy is untouched.
    RemoteOnly,
    /// Write locally, queue the remote half.
    #[default]
    LocalFirst,
    /// Write remotely, then apply the returned rows locally.
    RemoteFirst,
}

impl SyncMode {
    /// Returns true if the request contacts the remote store before returning.
    pub fn is_remote(&self) -> bool {
        matches!(self, SyncMode::RemoteOnly | SyncMode::RemoteFirst)
    }

    /// Fetch policy used when the request does not name one.
    pub fn default_fetch_policy(&self) -> FetchPolicy {
        if self.is_remote() {
            FetchPolicy::RemoteFirst
        } else {
            FetchPolicy::LocalFirst
        }
    }

    /// Returns the mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::LocalOnly => "localOnly",
            SyncMode::RemoteOnly => "remoteOnly",
            SyncMode::LocalFirst => "localFirst",
            SyncMode::RemoteFirst => "remoteFirst",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which store's data a select returns when both were read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchPolicy {
    /// Prefer the local rows.
    LocalFirst,
    /// Prefer the remote rows.
    RemoteFirst,
}

/// Which store produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// The embedded row store.
    Local,
    /// The remote store.
    Remote,
}

/// A read or write against a managed table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Target table.
    pub table: String,
    /// Method.
    pub method: Method,
    /// Row object, array of row objects, or patch.
    pub payload: Option<Value>,
    /// Row filters.
    pub filters: FilterSet,
    /// Routing mode.
    pub mode: SyncMode,
    /// Overrides [`SyncMode::default_fetch_policy`].
    pub fetch_policy: Option<FetchPolicy>,
    /// Sort keys for selects.
    pub order: Vec<OrderBy>,
    /// Row limit for selects.
    pub limit: Option<usize>,
    /// Row offset for selects.
    pub offset: Option<usize>,
    /// Include soft-deleted rows in selects.
    pub include_deleted: bool,
}

impl QueryRequest {
    fn new(table: impl Into<String>, method: Method, payload: Option<Value>) -> Self {
        Self {
            table: table.into(),
            method,
            payload,
            filters: FilterSet::new(),
            mode: SyncMode::default(),
            fetch_policy: None,
            order: Vec::new(),
            limit: None,
            offset: None,
            include_deleted: false,
        }
    }

    /// A select.
    pub fn select(table: impl Into<String>) -> Self {
        Self::new(table, Method::Select, None)
    }

    /// An insert of one object or an array of objects.
    pub fn insert(table: impl Into<String>, payload: Value) -> Self {
        Self::new(table, Method::Insert, Some(payload))
    }

    /// An update applying `patch` to the filtered rows.
    pub fn update(table: impl Into<String>, patch: Value) -> Self {
        Self::new(table, Method::Update, Some(patch))
    }

    /// A soft delete of the filtered rows.
    pub fn delete(table: impl Into<String>) -> Self {
        Self::new(table, Method::Delete, None)
    }

    /// An upsert of one object or an array of objects.
    pub fn upsert(table: impl Into<String>, payload: Value) -> Self {
        Self::new(table, Method::Upsert, Some(payload))
    }

    /// Adds a filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds an equality filter.
    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    /// Replaces the filters.
    pub fn filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    /// Sets the routing mode.
    pub fn mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the fetch policy.
    pub fn fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = Some(policy);
        self
    }

    /// Appends a sort key.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    /// Sets the limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the offset.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Includes soft-deleted rows in a select.
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    /// Returns the fetch policy in effect.
    pub fn effective_fetch_policy(&self) -> FetchPolicy {
        self.fetch_policy
            .unwrap_or_else(|| self.mode.default_fetch_policy())
    }

    /// Checks the request shape. Validation errors are never retried.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.table.trim().is_empty() {
            return Err(ValidationError::MissingTable);
        }
        if validate_identifier(&self.table).is_err() {
            return Err(ValidationError::InvalidTable(self.table.clone()));
        }
        for filter in &self.filters {
            if validate_identifier(&filter.column).is_err() {
                return Err(ValidationError::InvalidColumn(filter.column.clone()));
            }
        }
        for order in &self.order {
            if validate_identifier(&order.column).is_err() {
                return Err(ValidationError::InvalidColumn(order.column.clone()));
            }
        }

        match self.method {
            Method::Select => self.expect_no_payload(),
            Method::Delete => {
                self.expect_no_payload()?;
                self.expect_filters()
            }
            Method::Update => {
                self.expect_filters()?;
                self.patch().map(|_| ())
            }
            Method::Insert | Method::Upsert => self.payload_rows().map(|_| ()),
        }
    }

    /// Returns the payload of an insert/upsert as a list of objects.
    pub fn payload_rows(&self) -> Result<Vec<RowMap>, ValidationError> {
        let rows = match &self.payload {
            None => return Err(self.missing_payload()),
            Some(Value::Object(row)) => vec![row.clone()],
            Some(Value::Array(items)) if items.is_empty() => return Err(self.missing_payload()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(row) => Ok(row.clone()),
                    _ => Err(self.invalid_payload()),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(self.invalid_payload()),
        };
        for row in &rows {
            check_columns(row)?;
        }
        Ok(rows)
    }

    /// Returns the payload of an update as a single patch object.
    pub fn patch(&self) -> Result<RowMap, ValidationError> {
        match &self.payload {
            None => Err(self.missing_payload()),
            Some(Value::Array(_)) => Err(ValidationError::ArrayPayload {
                table: self.table.clone(),
                method: self.method.to_string(),
            }),
            Some(Value::Object(patch)) if patch.is_empty() => Err(self.missing_payload()),
            Some(Value::Object(patch)) => {
                if patch.contains_key(ID) {
                    return Err(ValidationError::ImmutableId {
                        table: self.table.clone(),
                    });
                }
                check_columns(patch)?;
                Ok(patch.clone())
            }
            Some(_) => Err(self.invalid_payload()),
        }
    }

    fn expect_no_payload(&self) -> Result<(), ValidationError> {
        match self.payload {
            Some(_) => Err(ValidationError::UnexpectedPayload {
                table: self.table.clone(),
                method: self.method.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn expect_filters(&self) -> Result<(), ValidationError> {
        if self.filters.is_empty() {
            Err(ValidationError::MissingFilters {
                table: self.table.clone(),
                method: self.method.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn missing_payload(&self) -> ValidationError {
        ValidationError::MissingPayload {
            table: self.table.clone(),
            method: self.method.to_string(),
        }
    }

    fn invalid_payload(&self) -> ValidationError {
        ValidationError::InvalidPayload {
            table: self.table.clone(),
        }
    }
}

fn check_columns(row: &RowMap) -> Result<(), ValidationError> {
    for column in row.keys() {
        if validate_identifier(column).is_err() {
            return Err(ValidationError::InvalidColumn(column.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fetch_policy_follows_mode() {
        let req = QueryRequest::select("todos");
        assert_eq!(req.effective_fetch_policy(), FetchPolicy::LocalFirst);
        let req = req.mode(SyncMode::RemoteOnly);
        assert_eq!(req.effective_fetch_policy(), FetchPolicy::RemoteFirst);
        let req = req.fetch_policy(FetchPolicy::LocalFirst);
        assert_eq!(req.effective_fetch_policy(), FetchPolicy::LocalFirst);
    }

    #[test]
    fn table_is_required() {
        assert_eq!(
            QueryRequest::select("").validate(),
            Err(ValidationError::MissingTable)
        );
        assert!(matches!(
            QueryRequest::select("todos; drop").validate(),
            Err(ValidationError::InvalidTable(_))
        ));
    }

    #[test]
    fn writes_require_payloads_and_filters() {
        assert!(matches!(
            QueryRequest::delete("todos").validate(),
            Err(ValidationError::MissingFilters { .. })
        ));
        assert!(matches!(
            QueryRequest::update("todos", json!({ "done": true })).validate(),
            Err(ValidationError::MissingFilters { .. })
        ));
        assert!(matches!(
            QueryRequest::insert("todos", json!(42)).validate(),
            Err(ValidationError::InvalidPayload { .. })
        ));
        assert!(matches!(
            QueryRequest::insert("todos", json!([])).validate(),
            Err(ValidationError::MissingPayload { .. })
        ));
        assert!(QueryRequest::delete("todos").eq("id", "a").validate().is_ok());
    }

    #[test]
    fn update_rejects_arrays_and_id_changes() {
        let req = QueryRequest::update("todos", json!([{ "done": true }])).eq("id", "a");
        assert!(matches!(req.validate(), Err(ValidationError::ArrayPayload { .. })));

        let req = QueryRequest::update("todos", json!({ "id": "b" })).eq("id", "a");
        assert!(matches!(req.validate(), Err(ValidationError::ImmutableId { .. })));
    }

    #[test]
    fn select_rejects_payload_and_bad_columns() {
        let mut req = QueryRequest::select("todos");
        req.payload = Some(json!({}));
        assert!(matches!(req.validate(), Err(ValidationError::UnexpectedPayload { .. })));

        let req = QueryRequest::select("todos").eq("bad col", 1);
        assert!(matches!(req.validate(), Err(ValidationError::InvalidColumn(_))));
    }

    #[test]
    fn payload_rows_accepts_object_or_array() {
        let one = QueryRequest::insert("todos", json!({ "id": "a" }));
        assert_eq!(one.payload_rows().unwrap().len(), 1);
        let many = QueryRequest::upsert("todos", json!([{ "id": "a" }, { "id": "b" }]));
        assert_eq!(many.payload_rows().unwrap().len(), 2);
    }

    #[test]
    fn mode_serializes_camel_case() {
        assert_eq!(
            serde_json::to_value(SyncMode::RemoteFirst).unwrap(),
            json!("remoteFirst")
        );
        assert_eq!(SyncMode::default(), SyncMode::LocalFirst);
    }
}
