//! Remote select queries.

use crate::filter::{compare_values, FilterSet};
use crate::row::{RowMap, ID, UPDATED_AT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// Column name.
    pub column: String,
    /// Descending when true.
    pub descending: bool,
}

impl OrderBy {
    /// Ascending order on `column`.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    /// Descending order on `column`.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// Compound `(updated_at, id)` cursor.
///
/// Admits rows strictly after the cursor in ascending `(updated_at, id)`
/// order, so rows sharing a timestamp are never skipped or repeated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetCursor {
    /// Last seen `updated_at`.
    pub updated_at: String,
    /// Last seen id; `None` admits every row with a later timestamp only.
    pub id: Option<String>,
}

impl KeysetCursor {
    /// Creates a cursor.
    pub fn new(updated_at: impl Into<String>, id: Option<String>) -> Self {
        Self {
            updated_at: updated_at.into(),
            id,
        }
    }

    /// Returns true if `row` sorts after the cursor.
    pub fn admits(&self, row: &RowMap) -> bool {
        let updated_at = row.get(UPDATED_AT).unwrap_or(&Value::Null);
        match compare_values(updated_at, &Value::String(self.updated_at.clone())) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Equal) => match (&self.id, row.get(ID).and_then(Value::as_str)) {
                (Some(last), Some(id)) => id > last.as_str(),
                _ => false,
            },
            _ => false,
        }
    }
}

/// A select against the remote store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteQuery {
    /// Projected columns; `None` selects every column.
    pub columns: Option<Vec<String>>,
    /// Row filters.
    pub filters: FilterSet,
    /// Sort keys, applied in order.
    pub order: Vec<OrderBy>,
    /// Maximum rows returned.
    pub limit: Option<usize>,
    /// Rows skipped before `limit` applies.
    pub offset: Option<usize>,
    /// Keyset cursor.
    pub after: Option<KeysetCursor>,
}

impl RemoteQuery {
    /// Selects every column of the rows matching `filters`.
    pub fn new(filters: FilterSet) -> Self {
        Self {
            filters,
            ..Self::default()
        }
    }

    /// Restricts the projected columns.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
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

    /// Sets the keyset cursor.
    pub fn after(mut self, cursor: KeysetCursor) -> Self {
        self.after = Some(cursor);
        self
    }
}
