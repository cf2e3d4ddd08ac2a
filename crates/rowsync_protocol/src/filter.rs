//! Filters and filter signatures.

use crate::error::{ProtocolError, ProtocolResult};
use crate::row::RowMap;
use crate::timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator of a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// `column = value`
    Eq,
    /// `column <> value`
    Neq,
    /// `column > value`
    Gt,
    /// `column >= value`
    Gte,
    /// `column < value`
    Lt,
    /// `column <= value`
    Lte,
    /// `column IN (values...)`
    In,
    /// `column IS NULL`
    IsNull,
    /// `column IS NOT NULL`
    NotNull,
    /// `column LIKE pattern` (`%` and `_` wildcards)
    Like,
}

impl FilterOp {
    /// Returns the operator name used in canonical JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
            FilterOp::IsNull => "is_null",
            FilterOp::NotNull => "not_null",
            FilterOp::Like => "like",
        }
    }

    /// Returns true if the operator takes no value.
    pub fn is_unary(&self) -> bool {
        matches!(self, FilterOp::IsNull | FilterOp::NotNull)
    }
}

/// A single column predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Column name.
    pub column: String,
    /// Operator.
    pub op: FilterOp,
    /// Operand; an array for `In`, ignored for unary operators.
    #[serde(default)]
    pub value: Value,
}

impl Filter {
    /// Creates a filter.
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    /// `column IN (values...)`
    pub fn is_in<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect::<Vec<_>>();
        Self::new(column, FilterOp::In, Value::Array(values))
    }

    /// `column IS NULL`
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::new(column, FilterOp::IsNull, Value::Null)
    }

    /// `column IS NOT NULL`
    pub fn not_null(column: impl Into<String>) -> Self {
        Self::new(column, FilterOp::NotNull, Value::Null)
    }

    /// Evaluates the filter against a row with SQL null semantics.
    pub fn matches(&self, row: &RowMap) -> bool {
        let actual = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::IsNull => actual.is_null(),
            FilterOp::NotNull => !actual.is_null(),
            FilterOp::Eq => compare_values(actual, &self.value) == Some(Ordering::Equal),
            FilterOp::Neq => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Greater)
            ),
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::In => match &self.value {
                Value::Array(options) => options
                    .iter()
                    .any(|option| compare_values(actual, option) == Some(Ordering::Equal)),
                other => compare_values(actual, other) == Some(Ordering::Equal),
            },
            FilterOp::Like => match (actual, &self.value) {
                (Value::String(text), Value::String(pattern)) => like(text, pattern),
                _ => false,
            },
        }
    }

    fn canonical(&self) -> Value {
        let value = match (&self.op, &self.value) {
            (op, _) if op.is_unary() => Value::Null,
            (FilterOp::In, Value::Array(values)) => {
                let mut values = values.clone();
                values.sort_by_key(|v| v.to_string());
                values.dedup();
                Value::Array(values)
            }
            (_, value) => value.clone(),
        };
        serde_json::json!({
            "column": self.column,
            "op": self.op.as_str(),
            "value": value,
        })
    }
}

/// An AND-ed set of filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(Vec<Filter>);

impl FilterSet {
    /// Creates an empty filter set.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Adds a filter.
    pub fn with(mut self, filter: Filter) -> Self {
        self.0.push(filter);
        self
    }

    /// Adds an equality filter.
    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Filter::eq(column, value))
    }

    /// Appends a filter in place.
    pub fn push(&mut self, filter: Filter) {
        self.0.push(filter);
    }

    /// Returns true if there are no filters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of filters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates the filters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Filter> {
        self.0.iter()
    }

    /// Returns true if every filter matches the row.
    pub fn matches(&self, row: &RowMap) -> bool {
        self.0.iter().all(|filter| filter.matches(row))
    }

    /// Checks that every column is a plain identifier.
    pub fn validate(&self) -> ProtocolResult<()> {
        for filter in &self.0 {
            validate_identifier(&filter.column)?;
        }
        Ok(())
    }

    /// Returns the canonical JSON form: sorted, order-independent.
    pub fn canonical_json(&self) -> String {
        let mut parts: Vec<String> = self.0.iter().map(|f| f.canonical().to_string()).collect();
        parts.sort();
        parts.dedup();
        format!("[{}]", parts.join(","))
    }

    /// Serializes the filters as given (for `filter_json`).
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    /// Parses filters from their JSON form.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let filters: Vec<Filter> = serde_json::from_str(json)?;
        Ok(Self(filters))
    }

    /// Computes the signature scoping checkpoints for this filter set.
    pub fn signature(&self) -> FilterSignature {
        if self.0.is_empty() {
            return FilterSignature(FilterSignature::ALL.to_string());
        }
        let digest = Sha256::digest(self.canonical_json().as_bytes());
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        FilterSignature(hex)
    }
}

impl FromIterator<Filter> for FilterSet {
    fn from_iter<T: IntoIterator<Item = Filter>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a FilterSet {
    type Item = &'a Filter;
    type IntoIter = std::slice::Iter<'a, Filter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Canonical, order-independent hash of a [`FilterSet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSignature(String);

impl FilterSignature {
    /// Signature of the empty filter set.
    pub const ALL: &'static str = "all";

    /// Wraps a stored signature.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the signature string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checks that `name` is a plain SQL identifier.
pub fn validate_identifier(name: &str) -> ProtocolResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidIdentifier(name.to_string()))
    }
}

/// Compares two scalar values the way the stores do.
///
/// Strings that both parse as timestamps compare by instant; numbers
/// compare numerically (numeric strings are coerced); `NULL` compares to
/// nothing.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(a), Value::String(b)) => {
            match (timestamp::parse(a), timestamp::parse(b)) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => Some(a.cmp(b)),
            }
        }
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::Number(a), Value::String(b)) => a.as_f64()?.partial_cmp(&b.parse::<f64>().ok()?),
        (Value::String(a), Value::Number(b)) => a.parse::<f64>().ok()?.partial_cmp(&b.as_f64()?),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Number(b)) => {
            f64::from(u8::from(*a)).partial_cmp(&b.as_f64()?)
        }
        (Value::Number(a), Value::Bool(b)) => a.as_f64()?.partial_cmp(&f64::from(u8::from(*b))),
        _ => None,
    }
}

fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    like_from(&text, &pattern)
}

fn like_from(text: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('%', rest)) => (0..=text.len()).any(|skip| like_from(&text[skip..], rest)),
        Some(('_', rest)) => !text.is_empty() && like_from(&text[1..], rest),
        Some((c, rest)) => text.first() == Some(c) && like_from(&text[1..], rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn row(value: Value) -> RowMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn empty_set_has_fixed_signature() {
        assert_eq!(FilterSet::new().signature().as_str(), "all");
    }

    #[test]
    fn signature_ignores_order() {
        let a = FilterSet::new().eq("owner", "u1").eq("status", "open");
        let b = FilterSet::new().eq("status", "open").eq("owner", "u1");
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature().as_str().len(), 64);

        let c = FilterSet::new().eq("status", "closed").eq("owner", "u1");
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn in_list_order_does_not_change_signature() {
        let a = FilterSet::new().with(Filter::is_in("id", ["a", "b"]));
        let b = FilterSet::new().with(Filter::is_in("id", ["b", "a"]));
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn filters_use_sql_null_semantics() {
        let r = row(json!({ "a": null, "b": 3 }));
        assert!(!Filter::eq("a", Value::Null).matches(&r));
        assert!(Filter::is_null("a").matches(&r));
        assert!(Filter::is_null("missing").matches(&r));
        assert!(Filter::not_null("b").matches(&r));
        assert!(!Filter::new("a", FilterOp::Neq, 1).matches(&r));
    }

    #[test]
    fn timestamps_compare_by_instant() {
        let r = row(json!({ "updated_at": "2024-01-02T00:00:00.000Z" }));
        assert!(Filter::new("updated_at", FilterOp::Gt, "2024-01-01T23:59:59Z").matches(&r));
        assert!(Filter::new("updated_at", FilterOp::Eq, "2024-01-02T00:00:00Z").matches(&r));
    }

    #[test]
    fn in_and_like() {
        let r = row(json!({ "id": "b", "title": "Buy milk" }));
        assert!(Filter::is_in("id", ["a", "b"]).matches(&r));
        assert!(!Filter::is_in("id", ["c"]).matches(&r));
        assert!(Filter::new("title", FilterOp::Like, "Buy%").matches(&r));
        assert!(Filter::new("title", FilterOp::Like, "B_y milk").matches(&r));
        assert!(!Filter::new("title", FilterOp::Like, "milk%").matches(&r));
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier("orders").is_ok());
        assert!(validate_identifier("_private_2").is_ok());
        assert!(validate_identifier("2fast").is_err());
        assert!(validate_identifier("drop table; --").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn json_round_trip_keeps_filters() {
        let set = FilterSet::new()
            .eq("owner", "u1")
            .with(Filter::not_null("due"));
        let parsed = FilterSet::from_json(&set.to_json()).unwrap();
        assert_eq!(parsed, set);
    }

    proptest! {
        #[test]
        fn signature_is_permutation_invariant(
            pairs in prop::collection::vec(("[a-z]{1,6}", any::<i32>()), 1..6),
            seed in any::<u64>(),
        ) {
            let filters: Vec<Filter> =
                pairs.iter().map(|(c, v)| Filter::eq(c.clone(), *v)).collect();
            let mut shuffled = filters.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);

            let a: FilterSet = filters.into_iter().collect();
            let b: FilterSet = shuffled.into_iter().collect();
            prop_assert_eq!(a.signature(), b.signature());
        }
    }
}
