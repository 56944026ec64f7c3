//! The synchronous query layer: query descriptions, the [`Backend`] trait and
//! the lazy [`QuerySet`].
//!
//! This is deliberately thin. Building SQL (or whatever a backend speaks) from
//! a [`QuerySpec`] is the backend's business.

use crate::error::{QueryError, QueryResult};
use once_cell::sync::OnceCell;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Upper bound on rows fetched by [`QuerySet::get`] when looking for duplicates.
pub const MAX_GET_RESULTS: usize = 21;

/// A field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Text.
    Text(String),
}

impl Value {
    /// Compare two values of the same kind. Values of different kinds are
    /// unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v:?}"),
        }
    }
}

/// The test a [`Filter`] applies to one field.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// Equal to.
    Exact(Value),
    /// Strictly greater than.
    Gt(Value),
    /// Greater than or equal to.
    Gte(Value),
    /// Strictly less than.
    Lt(Value),
    /// Less than or equal to.
    Lte(Value),
    /// Text field containing the substring.
    Contains(String),
    /// Equal to any of the values.
    In(Vec<Value>),
}

impl Condition {
    /// Evaluate against a field value. Comparisons across value kinds never match.
    pub fn matches(&self, value: &Value) -> bool {
        let cmp = |bound: &Value| value.compare(bound);
        match self {
            Condition::Exact(bound) => cmp(bound) == Some(Ordering::Equal),
            Condition::Gt(bound) => cmp(bound) == Some(Ordering::Greater),
            Condition::Gte(bound) => matches!(cmp(bound), Some(Ordering::Greater | Ordering::Equal)),
            Condition::Lt(bound) => cmp(bound) == Some(Ordering::Less),
            Condition::Lte(bound) => matches!(cmp(bound), Some(Ordering::Less | Ordering::Equal)),
            Condition::Contains(needle) => {
                matches!(value, Value::Text(text) if text.contains(needle.as_str()))
            }
            Condition::In(values) => values
                .iter()
                .any(|bound| cmp(bound) == Some(Ordering::Equal)),
        }
    }
}

/// One `WHERE` term: a condition on a field, optionally negated.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    /// Field name.
    pub field: String,
    /// Test applied to the field.
    pub condition: Condition,
    /// Whether the term is negated (`exclude`).
    pub negated: bool,
}

impl Filter {
    /// A filter on `field`.
    pub fn new(field: impl Into<String>, condition: Condition) -> Self {
        Self {
            field: field.into(),
            condition,
            negated: false,
        }
    }

    /// `field == value`.
    pub fn exact(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Condition::Exact(value.into()))
    }

    /// The negation of this filter.
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Evaluate against the field's value (`Value::Null` when the field is absent).
    pub fn matches(&self, value: &Value) -> bool {
        self.condition.matches(value) != self.negated
    }
}

/// One `ORDER BY` term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    /// Field name.
    pub field: String,
    /// Sort descending instead of ascending.
    pub descending: bool,
}

impl OrderBy {
    /// Parse `"field"` (ascending) or `"-field"` (descending).
    pub fn parse(term: &str) -> Self {
        match term.strip_prefix('-') {
            Some(field) => Self {
                field: field.to_string(),
                descending: true,
            },
            None => Self {
                field: term.to_string(),
                descending: false,
            },
        }
    }
}

/// Everything a backend needs to run a query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuerySpec {
    /// Model (table) the query reads.
    pub model: String,
    /// Conjunction of filters.
    pub filters: Vec<Filter>,
    /// Ordering terms, most significant first.
    pub ordering: Vec<OrderBy>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
}

impl QuerySpec {
    /// Unfiltered query over `model`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// A copy with `filter` added.
    pub fn with_filter(&self, filter: Filter) -> Self {
        let mut spec = self.clone();
        spec.filters.push(filter);
        spec
    }

    /// A copy with its ordering replaced.
    pub fn with_ordering(&self, ordering: Vec<OrderBy>) -> Self {
        let mut spec = self.clone();
        spec.ordering = ordering;
        spec
    }

    /// A copy limited to `limit` rows (never raising an existing, lower limit).
    pub fn with_limit(&self, limit: usize) -> Self {
        let mut spec = self.clone();
        spec.limit = Some(spec.limit.map_or(limit, |existing| existing.min(limit)));
        spec
    }
}

/// A data source. Every method is one synchronous round-trip.
pub trait Backend: Send + Sync + 'static {
    /// Row type produced by [`fetch_all`](Self::fetch_all).
    type Row: Clone + Send + Sync + 'static;

    /// All rows matching `spec`, in order.
    fn fetch_all(&self, spec: &QuerySpec) -> QueryResult<Vec<Self::Row>>;

    /// Number of rows matching `spec`.
    fn count(&self, spec: &QuerySpec) -> QueryResult<u64>;

    /// Whether any row matches `spec`.
    fn exists(&self, spec: &QuerySpec) -> QueryResult<bool>;
}

/// A lazy query. Rows are fetched on first use and cached for the lifetime of
/// the query set.
pub struct QuerySet<B: Backend> {
    backend: Arc<B>,
    spec: QuerySpec,
    result_cache: OnceCell<Vec<B::Row>>,
}

impl<B: Backend> QuerySet<B> {
    /// A query set for `spec`; nothing runs until it is consumed.
    pub fn new(backend: Arc<B>, spec: QuerySpec) -> Self {
        Self {
            backend,
            spec,
            result_cache: OnceCell::new(),
        }
    }

    /// The backend queries run against.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The query description.
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// The fetched rows, if a fetch has completed.
    pub fn cached_rows(&self) -> Option<&[B::Row]> {
        self.result_cache.get().map(Vec::as_slice)
    }

    /// All matching rows, fetching them on first call.
    ///
    /// Concurrent first callers block on a single fetch; a failed fetch leaves
    /// the cache empty.
    pub fn fetch_all(&self) -> QueryResult<&[B::Row]> {
        self.result_cache
            .get_or_try_init(|| {
                debug!(model = %self.spec.model, "fetch: round-trip");
                let rows = self.backend.fetch_all(&self.spec)?;
                debug!(model = %self.spec.model, rows = rows.len(), "fetch: ok");
                Ok(rows)
            })
            .map(Vec::as_slice)
    }

    /// Number of matching rows; free once rows are cached.
    pub fn count(&self) -> QueryResult<u64> {
        if let Some(rows) = self.cached_rows() {
            trace!(model = %self.spec.model, "count: from cached rows");
            return Ok(rows.len() as u64);
        }
        debug!(model = %self.spec.model, "count: round-trip");
        self.backend.count(&self.spec)
    }

    /// Whether any row matches; free once rows are cached.
    pub fn exists(&self) -> QueryResult<bool> {
        if let Some(rows) = self.cached_rows() {
            trace!(model = %self.spec.model, "exists: from cached rows");
            return Ok(!rows.is_empty());
        }
        debug!(model = %self.spec.model, "exists: round-trip");
        self.backend.exists(&self.spec)
    }

    /// The single row matching this query and `filters`.
    ///
    /// Always issues its own round-trip, fetching at most [`MAX_GET_RESULTS`]
    /// rows.
    pub fn get(&self, filters: impl IntoIterator<Item = Filter>) -> QueryResult<B::Row> {
        let mut spec = self.spec.with_limit(MAX_GET_RESULTS);
        spec.filters.extend(filters);

        debug!(model = %spec.model, "get: round-trip");
        let mut rows = self.backend.fetch_all(&spec)?;
        let found = rows.len();
        match (rows.pop(), found) {
            (Some(row), 1) => Ok(row),
            (None, _) => Err(Arc::new(QueryError::DoesNotExist { model: spec.model })),
            _ => Err(Arc::new(QueryError::MultipleObjectsReturned {
                model: spec.model,
                found: if found >= MAX_GET_RESULTS {
                    format!("more than {}", MAX_GET_RESULTS - 1)
                } else {
                    found.to_string()
                },
            })),
        }
    }

    /// A fresh, unevaluated query set for `spec` on the same backend.
    pub fn derive(&self, spec: QuerySpec) -> Self {
        Self::new(self.backend.clone(), spec)
    }
}

impl<B: Backend> fmt::Debug for QuerySet<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("spec", &self.spec)
            .field("cached_rows", &self.cached_rows().map(<[B::Row]>::len))
            .finish()
    }
}
