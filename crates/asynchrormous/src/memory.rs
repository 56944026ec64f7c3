//! An in-process [`Backend`] with round-trip accounting.
//!
//! Tables live in a `DashMap` keyed by model name. Every `fetch_all`, `count`
//! and `exists` call counts as one round-trip, can be slowed down with
//! [`MemoryBackend::set_latency`], and can be made to fail with
//! [`MemoryBackend::fail_next`] / [`MemoryBackend::fail_always`].

use crate::error::{QueryError, QueryResult};
use crate::query::{Backend, QuerySpec, Value};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// A stored row.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// Primary key, assigned on insert.
    pub id: u64,
    /// Field values by name.
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    /// The value of `field`; `id` is the primary key, absent fields are `Null`.
    pub fn value(&self, field: &str) -> Value {
        if field == "id" || field == "pk" {
            return Value::Int(i64::try_from(self.id).unwrap_or(i64::MAX));
        }
        self.fields.get(field).cloned().unwrap_or(Value::Null)
    }
}

/// Snapshot of how many round-trips a [`MemoryBackend`] served.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundTrips {
    /// Full fetches.
    pub fetch: u64,
    /// Count queries.
    pub count: u64,
    /// Existence queries.
    pub exists: u64,
}

impl RoundTrips {
    /// All round-trips.
    pub fn total(&self) -> u64 {
        self.fetch + self.count + self.exists
    }
}

#[derive(Default)]
struct Counters {
    fetch: AtomicU64,
    count: AtomicU64,
    exists: AtomicU64,
}

enum Failure {
    None,
    Next(String),
    Always(String),
}

/// In-memory tables implementing [`Backend`].
pub struct MemoryBackend {
    tables: DashMap<String, Vec<Record>>,
    next_id: AtomicU64,
    counters: Counters,
    latency: Mutex<Option<Duration>>,
    failure: Mutex<Failure>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            tables: DashMap::new(),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
            latency: Mutex::new(None),
            failure: Mutex::new(Failure::None),
        }
    }
}

impl MemoryBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `model` exists, even with no rows.
    pub fn create_table(&self, model: &str) {
        self.tables.entry(model.to_string()).or_default();
    }

    /// Insert a row into `model` (creating the table) and return it.
    pub fn insert<K: Into<String>>(
        &self,
        model: &str,
        fields: impl IntoIterator<Item = (K, Value)>,
    ) -> Record {
        let record = Record {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        };
        self.tables
            .entry(model.to_string())
            .or_default()
            .push(record.clone());
        record
    }

    /// Round-trips served so far.
    pub fn round_trips(&self) -> RoundTrips {
        RoundTrips {
            fetch: self.counters.fetch.load(Ordering::SeqCst),
            count: self.counters.count.load(Ordering::SeqCst),
            exists: self.counters.exists.load(Ordering::SeqCst),
        }
    }

    /// Zero the round-trip counters.
    pub fn reset_round_trips(&self) {
        self.counters.fetch.store(0, Ordering::SeqCst);
        self.counters.count.store(0, Ordering::SeqCst);
        self.counters.exists.store(0, Ordering::SeqCst);
    }

    /// Sleep this long inside every round-trip.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Fail the next round-trip with a connection error.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.failure.lock() = Failure::Next(message.into());
    }

    /// Fail every round-trip with a connection error until [`clear_failure`](Self::clear_failure).
    pub fn fail_always(&self, message: impl Into<String>) {
        *self.failure.lock() = Failure::Always(message.into());
    }

    /// Stop injecting failures.
    pub fn clear_failure(&self) {
        *self.failure.lock() = Failure::None;
    }

    fn round_trip(&self, counter: &AtomicU64) -> QueryResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        let mut failure = self.failure.lock();
        match std::mem::replace(&mut *failure, Failure::None) {
            Failure::None => Ok(()),
            Failure::Next(message) => Err(QueryError::connection(message)),
            Failure::Always(message) => {
                *failure = Failure::Always(message.clone());
                Err(QueryError::connection(message))
            }
        }
    }

    fn select(&self, spec: &QuerySpec) -> QueryResult<Vec<Record>> {
        let table = self
            .tables
            .get(&spec.model)
            .ok_or_else(|| QueryError::query(format!("no such table: {}", spec.model)))?;

        let mut rows: Vec<Record> = table
            .iter()
            .filter(|row| {
                spec.filters
                    .iter()
                    .all(|filter| filter.matches(&row.value(&filter.field)))
            })
            .cloned()
            .collect();
        drop(table);

        if !spec.ordering.is_empty() {
            rows.sort_by(|a, b| {
                spec.ordering
                    .iter()
                    .map(|term| {
                        let ord = compare_for_sort(&a.value(&term.field), &b.value(&term.field));
                        if term.descending { ord.reverse() } else { ord }
                    })
                    .find(|ord| *ord != CmpOrdering::Equal)
                    .unwrap_or(CmpOrdering::Equal)
            });
        }

        if let Some(limit) = spec.limit {
            rows.truncate(limit);
        }

        trace!(model = %spec.model, rows = rows.len(), "memory backend: select");
        Ok(rows)
    }
}

/// Nulls sort first; mismatched kinds compare equal.
fn compare_for_sort(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Null, Value::Null) => CmpOrdering::Equal,
        (Value::Null, _) => CmpOrdering::Less,
        (_, Value::Null) => CmpOrdering::Greater,
        _ => a.compare(b).unwrap_or(CmpOrdering::Equal),
    }
}

impl Backend for MemoryBackend {
    type Row = Record;

    fn fetch_all(&self, spec: &QuerySpec) -> QueryResult<Vec<Record>> {
        self.round_trip(&self.counters.fetch)?;
        self.select(spec)
    }

    fn count(&self, spec: &QuerySpec) -> QueryResult<u64> {
        self.round_trip(&self.counters.count)?;
        Ok(self.select(spec)?.len() as u64)
    }

    fn exists(&self, spec: &QuerySpec) -> QueryResult<bool> {
        self.round_trip(&self.counters.exists)?;
        Ok(!self.select(&spec.with_limit(1))?.is_empty())
    }
}
