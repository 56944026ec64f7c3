//! Query sets whose round-trips can be started in the background.
//!
//! [`AsyncQuerySet`] wraps a [`QuerySet`] with three write-once cache slots
//! (rows, count, existence) and three write-once task slots. A `start_*` call
//! fills a task slot and returns immediately; the matching consumer
//! (`fetch_all`, `count`, `exists`) joins that task before reading its slot, so
//! results are correct however the two calls interleave and no query is sent
//! twice.
//!
//! ```
//! use asynchrormous::{AsyncQuerySet, InlineScheduler, MemoryBackend, QuerySpec, Value};
//! use std::sync::Arc;
//!
//! # fn main() -> asynchrormous::QueryResult<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! backend.insert("item", [("n", Value::from(1))]);
//!
//! let items = AsyncQuerySet::new(backend.clone(), QuerySpec::new("item"))
//!     .with_scheduler(Arc::new(InlineScheduler));
//! assert!(items.start_exists().exists()?);
//! assert_eq!(backend.round_trips().exists, 1);
//! # Ok(()) }
//! ```

use crate::error::QueryResult;
use crate::query::{Backend, Filter, OrderBy, QuerySet, QuerySpec};
use crate::scheduler::{Scheduler, default_scheduler};
use crate::task::{self, TaskHandle, TaskKind};
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// State shared between a handle and its background tasks.
///
/// Tasks keep it alive, so dropping the handle never strands a running task.
struct Shared<B: Backend> {
    query: QuerySet<B>,
    count: OnceCell<u64>,
    exists: OnceCell<bool>,
    fetch_task: OnceCell<TaskHandle>,
    count_task: OnceCell<TaskHandle>,
    exists_task: OnceCell<TaskHandle>,
}

impl<B: Backend> Shared<B> {
    /// Existence as implied by whichever slot is filled, most informative first.
    fn inferred_exists(&self) -> Option<bool> {
        if let Some(rows) = self.query.cached_rows() {
            return Some(!rows.is_empty());
        }
        if let Some(count) = self.count.get() {
            return Some(*count > 0);
        }
        self.exists.get().copied()
    }
}

/// A lazy query whose fetch, count and existence round-trips can run in the
/// background.
pub struct AsyncQuerySet<B: Backend> {
    shared: Arc<Shared<B>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<B: Backend> AsyncQuerySet<B> {
    /// A handle for `spec`, scheduling background work on [`default_scheduler`].
    pub fn new(backend: Arc<B>, spec: QuerySpec) -> Self {
        Self::from_query(QuerySet::new(backend, spec), default_scheduler())
    }

    /// Wrap an existing query set; rows it already cached are reused.
    pub fn from_query(query: QuerySet<B>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                query,
                count: OnceCell::new(),
                exists: OnceCell::new(),
                fetch_task: OnceCell::new(),
                count_task: OnceCell::new(),
                exists_task: OnceCell::new(),
            }),
            scheduler,
        }
    }

    /// Use `scheduler` for background work started from this handle and the
    /// handles derived from it.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// The query description.
    pub fn spec(&self) -> &QuerySpec {
        self.shared.query.spec()
    }

    /// The scheduler background work goes to.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    // ------------------------------------------------------------------
    // Starting background work
    // ------------------------------------------------------------------

    /// Start fetching all rows in the background. Returns this same handle.
    ///
    /// Does nothing if a fetch was already started or rows are already cached.
    pub fn start_fetch(&self) -> &Self {
        if self.shared.query.cached_rows().is_some() {
            trace!(model = %self.spec().model, "start_fetch: rows already cached");
            return self;
        }
        self.start(TaskKind::Fetch, &self.shared.fetch_task, |shared| {
            shared.query.fetch_all().map(drop)
        });
        self
    }

    /// Start counting rows in the background. Returns this same handle.
    ///
    /// Does nothing if a count was already started or the count is known.
    pub fn start_count(&self) -> &Self {
        if self.shared.count.get().is_some() {
            trace!(model = %self.spec().model, "start_count: count already cached");
            return self;
        }
        self.start(TaskKind::Count, &self.shared.count_task, |shared| {
            let count = shared.query.count()?;
            let _ = shared.count.set(count);
            Ok(())
        });
        self
    }

    /// Start checking for any matching row in the background. Returns this
    /// same handle.
    ///
    /// Does nothing if a check was already started or the answer is known.
    pub fn start_exists(&self) -> &Self {
        if self.shared.exists.get().is_some() {
            trace!(model = %self.spec().model, "start_exists: existence already cached");
            return self;
        }
        self.start(TaskKind::Exists, &self.shared.exists_task, |shared| {
            let exists = shared.query.exists()?;
            let _ = shared.exists.set(exists);
            Ok(())
        });
        self
    }

    fn start(
        &self,
        kind: TaskKind,
        slot: &OnceCell<TaskHandle>,
        job: fn(&Shared<B>) -> QueryResult<()>,
    ) {
        let mut spawned = false;
        slot.get_or_init(|| {
            spawned = true;
            let shared = self.shared.clone();
            task::spawn(self.scheduler.as_ref(), kind, move || job(&shared))
        });
        if !spawned {
            trace!(model = %self.spec().model, task = %kind, "start: already issued");
        }
    }

    // ------------------------------------------------------------------
    // Consuming results
    // ------------------------------------------------------------------

    /// All matching rows.
    ///
    /// Joins a started fetch (re-raising its error) instead of fetching again.
    pub fn fetch_all(&self) -> QueryResult<&[B::Row]> {
        if let Some(task) = self.shared.fetch_task.get() {
            trace!(model = %self.spec().model, "fetch_all: joining fetch task");
            task.join()?;
        }
        self.shared.query.fetch_all()
    }

    /// Iterate over all matching rows, fetching them first if needed.
    pub fn iter(&self) -> QueryResult<std::slice::Iter<'_, B::Row>> {
        Ok(self.fetch_all()?.iter())
    }

    /// Owned copies of all matching rows.
    pub fn to_vec(&self) -> QueryResult<Vec<B::Row>> {
        Ok(self.fetch_all()?.to_vec())
    }

    /// Number of matching rows.
    ///
    /// In order of preference: the cached count, a started count task, the
    /// rows of a started fetch task, a fresh count query. Once known, the
    /// count is cached for the lifetime of the handle.
    pub fn count(&self) -> QueryResult<u64> {
        let shared = &self.shared;
        if let Some(count) = shared.count.get() {
            trace!(model = %self.spec().model, "count: cached");
            return Ok(*count);
        }

        if let Some(task) = shared.count_task.get() {
            trace!(model = %self.spec().model, "count: joining count task");
            task.join()?;
            if let Some(count) = shared.count.get() {
                return Ok(*count);
            }
        } else if let Some(task) = shared.fetch_task.get() {
            trace!(model = %self.spec().model, "count: joining fetch task");
            task.join()?;
        }

        let count = shared.query.count()?;
        Ok(*shared.count.get_or_init(|| count))
    }

    /// Whether any row matches.
    ///
    /// Answers from the cached existence flag if there is one. Otherwise, if
    /// any background task was started, joins one of them (preferring one that
    /// has already finished, then existence, count, fetch) and infers the
    /// answer from the rows, the count or the flag, whichever is known.
    /// Falls back to an existence query.
    pub fn exists(&self) -> QueryResult<bool> {
        let shared = &self.shared;
        if let Some(exists) = shared.exists.get() {
            trace!(model = %self.spec().model, "exists: cached");
            return Ok(*exists);
        }

        if let Some(task) = self.task_for_exists() {
            trace!(model = %self.spec().model, task = %task.kind(), "exists: joining task");
            task.join()?;
            if let Some(exists) = shared.inferred_exists() {
                return Ok(exists);
            }
        }

        let exists = shared.query.exists()?;
        Ok(*shared.exists.get_or_init(|| exists))
    }

    fn task_for_exists(&self) -> Option<&TaskHandle> {
        let slots = [
            &self.shared.exists_task,
            &self.shared.count_task,
            &self.shared.fetch_task,
        ];
        let mut first = None;
        for slot in slots {
            let Some(task) = slot.get() else {
                continue;
            };
            if task.is_finished() {
                return Some(task);
            }
            first.get_or_insert(task);
        }
        first
    }

    /// The single row matching this query and `filters`.
    ///
    /// Not integrated with background work: always a separate round-trip.
    pub fn get(&self, filters: impl IntoIterator<Item = Filter>) -> QueryResult<B::Row> {
        self.shared.query.get(filters)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// The background fetch, if one was started.
    pub fn fetch_task(&self) -> Option<&TaskHandle> {
        self.shared.fetch_task.get()
    }

    /// The background count, if one was started.
    pub fn count_task(&self) -> Option<&TaskHandle> {
        self.shared.count_task.get()
    }

    /// The background existence check, if one was started.
    pub fn exists_task(&self) -> Option<&TaskHandle> {
        self.shared.exists_task.get()
    }

    /// Rows, if already fetched. Never blocks.
    pub fn cached_rows(&self) -> Option<&[B::Row]> {
        self.shared.query.cached_rows()
    }

    /// Count, if already known. Never blocks.
    pub fn cached_count(&self) -> Option<u64> {
        self.shared.count.get().copied()
    }

    /// Existence, if already known. Never blocks.
    pub fn cached_exists(&self) -> Option<bool> {
        self.shared.exists.get().copied()
    }

    // ------------------------------------------------------------------
    // Deriving new handles
    // ------------------------------------------------------------------

    fn derive(&self, spec: QuerySpec) -> Self {
        Self::from_query(self.shared.query.derive(spec), self.scheduler.clone())
    }

    /// A fresh, unevaluated copy of this query.
    pub fn all(&self) -> Self {
        self.derive(self.spec().clone())
    }

    /// A fresh query further restricted by `filter`.
    pub fn filter(&self, filter: Filter) -> Self {
        self.derive(self.spec().with_filter(filter))
    }

    /// A fresh query excluding rows matching `filter`.
    pub fn exclude(&self, filter: Filter) -> Self {
        self.derive(self.spec().with_filter(filter.negate()))
    }

    /// A fresh query ordered by `terms` (`"field"` or `"-field"`).
    pub fn order_by<'a>(&self, terms: impl IntoIterator<Item = &'a str>) -> Self {
        let ordering = terms.into_iter().map(OrderBy::parse).collect();
        self.derive(self.spec().with_ordering(ordering))
    }

    /// A fresh query returning at most `limit` rows.
    pub fn limit(&self, limit: usize) -> Self {
        self.derive(self.spec().with_limit(limit))
    }
}

impl<B: Backend> fmt::Debug for AsyncQuerySet<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQuerySet")
            .field("spec", self.spec())
            .field("scheduler", &self.scheduler.name())
            .field("cached_rows", &self.cached_rows().map(<[B::Row]>::len))
            .field("cached_count", &self.cached_count())
            .field("cached_exists", &self.cached_exists())
            .field("fetch_task", &self.fetch_task())
            .field("count_task", &self.count_task())
            .field("exists_task", &self.exists_task())
            .finish()
    }
}
