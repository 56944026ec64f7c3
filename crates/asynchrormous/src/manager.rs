//! Per-model entry point producing [`AsyncQuerySet`] handles.

use crate::async_query::AsyncQuerySet;
use crate::error::QueryResult;
use crate::query::{Backend, Filter, QuerySet, QuerySpec};
use crate::scheduler::{Scheduler, default_scheduler};
use std::fmt;
use std::sync::Arc;

/// Hands out query sets for one model, all sharing a backend and scheduler.
pub struct Manager<B: Backend> {
    backend: Arc<B>,
    model: String,
    scheduler: Arc<dyn Scheduler>,
}

impl<B: Backend> Manager<B> {
    /// A manager for `model`, scheduling on [`default_scheduler`].
    pub fn new(backend: Arc<B>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            scheduler: default_scheduler(),
        }
    }

    /// Use `scheduler` for every query set this manager creates.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// The model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn query(&self, spec: QuerySpec) -> AsyncQuerySet<B> {
        AsyncQuerySet::from_query(
            QuerySet::new(self.backend.clone(), spec),
            self.scheduler.clone(),
        )
    }

    /// Every row of the model.
    pub fn all(&self) -> AsyncQuerySet<B> {
        self.query(QuerySpec::new(self.model.clone()))
    }

    /// Rows matching `filter`.
    pub fn filter(&self, filter: Filter) -> AsyncQuerySet<B> {
        self.query(QuerySpec::new(self.model.clone()).with_filter(filter))
    }

    /// Rows not matching `filter`.
    pub fn exclude(&self, filter: Filter) -> AsyncQuerySet<B> {
        self.query(QuerySpec::new(self.model.clone()).with_filter(filter.negate()))
    }

    /// The single row matching `filters`.
    pub fn get(&self, filters: impl IntoIterator<Item = Filter>) -> QueryResult<B::Row> {
        self.all().get(filters)
    }
}

impl<B: Backend> fmt::Debug for Manager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("model", &self.model)
            .field("scheduler", &self.scheduler.name())
            .finish()
    }
}
