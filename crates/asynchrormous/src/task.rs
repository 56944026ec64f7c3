//! Joinable handles for background query work.
//!
//! A task runs exactly one job on some [`Scheduler`] and records its outcome
//! exactly once. Any number of callers may then [`join`](TaskHandle::join) (or
//! [`wait`](TaskHandle::wait) from async code) and all of them observe the same
//! outcome, including the same shared error.

use crate::error::{QueryError, QueryResult};
use crate::scheduler::{Job, Scheduler};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Which materialization a background task performs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Full row fetch, populating the result cache.
    Fetch,
    /// `COUNT`-style query, populating the count cache.
    Count,
    /// `EXISTS`-style query, populating the existence cache.
    Exists,
}

impl TaskKind {
    /// Short lowercase name, used in logs and error messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskKind::Fetch => "fetch",
            TaskKind::Count => "count",
            TaskKind::Exists => "exists",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
enum TaskState {
    Running,
    Done,
    Failed(Arc<QueryError>),
}

fn outcome_of(state: &TaskState) -> Option<QueryResult<()>> {
    match state {
        TaskState::Running => None,
        TaskState::Done => Some(Ok(())),
        TaskState::Failed(error) => Some(Err(error.clone())),
    }
}

struct TaskCell {
    kind: TaskKind,
    state: Mutex<TaskState>,
    /// Wakes blocking joiners.
    finished: Condvar,
    /// Wakes async waiters.
    notify: Notify,
}

impl TaskCell {
    fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            state: Mutex::new(TaskState::Running),
            finished: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn outcome(&self) -> Option<QueryResult<()>> {
        outcome_of(&self.state.lock())
    }

    /// Record the outcome. The first recorded outcome wins.
    fn complete(&self, result: QueryResult<()>) {
        let mut state = self.state.lock();
        if !matches!(*state, TaskState::Running) {
            return;
        }
        *state = match result {
            Ok(()) => TaskState::Done,
            Err(error) => TaskState::Failed(error),
        };
        drop(state);
        self.finished.notify_all();
        self.notify.notify_waiters();
    }

    /// Replace a pending outcome or an abandonment with the scheduler's own
    /// error. An outcome the job recorded itself is kept.
    ///
    /// Only called before the handle leaves `spawn`, so no joiner has seen the
    /// abandonment yet.
    fn reject(&self, error: Arc<QueryError>) {
        let mut state = self.state.lock();
        match &*state {
            TaskState::Running => {}
            TaskState::Failed(previous) if matches!(**previous, QueryError::Abandoned { .. }) => {}
            TaskState::Done | TaskState::Failed(_) => return,
        }
        *state = TaskState::Failed(error);
        drop(state);
        self.finished.notify_all();
        self.notify.notify_waiters();
    }
}

/// Guard that ensures a task records an outcome.
///
/// When dropped without calling `complete` (the scheduler discarded the job),
/// marks the task as abandoned so joiners don't block forever.
struct CompletionGuard {
    cell: Arc<TaskCell>,
    scheduler: &'static str,
    completed: bool,
}

impl CompletionGuard {
    fn complete(mut self, result: QueryResult<()>) {
        self.cell.complete(result);
        self.completed = true;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.completed {
            debug!(
                task = %self.cell.kind,
                scheduler = self.scheduler,
                "task: abandoned"
            );
            self.cell.complete(Err(Arc::new(QueryError::Abandoned {
                task: self.cell.kind,
                scheduler: self.scheduler,
            })));
        }
    }
}

/// A reference to one unit of background work.
///
/// Cloning is cheap; every clone refers to the same task.
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<TaskCell>,
}

impl TaskHandle {
    /// What this task materializes.
    pub fn kind(&self) -> TaskKind {
        self.cell.kind
    }

    /// Whether the task has recorded an outcome. Never blocks.
    pub fn is_finished(&self) -> bool {
        self.cell.outcome().is_some()
    }

    /// Block until the task has finished and return its outcome.
    ///
    /// Safe to call repeatedly and from several threads; every call returns
    /// the same outcome.
    pub fn join(&self) -> QueryResult<()> {
        let mut state = self.cell.state.lock();
        loop {
            if let Some(outcome) = outcome_of(&state) {
                return outcome;
            }
            trace!(task = %self.cell.kind, "join: waiting");
            self.cell.finished.wait(&mut state);
        }
    }

    /// Async counterpart of [`join`](Self::join).
    pub async fn wait(&self) -> QueryResult<()> {
        loop {
            // Register interest before checking so a completion between the
            // check and the await is not missed.
            let notified = self.cell.notify.notified();
            if let Some(outcome) = self.cell.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Whether both handles refer to the same task.
    pub fn ptr_eq(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("kind", &self.cell.kind)
            .field("state", &*self.cell.state.lock())
            .finish()
    }
}

/// Hand `job` to `scheduler` and return a handle to its eventual outcome.
///
/// Panics inside `job` are caught and recorded as [`QueryError::Panic`]. A
/// scheduler that refuses the job makes the task fail with the scheduler's
/// error instead of leaving it pending.
pub fn spawn<F>(scheduler: &dyn Scheduler, kind: TaskKind, job: F) -> TaskHandle
where
    F: FnOnce() -> QueryResult<()> + Send + 'static,
{
    let cell = Arc::new(TaskCell::new(kind));
    let guard = CompletionGuard {
        cell: cell.clone(),
        scheduler: scheduler.name(),
        completed: false,
    };

    let run: Job = Box::new(move || {
        trace!(task = %kind, "task: start");
        let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(payload) => Err(Arc::new(QueryError::Panic {
                task: kind,
                message: panic_message(payload),
            })),
        };
        match &result {
            Ok(()) => debug!(task = %kind, "task: ok"),
            Err(error) => debug!(task = %kind, error = %error, "task: err"),
        }
        guard.complete(result);
    });

    debug!(task = %kind, scheduler = scheduler.name(), "task: spawn");
    if let Err(error) = scheduler.execute(run) {
        debug!(task = %kind, error = %error, "task: rejected by scheduler");
        cell.reject(Arc::new(QueryError::Spawn {
            task: kind,
            scheduler: scheduler.name(),
            message: error.to_string(),
        }));
    }

    TaskHandle { cell }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
