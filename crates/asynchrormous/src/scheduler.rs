//! Where background query work runs.
//!
//! The query layer never creates threads itself; it hands boxed jobs to an
//! injected [`Scheduler`]. Three implementations are provided:
//!
//! - [`ThreadScheduler`]: one named OS thread per job (the default)
//! - [`TokioScheduler`]: a Tokio runtime's blocking pool
//! - [`InlineScheduler`]: runs the job on the caller's thread, for deterministic tests
//!
//! The process-wide default is chosen from the environment, see [`SchedulerConfig`].

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use tracing::{trace, warn};

/// A unit of background work, as handed to a [`Scheduler`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs concurrently with the caller.
pub trait Scheduler: Send + Sync {
    /// Short name for logs and errors.
    fn name(&self) -> &'static str;

    /// Start running `job`.
    ///
    /// A scheduler that returns `Ok` must either run the job or drop it; it
    /// must not hold on to it indefinitely.
    fn execute(&self, job: Job) -> io::Result<()>;
}

/// Environment variable selecting the default scheduler (`thread`, `inline` or `tokio`).
pub const SCHEDULER_ENV: &str = "ASYNCHRORMOUS_SCHEDULER";
/// Environment variable overriding worker thread stack size, in bytes.
pub const STACK_SIZE_ENV: &str = "ASYNCHRORMOUS_THREAD_STACK_SIZE";
/// Environment variable overriding the worker thread name prefix.
pub const THREAD_NAME_ENV: &str = "ASYNCHRORMOUS_THREAD_NAME";

const DEFAULT_THREAD_NAME: &str = "asynchrormous-task";

/// Which scheduler [`default_scheduler`] hands out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchedulerKind {
    /// [`ThreadScheduler`].
    Thread,
    /// [`InlineScheduler`].
    Inline,
    /// [`TokioScheduler`] on the runtime current at first use, falling back to
    /// threads outside a runtime.
    Tokio,
}

/// Scheduler settings, usually read from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Scheduler implementation.
    pub kind: SchedulerKind,
    /// Prefix for worker thread names.
    pub thread_name: String,
    /// Worker thread stack size; the platform default when `None`.
    pub stack_size: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Thread,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            stack_size: None,
        }
    }
}

impl SchedulerConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`; unparsable values are logged
    /// and replaced by defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(kind) = lookup(SCHEDULER_ENV) {
            match kind.trim().to_ascii_lowercase().as_str() {
                "thread" | "" => config.kind = SchedulerKind::Thread,
                "inline" => config.kind = SchedulerKind::Inline,
                "tokio" => config.kind = SchedulerKind::Tokio,
                other => warn!(value = other, "unknown {SCHEDULER_ENV}; using thread"),
            }
        }

        if let Some(size) = lookup(STACK_SIZE_ENV) {
            match size.trim().parse::<usize>() {
                Ok(size) if size > 0 => config.stack_size = Some(size),
                _ => warn!(value = %size, "invalid {STACK_SIZE_ENV}; using platform default"),
            }
        }

        if let Some(name) = lookup(THREAD_NAME_ENV).filter(|n| !n.trim().is_empty()) {
            config.thread_name = name.trim().to_string();
        }

        config
    }

    /// Build the configured scheduler.
    pub fn build(&self) -> Arc<dyn Scheduler> {
        match self.kind {
            SchedulerKind::Thread => Arc::new(ThreadScheduler::from_config(self)),
            SchedulerKind::Inline => Arc::new(InlineScheduler),
            SchedulerKind::Tokio => match TokioScheduler::current() {
                Some(scheduler) => Arc::new(scheduler),
                None => {
                    warn!("tokio scheduler requested outside a runtime; using threads");
                    Arc::new(ThreadScheduler::from_config(self))
                }
            },
        }
    }
}

static DEFAULT_SCHEDULER: LazyLock<Arc<dyn Scheduler>> =
    LazyLock::new(|| SchedulerConfig::from_env().build());

/// The process-wide scheduler used when none is injected.
pub fn default_scheduler() -> Arc<dyn Scheduler> {
    DEFAULT_SCHEDULER.clone()
}

/// Spawns one detached OS thread per job.
#[derive(Debug)]
pub struct ThreadScheduler {
    thread_name: String,
    stack_size: Option<usize>,
    spawned: AtomicU64,
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl ThreadScheduler {
    /// Create a thread scheduler with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a thread scheduler using the thread settings from `config`.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            thread_name: config.thread_name.clone(),
            stack_size: config.stack_size,
            spawned: AtomicU64::new(0),
        }
    }

    /// Number of threads spawned so far.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl Scheduler for ThreadScheduler {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn execute(&self, job: Job) -> io::Result<()> {
        let id = self.spawned.fetch_add(1, Ordering::Relaxed);
        let mut builder = thread::Builder::new().name(format!("{}-{id}", self.thread_name));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        // Detached: completion is observed through the task handle.
        builder.spawn(job)?;
        trace!(thread = id, "thread scheduler: spawned");
        Ok(())
    }
}

/// Runs jobs on a Tokio runtime's blocking pool.
///
/// Backends are synchronous, so jobs must not run on the async worker threads.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Schedule onto the runtime behind `handle`.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Schedule onto the runtime the caller is running in, if any.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn name(&self) -> &'static str {
        "tokio"
    }

    fn execute(&self, job: Job) -> io::Result<()> {
        // A runtime that shuts down before running the job drops it, which
        // the task records as abandoned.
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}

/// Runs each job to completion on the calling thread before returning.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn execute(&self, job: Job) -> io::Result<()> {
        job();
        Ok(())
    }
}
