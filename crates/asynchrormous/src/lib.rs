#![warn(missing_docs)]

//! asynchrormous lets a lazy query start its database round-trip on a
//! background worker while the caller carries on, and later hands back the
//! result synchronously, without ever sending the same query twice.
//!
//! asynchrormous provides:
//!
//! - [`AsyncQuerySet`]: `start_fetch` / `start_count` / `start_exists`, plus
//!   `fetch_all` / `count` / `exists` that join on started work
//! - [`TaskHandle`]: a joinable, write-once record of one background task,
//!   re-raising its error (or panic) at every join
//! - [`Scheduler`]: where tasks run ([`ThreadScheduler`], [`TokioScheduler`],
//!   [`InlineScheduler`])
//! - [`Backend`] and [`QuerySet`]: the synchronous query layer underneath, with
//!   [`MemoryBackend`] as an in-process implementation
//!
//! ## Minimal example
//!
//! ```
//! use asynchrormous::{Filter, Manager, MemoryBackend, Value};
//! use std::sync::Arc;
//!
//! # fn main() -> asynchrormous::QueryResult<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! for n in 0..10 {
//!     backend.insert("item", [("parity", Value::from(n % 2))]);
//! }
//!
//! let items = Manager::new(backend.clone(), "item");
//! let even = items.filter(Filter::exact("parity", 0));
//! even.start_fetch();
//!
//! // ... other work while the rows are fetched ...
//!
//! // Joins the fetch and counts the fetched rows: no count query is sent.
//! assert_eq!(even.count()?, 5);
//! assert_eq!(backend.round_trips().fetch, 1);
//! assert_eq!(backend.round_trips().count, 0);
//! # Ok(()) }
//! ```

pub mod async_query;
pub mod error;
pub mod manager;
pub mod memory;
pub mod query;
pub mod scheduler;
pub mod task;

pub use async_query::AsyncQuerySet;
pub use error::{QueryError, QueryResult};
pub use manager::Manager;
pub use memory::{MemoryBackend, Record, RoundTrips};
pub use query::{Backend, Condition, Filter, OrderBy, QuerySet, QuerySpec, Value};
pub use scheduler::{
    InlineScheduler, Scheduler, SchedulerConfig, SchedulerKind, ThreadScheduler, TokioScheduler,
    default_scheduler,
};
pub use task::{TaskHandle, TaskKind};
