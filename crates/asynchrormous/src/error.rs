//! Error types used throughout asynchrormous.

use crate::task::TaskKind;
use std::sync::Arc;
use thiserror::Error;

/// Result type used by asynchrormous APIs.
///
/// Errors are reference-counted so a single background failure can be handed
/// out unchanged to every caller that joins the failed task.
pub type QueryResult<T> = std::result::Result<T, Arc<QueryError>>;

/// A query execution or task scheduling error.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The backend could not be reached (or dropped the connection mid-query).
    #[error("connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
    },

    /// The backend rejected the query (unknown model, bad lookup, ...).
    #[error("query error: {message}")]
    Query {
        /// Human-readable error message.
        message: String,
    },

    /// The backend reported a constraint violation.
    #[error("integrity error: {message}")]
    Integrity {
        /// Human-readable error message.
        message: String,
    },

    /// `get` matched no rows.
    #[error("{model} matching query does not exist")]
    DoesNotExist {
        /// Model the query was issued against.
        model: String,
    },

    /// `get` matched more than one row.
    #[error("get() returned more than one {model} -- it returned {found}!")]
    MultipleObjectsReturned {
        /// Model the query was issued against.
        model: String,
        /// Number of rows found, or "more than N" when the fetch was capped.
        found: String,
    },

    /// A background task panicked (caught so joiners observe a normal error).
    #[error("{task} task panicked: {message}")]
    Panic {
        /// Which task panicked.
        task: TaskKind,
        /// Human-readable panic message (best effort).
        message: String,
    },

    /// The scheduler dropped a task before running it.
    #[error("{task} task was dropped by the {scheduler} scheduler before it ran")]
    Abandoned {
        /// Which task was dropped.
        task: TaskKind,
        /// Name of the scheduler that accepted the task.
        scheduler: &'static str,
    },

    /// The scheduler failed to start a worker for the task.
    #[error("{scheduler} scheduler could not start the {task} task: {message}")]
    Spawn {
        /// Which task could not be started.
        task: TaskKind,
        /// Name of the scheduler that refused the task.
        scheduler: &'static str,
        /// Human-readable error message.
        message: String,
    },
}

impl QueryError {
    /// Shorthand for a shared [`QueryError::Connection`].
    pub fn connection(message: impl Into<String>) -> Arc<Self> {
        Arc::new(QueryError::Connection {
            message: message.into(),
        })
    }

    /// Shorthand for a shared [`QueryError::Query`].
    pub fn query(message: impl Into<String>) -> Arc<Self> {
        Arc::new(QueryError::Query {
            message: message.into(),
        })
    }

    /// Shorthand for a shared [`QueryError::Integrity`].
    pub fn integrity(message: impl Into<String>) -> Arc<Self> {
        Arc::new(QueryError::Integrity {
            message: message.into(),
        })
    }
}
