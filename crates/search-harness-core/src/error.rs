//! Error taxonomy shared by every backend and by the server layer.
//!
//! Errors fall into three groups that are handled differently:
//!
//! | Group | Variants | Handling |
//! |-------|----------|----------|
//! | Configuration | [`Config`](SearchError::Config), [`UnknownField`](SearchError::UnknownField), [`InvalidQuery`](SearchError::InvalidQuery), [`WrongServer`](SearchError::WrongServer), [`Schema`](SearchError::Schema) | Raised to the caller, never queued |
//! | Transient | [`Backend`](SearchError::Backend) | Captured into the task queue by mutating calls |
//! | Ordering | [`Fenced`](SearchError::Fenced), [`Queued`](SearchError::Queued) | Raised to the caller; the operation is recorded as a task |
//!
//! Backend implementations usually work with `anyhow::Result` internally.
//! Converting an [`anyhow::Error`] back into a [`SearchError`] recovers the
//! original variant when one was wrapped, and treats anything else (I/O,
//! SQL, lock failures) as a transient backend failure.

use thiserror::Error;

/// The error type returned by [`Backend`](crate::backend::Backend) operations.
#[derive(Error, Debug)]
pub enum SearchError {
    /// Invalid configuration or definition supplied by the caller.
    #[error("configuration error: {0}")]
    Config(String),

    /// A query or definition referenced a field the index does not have.
    #[error("unknown field '{field}' on index '{index}'")]
    UnknownField { index: String, field: String },

    /// The query is malformed (bad operator, value shape, sort or facet target).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The index is not associated with the server the call was issued against.
    #[error("index '{index}' is not served by server '{server}'")]
    WrongServer { index: String, server: String },

    /// The index definition cannot be mapped onto storage.
    #[error("schema error: {0}")]
    Schema(String),

    /// The operation was refused because earlier tasks are still unresolved.
    #[error(
        "{operation} on server '{server}' is blocked by {pending} pending task(s); \
         run the task sweep (`sidx cron`) so they execute first"
    )]
    Fenced {
        server: String,
        operation: String,
        pending: usize,
    },

    /// The storage layer failed while executing an operation.
    #[error("backend failure: {0:#}")]
    Backend(anyhow::Error),

    /// A mutating call failed transiently and was recorded for retry.
    #[error("{operation} failed on server '{server}' and was queued for retry: {cause:#}")]
    Queued {
        server: String,
        operation: String,
        cause: anyhow::Error,
    },
}

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, SearchError>;

impl SearchError {
    /// Wrap a plain message as a transient backend failure.
    pub fn backend(msg: impl std::fmt::Display) -> Self {
        SearchError::Backend(anyhow::anyhow!("{}", msg))
    }

    /// Whether the failure may succeed on retry (and so belongs in the task queue).
    pub fn is_transient(&self) -> bool {
        matches!(self, SearchError::Backend(_))
    }

    /// Whether the operation was not executed now but is recorded as a task.
    pub fn is_deferred(&self) -> bool {
        matches!(self, SearchError::Fenced { .. } | SearchError::Queued { .. })
    }
}

impl From<anyhow::Error> for SearchError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<SearchError>() {
            Ok(inner) => inner,
            Err(other) => SearchError::Backend(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_round_trip_keeps_variant() {
        let err: anyhow::Error = SearchError::Schema("bad".into()).into();
        let back = SearchError::from(err);
        assert!(matches!(back, SearchError::Schema(ref m) if m == "bad"));
    }

    #[test]
    fn foreign_errors_become_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let back = SearchError::from(anyhow::Error::new(io));
        assert!(back.is_transient());
        assert!(back.to_string().contains("disk gone"));
    }

    #[test]
    fn fenced_message_names_pending_tasks() {
        let err = SearchError::Fenced {
            server: "default".into(),
            operation: "index_items".into(),
            pending: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("2 pending task(s)"));
        assert!(err.is_deferred());
        assert!(!err.is_transient());
    }
}
