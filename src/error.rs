//! Error handling for lookout.
//!
//! The library raises a single strongly-typed error enum so callers can
//! match on precise failure modes. Two broad classes exist:
//!
//! - **Sentinels** ([`Error::Stopped`], [`Error::WatcherStopped`]) mark an
//!   orderly shutdown rather than a failure and are safe to ignore during
//!   teardown.
//! - **Failures** are either consumed internally (retryable transport
//!   errors are backed off and retried by views) or surfaced on the next
//!   caller-visible operation (fatal transport errors, template execution
//!   errors, filesystem errors).
//!
//! Use [`Error::is_retryable`] to distinguish the two transport classes.

use thiserror::Error;

/// The error type for all lookout operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A dependency or view was stopped.
    ///
    /// This is a sentinel, not a failure: a `fetch` blocked in a long-poll
    /// returns it once `stop` has been called on the dependency.
    #[error("dependency stopped")]
    Stopped,

    /// A dependency query string did not match its grammar.
    ///
    /// Raised at construction time, before any network I/O happens.
    #[error("invalid query {query:?}: {reason}")]
    InvalidQuery {
        /// The offending query string.
        query: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A transient transport failure (connection refused, 5xx, timeout).
    ///
    /// Views consume these internally: the fetch is retried forever with
    /// exponential backoff. Callers only observe them when invoking a
    /// dependency's `fetch` directly.
    #[error("retryable error during {operation}: {reason}")]
    TransportRetryable {
        /// The backend operation that failed.
        operation: String,
        /// The underlying failure description.
        reason: String,
    },

    /// A permanent transport failure (4xx, permission denied, malformed
    /// response). The owning view retires itself and the error surfaces
    /// from the next resolver run for an affected template.
    #[error("fatal error during {operation}: {reason}")]
    TransportFatal {
        /// The backend operation that failed.
        operation: String,
        /// The underlying failure description.
        reason: String,
    },

    /// A required backend client was not configured on the [`ClientSet`].
    ///
    /// [`ClientSet`]: crate::clients::ClientSet
    #[error("no {backend} client configured")]
    NoClient {
        /// The backend kind the dependency needed ("consul", "vault").
        backend: String,
    },

    /// Template evaluation failed (syntax error, unknown function, a
    /// user-supplied function returned an error or panicked).
    #[error("template execution failed: {reason}")]
    TemplateExec {
        /// The cleaned-up engine error message.
        reason: String,
    },

    /// `wait` was called on a watcher that has been stopped.
    #[error("watcher stopped")]
    WatcherStopped,

    /// An atomic write was aborted because the destination's parent
    /// directory does not exist and directory creation was disabled.
    #[error("parent directory does not exist: {path}")]
    NoParentDir {
        /// The missing parent directory.
        path: String,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is consumed internally by view retry loops.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransportRetryable { .. })
    }

    /// Whether this error is a shutdown sentinel rather than a failure.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Error::Stopped | Error::WatcherStopped)
    }

    /// Convert a template engine error into [`Error::TemplateExec`],
    /// stripping the engine's internal one-off template name from the
    /// message chain.
    pub(crate) fn template_exec(err: &tera::Error) -> Self {
        use std::error::Error as _;

        let mut messages = vec![err.to_string()];
        let mut source = err.source();
        while let Some(cause) = source {
            messages.push(cause.to_string());
            source = cause.source();
        }

        let cleaned: Vec<String> = messages
            .into_iter()
            .map(|m| {
                m.replace("Failed to render '__tera_one_off'", "render failed")
                    .replace("Failed to parse '__tera_one_off'", "parse failed")
                    .replace("'__tera_one_off'", "template")
                    .trim()
                    .to_string()
            })
            .filter(|m| !m.is_empty())
            .collect();

        Error::TemplateExec {
            reason: cleaned.join(": "),
        }
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Stopped => Error::Stopped,
            Error::InvalidQuery { query, reason } => Error::InvalidQuery {
                query: query.clone(),
                reason: reason.clone(),
            },
            Error::TransportRetryable { operation, reason } => Error::TransportRetryable {
                operation: operation.clone(),
                reason: reason.clone(),
            },
            Error::TransportFatal { operation, reason } => Error::TransportFatal {
                operation: operation.clone(),
                reason: reason.clone(),
            },
            Error::NoClient { backend } => Error::NoClient {
                backend: backend.clone(),
            },
            Error::TemplateExec { reason } => Error::TemplateExec {
                reason: reason.clone(),
            },
            Error::WatcherStopped => Error::WatcherStopped,
            Error::NoParentDir { path } => Error::NoParentDir { path: path.clone() },
            // io::Error does not implement Clone; keep the message.
            Error::Io(e) => Error::TransportFatal {
                operation: "io".to_string(),
                reason: e.to_string(),
            },
        }
    }
}
