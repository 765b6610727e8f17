//! Dependency error types.

use thiserror::Error;

/// Errors returned by [`Dep`](crate::Dep) and [`Container`](crate::Container) operations.
#[derive(Debug, Error)]
pub enum DepError {
    /// The handle was already closed; it can no longer produce instances.
    #[error("dependency '{key}' is already closed")]
    Closed { key: String },

    /// No handle was registered under the requested key.
    #[error("dependency '{key}' not found")]
    NotFound { key: String },

    /// A handle with the same key is already registered.
    #[error("dependency '{key}' already registered")]
    AlreadyRegistered { key: String },

    /// The key is registered, but with a different resource type.
    #[error("dependency '{key}' is registered as {registered}, requested as {requested}")]
    TypeMismatch {
        key: String,
        registered: &'static str,
        requested: &'static str,
    },

    /// The resolver failed; the error is passed through untouched.
    #[error(transparent)]
    Resolve(anyhow::Error),

    /// The instance's close capability failed. The handle is closed regardless.
    #[error("dependency '{key}' close failed: {source:#}")]
    CloseFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// One or more handles failed to close during container teardown. Each entry's
    /// message already names its key.
    #[error("{}", join_failures(.0))]
    Teardown(Vec<CloseFailure>),
}

/// A single failed close collected during [`Container::close`](crate::Container::close).
#[derive(Debug)]
pub struct CloseFailure {
    pub key: String,
    pub error: DepError,
}

fn join_failures(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.error.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl DepError {
    /// True for [`DepError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, DepError::Closed { .. })
    }
}
