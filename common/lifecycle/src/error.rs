//! Errors returned by the application shell and the shutdown coordinator.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// [`App::close`](crate::App::close) was called more than once.
    #[error("app already closed")]
    Closed,

    /// One or more closers failed; the sweep still visited every closer.
    #[error("{}", join_failures(.0))]
    Close(Vec<(String, anyhow::Error)>),

    /// The teardown did not finish within the configured window. It keeps running
    /// in the background with its token cancelled.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("shutdown failed: {0:#}")]
    Teardown(anyhow::Error),

    #[error("shutdown teardown panicked")]
    TeardownPanicked,

    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),

    #[error("invalid log level '{0}'")]
    LogLevel(String),

    #[error("failed to install tracing subscriber: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    /// The service's main future returned an error.
    #[error(transparent)]
    Main(anyhow::Error),
}

fn join_failures(failures: &[(String, anyhow::Error)]) -> String {
    failures
        .iter()
        .map(|(who, err)| format!("{who}: {err:#}"))
        .collect::<Vec<_>>()
        .join("; ")
}
