use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("health check '{name}' already registered")]
    AlreadyRegistered { name: String },

    /// Registered, but no evaluation pass has run the probe yet.
    #[error("not yet checked")]
    NotYetChecked,

    /// The aggregator was stopped; stopping is irreversible.
    #[error("health checker stopped")]
    Stopped,

    #[error("health check deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The caller's token fired before the probe finished or got a worker slot.
    #[error("health check canceled")]
    Canceled,

    #[error("health check panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Probe(anyhow::Error),
}
