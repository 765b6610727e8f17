use std::collections::HashMap;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

mod aggregator;
mod error;

pub use aggregator::{HealthAggregator, HealthAggregatorBuilder, ProbeFn};
pub use error::HealthError;

/// Health checking for the subsystems a service depends on.
///
/// A HealthAggregator holds one probe per named subsystem (a database
/// pool, a cache client, a downstream gRPC channel). An evaluation pass runs
/// every probe concurrently, with a cap on how many run at once and a
/// deadline for the whole pass, and publishes the outcome as one snapshot:
///   - a subsystem is healthy only if its probe returned Ok during the last pass
///   - a probe that errors, panics, or runs past the deadline marks only its own
///     subsystem unhealthy, the pass itself always completes
///   - subsystems registered after the last pass show as not yet checked,
///     which counts as unhealthy
///
/// Passes run either on demand, when the status is read, or on a background
/// interval via [`HealthAggregator::run`].

#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl Default for HealthStatus {
    /// No components means nothing can be failing.
    fn default() -> Self {
        Self {
            healthy: true,
            components: HashMap::new(),
        }
    }
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    NotYetChecked,
    /// The probe succeeded during the last pass
    Healthy,
    /// The probe failed, panicked or timed out during the last pass
    Unhealthy(Arc<HealthError>),
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::Healthy)
    }

    /// The last recorded error, with [`HealthError::NotYetChecked`] for components that
    /// were never probed.
    pub fn result(&self) -> Result<(), Arc<HealthError>> {
        match self {
            ComponentStatus::Healthy => Ok(()),
            ComponentStatus::NotYetChecked => Err(Arc::new(HealthError::NotYetChecked)),
            ComponentStatus::Unhealthy(err) => Err(err.clone()),
        }
    }
}
