//! Process lifecycle for long-running services: an application shell owning the
//! dependency container and health aggregator, a signal-driven shutdown coordinator
//! that bounds teardown with a timeout, env-based configuration, and tracing setup.

mod app;
mod config;
mod error;
mod logging;
mod metrics;
mod runner;
mod shutdown;
mod signals;

pub use app::App;
pub use config::{AppConfig, DEFAULT_SHUTDOWN_TIMEOUT};
pub use error::LifecycleError;
pub use logging::init_tracing;
pub use runner::run;
pub use shutdown::{Shutdown, DEFAULT_TIMEOUT};
pub use tokio::signal::unix::SignalKind;
