use common_deps::Env;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{AppConfig, LifecycleError};

/// Installs the global tracing subscriber: human-readable output in dev, JSON lines
/// everywhere else. `RUST_LOG` directives still apply on top of the configured level.
pub fn init_tracing(config: &AppConfig) -> Result<(), LifecycleError> {
    let level: LevelFilter = config
        .log_level
        .parse()
        .map_err(|_| LifecycleError::LogLevel(config.log_level.clone()))?;

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    match config.app_env {
        Env::Dev => registry
            .with(fmt::layer().with_target(true).with_level(true))
            .try_init()?,
        _ => registry
            .with(fmt::layer().json().flatten_event(true).with_current_span(true))
            .try_init()?,
    }

    tracing::info!(app = %config.app_name, env = %config.app_env, "logging initialized");
    Ok(())
}
