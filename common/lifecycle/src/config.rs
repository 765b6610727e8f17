use std::time::Duration;

use common_deps::Env;
use envconfig::Envconfig;
use health::HealthAggregatorBuilder;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Envconfig, Clone, Debug)]
pub struct AppConfig {
    #[envconfig(from = "APP_NAME", default = "app")]
    pub app_name: String,

    #[envconfig(from = "APP_ENV", default = "dev")]
    pub app_env: Env,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(from = "SHUTDOWN_TIMEOUT_SECS", default = "30")]
    pub shutdown_timeout_secs: i64,

    // 0 evaluates health synchronously whenever the status is read
    #[envconfig(from = "HEALTH_INTERVAL_MS", default = "0")]
    pub health_interval_ms: u64,

    #[envconfig(from = "HEALTH_TIMEOUT_MS", default = "3000")]
    pub health_timeout_ms: u64,

    #[envconfig(from = "HEALTH_MAX_JOBS")]
    pub health_max_jobs: Option<usize>,
}

impl AppConfig {
    /// How long the teardown may run once shutdown starts. Zero or negative values
    /// fall back to [`DEFAULT_SHUTDOWN_TIMEOUT`].
    pub fn shutdown_timeout(&self) -> Duration {
        match u64::try_from(self.shutdown_timeout_secs) {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub(crate) fn health_aggregator(&self) -> HealthAggregatorBuilder {
        let builder = health::HealthAggregator::builder(&self.app_name)
            .with_interval(self.health_interval())
            .with_timeout(self.health_timeout());
        match self.health_max_jobs {
            Some(jobs) => builder.with_max_jobs(jobs),
            None => builder,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let config = AppConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.app_name, "app");
        assert_eq!(config.app_env, Env::Dev);
        assert_eq!(config.shutdown_timeout(), DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!(config.health_interval(), Duration::ZERO);
        assert_eq!(config.health_timeout(), Duration::from_secs(3));
        assert_eq!(config.health_max_jobs, None);
    }

    #[test]
    fn overrides() {
        let vars = HashMap::from([
            ("APP_NAME".to_string(), "billing".to_string()),
            ("APP_ENV".to_string(), "prod".to_string()),
            ("SHUTDOWN_TIMEOUT_SECS".to_string(), "5".to_string()),
            ("HEALTH_INTERVAL_MS".to_string(), "250".to_string()),
            ("HEALTH_MAX_JOBS".to_string(), "4".to_string()),
        ]);
        let config = AppConfig::init_from_hashmap(&vars).unwrap();
        assert_eq!(config.app_name, "billing");
        assert_eq!(config.app_env, Env::Production);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.health_interval(), Duration::from_millis(250));
        assert_eq!(config.health_max_jobs, Some(4));
    }

    #[test]
    fn non_positive_shutdown_timeout_uses_default() {
        for raw in ["0", "-3"] {
            let vars = HashMap::from([("SHUTDOWN_TIMEOUT_SECS".to_string(), raw.to_string())]);
            let config = AppConfig::init_from_hashmap(&vars).unwrap();
            assert_eq!(config.shutdown_timeout(), DEFAULT_SHUTDOWN_TIMEOUT);
        }
    }

    #[test]
    fn rejects_unknown_env() {
        let vars = HashMap::from([("APP_ENV".to_string(), "qa".to_string())]);
        assert!(AppConfig::init_from_hashmap(&vars).is_err());
    }
}
