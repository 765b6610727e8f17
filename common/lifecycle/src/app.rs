use std::future::Future;
use std::sync::{Arc, Mutex};

use common_deps::{Container, Dep, DepOptions};
use envconfig::Envconfig;
use futures::future::BoxFuture;
use futures::FutureExt;
use health::{HealthAggregator, HealthError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::{AppConfig, LifecycleError};

type CloseFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

#[derive(Default)]
struct Closers {
    closed: bool,
    fns: Vec<CloseFn>,
}

/// Application shell: the configuration, the dependency container, the health
/// aggregator, and whatever the application itself needs closed on the way out.
pub struct App {
    config: AppConfig,
    container: Container,
    health: HealthAggregator,
    closers: Mutex<Closers>,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        let health = config.health_aggregator().build();
        Self {
            config,
            container: Container::new(),
            health,
            closers: Mutex::new(Closers::default()),
        }
    }

    pub fn from_env() -> Result<Self, LifecycleError> {
        Ok(Self::new(AppConfig::init_from_env()?))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }

    /// Options for a transient dependency, tagged with the app's name and environment.
    pub fn dep_options(&self, logger_name: &str) -> DepOptions {
        let span = info_span!(
            "dep",
            app = %self.config.app_name,
            env = %self.config.app_env,
            dep = logger_name
        );
        DepOptions::new()
            .with_name(&self.config.app_name)
            .with_env(self.config.app_env)
            .with_span(span)
    }

    pub fn dep_singleton_options(&self, logger_name: &str) -> DepOptions {
        self.dep_options(logger_name).singleton()
    }

    /// Registers `dep`'s probe with the health aggregator under `name`.
    pub fn watch_dep_health<T>(&self, name: &str, dep: Arc<Dep<T>>) -> Result<(), HealthError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.health.register(name, move |token| {
            let dep = dep.clone();
            async move { dep.health(token).await }
        })
    }

    /// Adds a closer run by [`App::close`]. Closers run last-added first, before the
    /// container is torn down. Ignored once the app is closed.
    pub fn add_closer<F, Fut>(&self, close: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut closers = self.closers.lock().unwrap_or_else(|e| e.into_inner());
        if closers.closed {
            debug!(app = %self.config.app_name, "app closed, closer ignored");
            return;
        }
        closers.fns.push(Box::new(move |token| close(token).boxed()));
    }

    /// Stops the health aggregator, runs the closers in reverse order, then closes the
    /// container. Every failure is collected; none stops the sweep.
    pub async fn close(&self, token: CancellationToken) -> Result<(), LifecycleError> {
        let fns = {
            let mut closers = self.closers.lock().unwrap_or_else(|e| e.into_inner());
            if closers.closed {
                return Err(LifecycleError::Closed);
            }
            closers.closed = true;
            std::mem::take(&mut closers.fns)
        };

        info!(app = %self.config.app_name, closers = fns.len(), "closing app");
        self.health.stop();

        let mut failures = Vec::new();
        for (i, close) in fns.into_iter().enumerate().rev() {
            if let Err(e) = close(token.clone()).await {
                warn!(app = %self.config.app_name, closer = i, error = %e, "app closer failed");
                failures.push((format!("app[{i}]"), e));
            }
        }

        if let Err(e) = self.container.close(&token).await {
            failures.push(("container".to_string(), anyhow::Error::new(e)));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Close(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use common_deps::{DepKey, Env};

    use super::*;

    fn test_app() -> App {
        let vars = HashMap::from([
            ("APP_NAME".to_string(), "orders".to_string()),
            ("APP_ENV".to_string(), "test".to_string()),
        ]);
        App::new(AppConfig::init_from_hashmap(&vars).unwrap())
    }

    #[test]
    fn dep_options_carry_app_identity() {
        let app = test_app();
        let options = app.dep_options("cache");
        assert_eq!(options.name(), "orders");
        assert_eq!(options.env(), Env::Test);
        assert!(!options.is_singleton());
        assert!(app.dep_singleton_options("cache").is_singleton());
    }

    #[tokio::test]
    async fn closers_run_in_reverse_then_container() {
        const DB: DepKey<Arc<String>> = DepKey::new("db");

        let app = test_app();
        let order = Arc::new(Mutex::new(Vec::new()));

        let seen = order.clone();
        let db = Dep::new(DB, app.dep_singleton_options("db"), |_| async {
            Ok(Arc::new("conn".to_string()))
        })
        .with_closer(move |_, _| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push("container:db".to_string());
                Ok(())
            }
        });
        app.container().register(db).unwrap();
        app.container().get(DB).await.unwrap();

        for i in 0..3 {
            let seen = order.clone();
            app.add_closer(move |_| async move {
                seen.lock().unwrap().push(format!("app[{i}]"));
                Ok(())
            });
        }

        app.close(CancellationToken::new()).await.unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["app[2]", "app[1]", "app[0]", "container:db"]
        );
        assert!(app.health().is_stopped());
    }

    #[tokio::test]
    async fn close_joins_failures() {
        let app = test_app();
        app.add_closer(|_| async { Err(anyhow::anyhow!("flush failed")) });
        app.add_closer(|_| async { Ok(()) });
        app.add_closer(|_| async { Err(anyhow::anyhow!("socket busy")) });

        let err = app.close(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "app[2]: socket busy; app[0]: flush failed");
    }

    #[tokio::test]
    async fn second_close_is_rejected() {
        let app = test_app();
        app.close(CancellationToken::new()).await.unwrap();
        assert!(matches!(
            app.close(CancellationToken::new()).await,
            Err(LifecycleError::Closed)
        ));

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        app.add_closer(move |_| async move {
            *flag.lock().unwrap() = true;
            Ok(())
        });
        assert!(!*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn watched_dep_health_feeds_the_aggregator() {
        const CACHE: DepKey<u32> = DepKey::new("cache");

        let app = test_app();
        let cache = Dep::new(CACHE, app.dep_options("cache"), |_| async { Ok(7) })
            .with_health_check(|_, _| async { Err(anyhow::anyhow!("PING timed out")) });
        let cache = app.container().register(cache).unwrap();
        app.watch_dep_health("cache", cache).unwrap();

        let status = app.health().status(&CancellationToken::new()).await.unwrap();
        assert!(!status.healthy);
        assert_eq!(
            status.components["cache"].result().unwrap_err().to_string(),
            "PING timed out"
        );
    }
}
