//! Counts ticks in a lazily constructed store and serves them over HTTP, with
//! readiness backed by the health aggregator and an orderly, bounded shutdown.
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use common_deps::{Dep, DepKey};
use envconfig::Envconfig;
use lifecycle::{App, LifecycleError, Shutdown};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::store::{CounterStore, Reporter};

mod config;
mod store;

const STORE: DepKey<Arc<CounterStore>> = DepKey::new("counter-store");
const REPORTER: DepKey<Arc<Reporter>> = DepKey::new("reporter");

fn register_deps(app: &App) -> anyhow::Result<()> {
    let store = Dep::new(STORE, app.dep_singleton_options("counter-store"), |_| async {
        Ok(Arc::new(CounterStore::default()))
    })
    .with_health_check(|_, dep| async move {
        let store = dep.get().await?;
        store.ping()
    })
    .closeable();
    let store = app.container().register(store)?;
    app.watch_dep_health("counter-store", store)?;

    let reporter = Dep::new(REPORTER, app.dep_singleton_options("reporter"), |options| async move {
        Ok(Arc::new(Reporter::new(options.name())))
    })
    .closeable_with_context();
    app.container().register(reporter)?;

    Ok(())
}

async fn readiness(State(app): State<Arc<App>>) -> Response {
    match app.health().status(&CancellationToken::new()).await {
        Ok(status) => status.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn ticks(State(app): State<Arc<App>>) -> Response {
    match app.container().get(STORE).await {
        Ok(store) => store.get("ticks").to_string().into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn serve(app: Arc<App>, config: Config, root: CancellationToken) -> anyhow::Result<()> {
    let router = Router::new()
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(|| async { "ok" }))
        .route("/ticks", get(ticks))
        .with_state(app.clone());

    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    info!("listening on {}", config.bind());
    let server = tokio::spawn({
        let root = root.clone();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(root.cancelled_owned())
                .await
        }
    });

    let store = app.container().get(STORE).await?;
    let reporter = app.container().get(REPORTER).await?;
    let mut interval = tokio::time::interval(config.tick_interval.0);
    loop {
        tokio::select! {
            _ = root.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = store.incr("ticks") {
                    warn!(error = %e, "tick dropped");
                }
                reporter.report(&store);
            }
        }
    }

    server.await??;
    info!("http server drained");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), LifecycleError> {
    let app = Arc::new(App::from_env()?);
    lifecycle::init_tracing(app.config())?;

    let config = Config::init_from_env()?;
    register_deps(&app).map_err(LifecycleError::Main)?;
    app.add_closer(|_| async {
        info!("app closers done");
        Ok(())
    });

    let shutdown = Arc::new(Shutdown::new(&app.config().app_name));
    lifecycle::run(app.clone(), shutdown, move |root| serve(app, config, root)).await
}
