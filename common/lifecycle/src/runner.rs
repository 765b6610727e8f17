use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{App, LifecycleError, Shutdown};

/// Runs `main` under the app's lifecycle.
///
/// The coordinator is armed with a fresh root token and [`App::close`] as its
/// teardown. A watched signal (or [`Shutdown::request_shutdown`]) cancels the root
/// token, which `main` receives and is expected to honour. Once `main` returns, for
/// whatever reason, the shutdown sequence runs. `main`'s error wins over a shutdown
/// error when both happen.
pub async fn run<F, Fut>(app: Arc<App>, shutdown: Arc<Shutdown>, main: F) -> Result<(), LifecycleError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let root = CancellationToken::new();
    let teardown_app = app.clone();
    shutdown.setup(
        root.clone(),
        move |token| async move {
            teardown_app
                .close(token)
                .await
                .map_err(anyhow::Error::from)
        },
        app.config().shutdown_timeout(),
    );

    tokio::spawn({
        let shutdown = shutdown.clone();
        let root = root.clone();
        async move {
            shutdown.wait_for_signal().await;
            root.cancel();
        }
    });

    tokio::spawn({
        let app = app.clone();
        async move {
            if let Err(e) = app.health().run().await {
                error!(error = %e, "health aggregator did not start");
            }
        }
    });

    info!(app = %app.config().app_name, env = %app.config().app_env, "app started");
    let result = main(root.clone()).await;
    if let Err(e) = &result {
        error!(error = %e, "app exited with error");
    }

    let down = shutdown.down().await;
    result.map_err(LifecycleError::Main)?;
    down
}
