use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::LifecycleError;
use crate::metrics;
use crate::signals;

/// Used when [`Shutdown::setup`] is given a zero timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

type TeardownFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Armed {
    root: CancellationToken,
    teardown: Mutex<Option<TeardownFn>>,
    timeout: Duration,
}

/// Coordinates a single, time-bounded shutdown of the process.
///
/// The coordinator is created before anything else, armed once with the root token
/// and the teardown to run, and torn down at most once:
///   - [`Shutdown::wait_for_signal`] resolves once a watched OS signal arrives or
///     [`Shutdown::request_shutdown`] is called; any number of tasks can wait
///   - [`Shutdown::down`] cancels the root token, then races the teardown against
///     the timeout; later or concurrent calls return immediately
pub struct Shutdown {
    name: String,
    signals: Vec<SignalKind>,
    triggered: CancellationToken,
    reason: Arc<OnceLock<String>>,
    listening: AtomicBool,
    shutting_down: AtomicBool,
    armed: OnceLock<Armed>,
}

impl Shutdown {
    /// A coordinator watching SIGINT and SIGTERM.
    pub fn new(name: &str) -> Self {
        Self::with_signals(name, Vec::new())
    }

    /// A coordinator watching `signals`, or the SIGINT/SIGTERM pair when empty.
    pub fn with_signals(name: &str, signals: Vec<SignalKind>) -> Self {
        let signals = if signals.is_empty() {
            signals::default_signals()
        } else {
            signals
        };
        Self {
            name: name.to_owned(),
            signals,
            triggered: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            listening: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            armed: OnceLock::new(),
        }
    }

    /// Arms the coordinator. `root` is cancelled as the first step of [`Shutdown::down`],
    /// before `teardown` runs. A zero `timeout` selects [`DEFAULT_TIMEOUT`].
    ///
    /// # Panics
    ///
    /// If called more than once.
    pub fn setup<F, Fut>(&self, root: CancellationToken, teardown: F, timeout: Duration)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        let teardown: TeardownFn = Box::new(move |token| teardown(token).boxed());
        let armed = Armed {
            root,
            teardown: Mutex::new(Some(teardown)),
            timeout,
        };
        if self.armed.set(armed).is_err() {
            panic!("shutdown for {} was set up twice", self.name);
        }
    }

    /// Resolves once a watched signal is delivered or shutdown is requested.
    ///
    /// The listener stops watching after the first signal, but tokio keeps its
    /// process-wide handler installed, so the default disposition is not restored:
    /// a second Ctrl-C during a hung teardown is swallowed, and the process exits
    /// only once the shutdown timeout has elapsed and the caller returns.
    pub async fn wait_for_signal(&self) {
        self.listen();
        self.triggered.cancelled().await;
    }

    /// Behaves as if a watched signal had been delivered.
    pub fn request_shutdown(&self) {
        if self.reason.set("requested".to_string()).is_ok() {
            info!(service = %self.name, "shutdown requested");
        }
        self.triggered.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.is_cancelled()
    }

    fn listen(&self) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let signals = self.signals.clone();
        let triggered = self.triggered.clone();
        let reason = self.reason.clone();
        tokio::spawn(async move {
            if let Some(kind) = signals::wait_for_any(&signals, &triggered).await {
                let name = signals::signal_name(kind);
                info!(signal = %name, "received signal");
                reason.get_or_init(|| name);
            }
            triggered.cancel();
        });
    }

    /// Runs the shutdown sequence once. Returns `Ok(())` without doing anything if the
    /// coordinator was never armed or a shutdown already started.
    pub async fn down(&self) -> Result<(), LifecycleError> {
        let Some(armed) = self.armed.get() else {
            debug!(service = %self.name, "shutdown before setup, nothing to tear down");
            return Ok(());
        };
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(service = %self.name, "shutdown already in progress");
            return Ok(());
        }

        let span = info_span!("shutdown", service = %self.name);
        self.run_teardown(armed).instrument(span).await
    }

    async fn run_teardown(&self, armed: &Armed) -> Result<(), LifecycleError> {
        let reason = self
            .reason
            .get()
            .map(String::as_str)
            .unwrap_or("completed");
        metrics::emit_shutdown_initiated(&self.name, reason);
        info!(
            trigger_reason = reason,
            timeout_secs = armed.timeout.as_secs_f64(),
            "shutdown start"
        );

        armed.root.cancel();
        // waiters that are still parked on the gate have nothing left to wait for
        self.triggered.cancel();

        let teardown = armed
            .teardown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(teardown) = teardown else {
            return Ok(());
        };

        let started = Instant::now();
        let token = CancellationToken::new();
        let mut task = tokio::spawn({
            let token = token.clone();
            async move { teardown(token).await }
        });

        let result = tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(LifecycleError::Teardown(e)),
                Err(_) => Err(LifecycleError::TeardownPanicked),
            },
            _ = tokio::time::sleep(armed.timeout) => {
                token.cancel();
                Err(LifecycleError::ShutdownTimeout(armed.timeout))
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(()) => info!(duration_secs = elapsed, "shutdown complete"),
            Err(LifecycleError::ShutdownTimeout(_)) => {
                warn!(duration_secs = elapsed, "shutdown timed out, teardown still running")
            }
            Err(e) => error!(duration_secs = elapsed, error = %e, "shutdown failed"),
        }
        let outcome = match &result {
            Ok(()) => "ok",
            Err(LifecycleError::ShutdownTimeout(_)) => "timeout",
            Err(_) => "error",
        };
        metrics::emit_shutdown_duration(&self.name, outcome, elapsed);
        metrics::emit_shutdown_completed(&self.name, result.is_ok());
        result
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("name", &self.name)
            .field("signals", &self.signals)
            .field("triggered", &self.is_triggered())
            .field("armed", &self.armed.get().is_some())
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn down_before_setup_is_a_no_op() {
        let shutdown = Shutdown::new("test");
        shutdown.down().await.unwrap();
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn request_releases_waiters() {
        let shutdown = Arc::new(Shutdown::new("test"));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { shutdown.wait_for_signal().await })
            })
            .collect();

        shutdown.request_shutdown();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter released")
                .unwrap();
        }
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn empty_signal_list_watches_defaults() {
        let shutdown = Shutdown::with_signals("test", Vec::new());
        assert_eq!(shutdown.signals, signals::default_signals());
    }

    #[tokio::test]
    async fn zero_timeout_selects_default() {
        let shutdown = Shutdown::new("test");
        shutdown.setup(CancellationToken::new(), |_| async { Ok(()) }, Duration::ZERO);
        assert_eq!(shutdown.armed.get().map(|a| a.timeout), Some(DEFAULT_TIMEOUT));
    }

    #[tokio::test]
    async fn teardown_error_is_returned() {
        let shutdown = Shutdown::new("test");
        shutdown.setup(
            CancellationToken::new(),
            |_| async { Err(anyhow::anyhow!("db flush failed")) },
            Duration::from_secs(1),
        );
        let err = shutdown.down().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Teardown(_)));
        assert_eq!(err.to_string(), "shutdown failed: db flush failed");
    }

    #[tokio::test]
    async fn panicking_teardown_is_reported() {
        let shutdown = Shutdown::new("test");
        shutdown.setup(
            CancellationToken::new(),
            |_| async {
                if true {
                    panic!("teardown exploded");
                }
                Ok(())
            },
            Duration::from_secs(1),
        );
        assert!(matches!(
            shutdown.down().await,
            Err(LifecycleError::TeardownPanicked)
        ));
    }
}
