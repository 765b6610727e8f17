use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ComponentStatus, HealthError, HealthStatus};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

pub type ProbeFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn default_max_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
        + 1
}

pub struct HealthAggregatorBuilder {
    name: String,
    interval: Duration,
    timeout: Duration,
    max_jobs: usize,
}

impl HealthAggregatorBuilder {
    /// Delay between background passes. Zero (the default) means no background
    /// passes: every [`HealthAggregator::status`] call evaluates all probes itself.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Deadline for a single pass. Zero disables it, leaving only the caller's
    /// token and [`HealthAggregator::stop`] to end a pass early.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Maximum number of probes running at the same time.
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    pub fn build(self) -> HealthAggregator {
        HealthAggregator {
            name: self.name,
            interval: self.interval,
            timeout: self.timeout,
            max_jobs: self.max_jobs,
            probes: RwLock::new(Vec::new()),
            status: RwLock::new(HealthStatus::default()),
            pass: Mutex::new(()),
            stop: CancellationToken::new(),
        }
    }
}

/// Runs named probes concurrently and keeps the last [`HealthStatus`].
pub struct HealthAggregator {
    name: String,
    interval: Duration,
    timeout: Duration,
    max_jobs: usize,
    probes: RwLock<Vec<(String, ProbeFn)>>,
    status: RwLock<HealthStatus>,
    pass: Mutex<()>,
    stop: CancellationToken,
}

/// Cancellation sources of one pass; `token` fires as soon as any of them does.
#[derive(Clone)]
struct PassScope {
    token: CancellationToken,
    caller: CancellationToken,
    stop: CancellationToken,
    timeout: Duration,
}

impl PassScope {
    fn cause(&self) -> HealthError {
        if self.stop.is_cancelled() {
            HealthError::Stopped
        } else if self.caller.is_cancelled() {
            HealthError::Canceled
        } else {
            HealthError::DeadlineExceeded(self.timeout)
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

impl HealthAggregator {
    pub fn builder(name: &str) -> HealthAggregatorBuilder {
        HealthAggregatorBuilder {
            name: name.to_owned(),
            interval: Duration::ZERO,
            timeout: DEFAULT_TIMEOUT,
            max_jobs: default_max_jobs(),
        }
    }

    pub fn new(name: &str) -> Self {
        Self::builder(name).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// Registers a probe under a unique name. The component reports as not yet
    /// checked, and the aggregate as unhealthy, until the next pass completes.
    pub fn register<F, Fut>(&self, name: impl Into<String>, probe: F) -> Result<(), HealthError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let probe: ProbeFn = Arc::new(move |token| probe(token).boxed());

        let mut probes = self.probes.write().unwrap_or_else(|e| e.into_inner());
        if probes.iter().any(|(existing, _)| *existing == name) {
            return Err(HealthError::AlreadyRegistered { name });
        }
        probes.push((name.clone(), probe));

        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        let mut next = status.clone();
        next.components
            .insert(name.clone(), ComponentStatus::NotYetChecked);
        next.healthy = false;
        *status = next;

        debug!(aggregator = %self.name, component = %name, "health check registered");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stops the aggregator for good: background runs return, in-flight probes see
    /// their token cancelled, and later passes fail with [`HealthError::Stopped`].
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!(aggregator = %self.name, "health checker stopped");
        }
        self.stop.cancel();
    }

    /// The snapshot published by the last pass, without running any probe.
    pub fn last_status(&self) -> HealthStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Returns the current status. Without a background interval this runs a pass
    /// first, bounded by the configured timeout and the caller's token.
    pub async fn status(&self, token: &CancellationToken) -> Result<HealthStatus, HealthError> {
        if self.is_stopped() {
            return Err(HealthError::Stopped);
        }
        if self.interval.is_zero() {
            return self.evaluate(token).await;
        }
        Ok(self.last_status())
    }

    /// Background mode: evaluates immediately, then once per interval until stopped.
    /// A stop interrupts the wait between passes and is delivered into a running pass.
    /// Without an interval there is nothing to schedule and this just waits for the stop.
    pub async fn run(&self) -> Result<(), HealthError> {
        if self.is_stopped() {
            return Err(HealthError::Stopped);
        }
        if self.interval.is_zero() {
            self.stop.cancelled().await;
            return Ok(());
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let never = CancellationToken::new();

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            match self.evaluate(&never).await {
                Ok(_) => {}
                Err(HealthError::Stopped) => return Ok(()),
                Err(e) => warn!(aggregator = %self.name, error = %e, "health pass failed"),
            }
        }
    }

    /// Runs one pass over every registered probe and replaces the snapshot with its
    /// outcome. Passes are serialized; probe failures are recorded, never returned.
    pub async fn evaluate(&self, token: &CancellationToken) -> Result<HealthStatus, HealthError> {
        if self.is_stopped() {
            return Err(HealthError::Stopped);
        }
        let _pass = self.pass.lock().await;
        if self.is_stopped() {
            return Err(HealthError::Stopped);
        }

        let probes = self
            .probes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if probes.is_empty() {
            return Ok(self.publish(HashMap::new()));
        }

        // a caller token that is already cancelled denies every admission below
        let scope = PassScope {
            token: token.child_token(),
            caller: token.clone(),
            stop: self.stop.clone(),
            timeout: self.timeout,
        };
        let _cancel_on_exit = scope.token.clone().drop_guard();
        let deadline = (!self.timeout.is_zero()).then(|| Instant::now() + self.timeout);
        if scope.stop.is_cancelled() {
            scope.token.cancel();
        }
        {
            let scope = scope.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = scope.stop.cancelled() => {}
                    _ = deadline_elapsed(deadline) => {}
                    _ = scope.token.cancelled() => {}
                }
                scope.token.cancel();
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.max_jobs));
        let mut tasks = JoinSet::new();
        let mut components = HashMap::with_capacity(probes.len());

        for (name, probe) in probes.iter().cloned() {
            let permit = tokio::select! {
                biased;
                _ = scope.token.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                components.insert(name, ComponentStatus::Unhealthy(Arc::new(scope.cause())));
                continue;
            };

            let scope = scope.clone();
            tasks.spawn(async move {
                let checked = AssertUnwindSafe(async { probe(scope.token.clone()).await })
                    .catch_unwind();
                let result = tokio::select! {
                    biased;
                    result = checked => match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(HealthError::Probe(e)),
                        Err(panic) => Err(HealthError::Panicked(panic_message(&*panic))),
                    },
                    _ = scope.token.cancelled() => Err(scope.cause()),
                };
                drop(permit);
                (name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    components.insert(name, ComponentStatus::Healthy);
                }
                Ok((name, Err(e))) => {
                    components.insert(name, ComponentStatus::Unhealthy(Arc::new(e)));
                }
                Err(e) => warn!(aggregator = %self.name, error = %e, "health probe task failed"),
            }
        }

        for (name, _) in &probes {
            components.entry(name.clone()).or_insert_with(|| {
                ComponentStatus::Unhealthy(Arc::new(HealthError::Panicked(
                    "probe task did not complete".to_owned(),
                )))
            });
        }

        Ok(self.publish(components))
    }

    /// Swaps in a new snapshot. Probes registered while the pass was running are
    /// carried over as not yet checked, so every registered name has an entry.
    fn publish(&self, mut components: HashMap<String, ComponentStatus>) -> HealthStatus {
        let probes = self.probes.read().unwrap_or_else(|e| e.into_inner());
        for (name, _) in probes.iter() {
            components
                .entry(name.clone())
                .or_insert(ComponentStatus::NotYetChecked);
        }

        let healthy = components.values().all(ComponentStatus::is_healthy);
        for (component, status) in &components {
            metrics::gauge!(
                "health_component_healthy",
                "aggregator" => self.name.clone(),
                "component" => component.clone()
            )
            .set(if status.is_healthy() { 1.0 } else { 0.0 });
        }
        metrics::counter!(
            "health_passes_total",
            "aggregator" => self.name.clone(),
            "healthy" => healthy.to_string()
        )
        .increment(1);

        let status = HealthStatus {
            healthy,
            components,
        };
        match status.healthy {
            true => debug!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, status.components),
        }

        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status.clone();
        status
    }
}
