//! Dependency handle: lazy construction, singleton caching, health hook, close-once.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::error::DepError;
use crate::options::DepOptions;

pub type ResolveFn<T> =
    Arc<dyn Fn(DepOptions) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;
pub type HealthFn<T> = Arc<
    dyn Fn(CancellationToken, Arc<Dep<T>>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;
type CloseFn<T> =
    Arc<dyn Fn(T, CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Synchronous, argument-less close capability of a resolved instance.
pub trait Close: Send + Sync {
    fn close(&self) -> anyhow::Result<()>;
}

/// Async close capability that observes the teardown token: once it fires, the
/// shutdown deadline has passed and the implementation should give up promptly.
#[async_trait]
pub trait CloseWithContext: Send + Sync {
    async fn close(&self, token: &CancellationToken) -> anyhow::Result<()>;
}

impl<C: Close + ?Sized> Close for Arc<C> {
    fn close(&self) -> anyhow::Result<()> {
        (**self).close()
    }
}

#[async_trait]
impl<C: CloseWithContext + ?Sized> CloseWithContext for Arc<C> {
    async fn close(&self, token: &CancellationToken) -> anyhow::Result<()> {
        (**self).close(token).await
    }
}

/// Typed identity of a dependency inside a [`Container`](crate::Container).
///
/// Declare one per resource, usually as a constant next to its resolver:
///
/// ```
/// use std::sync::Arc;
/// use common_deps::DepKey;
///
/// struct Pool;
/// const POOL: DepKey<Arc<Pool>> = DepKey::new("postgres-pool");
/// assert_eq!(POOL.name(), "postgres-pool");
/// ```
pub struct DepKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DepKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for DepKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DepKey<T> {}

impl<T> fmt::Debug for DepKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DepKey").field(&self.name).finish()
    }
}

struct State<T> {
    instance: Option<T>,
    resolved: bool,
    closed: bool,
}

/// Handle for one resource: owns its resolver, optional health probe and close
/// capability, and the cached instance for singletons.
///
/// All state transitions happen under the handle's own async mutex, which is held
/// while the resolver runs. Concurrent first access to a singleton therefore waits
/// for a single construction instead of racing several.
pub struct Dep<T> {
    key: &'static str,
    options: DepOptions,
    resolve: ResolveFn<T>,
    health: Option<HealthFn<T>>,
    closer: Option<CloseFn<T>>,
    state: Mutex<State<T>>,
}

impl<T> Dep<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(key: DepKey<T>, options: DepOptions, resolve: F) -> Self
    where
        F: Fn(DepOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            key: key.name(),
            options,
            resolve: Arc::new(move |opts| resolve(opts).boxed()),
            health: None,
            closer: None,
            state: Mutex::new(State {
                instance: None,
                resolved: false,
                closed: false,
            }),
        }
    }

    /// Attach a health probe. It receives the handle itself and may call
    /// [`get`](Dep::get); probes on transient handles must close what they obtain.
    pub fn with_health_check<F, Fut>(mut self, probe: F) -> Self
    where
        F: Fn(CancellationToken, Arc<Dep<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.health = Some(Arc::new(move |token, dep| probe(token, dep).boxed()));
        self
    }

    /// Close the cached instance with an arbitrary function.
    pub fn with_closer<F, Fut>(mut self, close: F) -> Self
    where
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closer = Some(Arc::new(move |instance, token| {
            close(instance, token).boxed()
        }));
        self
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn options(&self) -> &DepOptions {
        &self.options
    }

    /// Returns the cached instance for a resolved singleton, otherwise runs the resolver.
    /// A resolver error is returned as is and leaves the handle unresolved, so the next
    /// call tries again.
    pub async fn get(&self) -> Result<T, DepError> {
        let mut state = self.state.lock().await;

        if state.closed {
            return Err(DepError::Closed {
                key: self.key.to_owned(),
            });
        }

        if self.options.is_singleton() {
            if let Some(instance) = &state.instance {
                return Ok(instance.clone());
            }
        }

        let instance = (self.resolve)(self.options.clone())
            .instrument(self.options.span().clone())
            .await
            .map_err(DepError::Resolve)?;

        if self.options.is_singleton() {
            state.instance = Some(instance.clone());
        }
        state.resolved = true;
        debug!(
            key = self.key,
            singleton = self.options.is_singleton(),
            "dependency resolved"
        );

        Ok(instance)
    }

    /// Runs the health probe, if any. Does not require a prior [`get`](Dep::get).
    pub async fn health(self: &Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        match &self.health {
            Some(probe) => probe(token, Arc::clone(self)).await,
            None => Ok(()),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Closes the handle once. Never-resolved handles are left open and untouched.
    /// Otherwise the cached instance's close capability runs exactly once and the
    /// handle ends closed even if that close fails.
    pub async fn close(&self, token: &CancellationToken) -> Result<(), DepError> {
        let mut state = self.state.lock().await;

        if state.closed {
            return Err(DepError::Closed {
                key: self.key.to_owned(),
            });
        }

        if !state.resolved {
            debug!(key = self.key, "close (nop: unresolved)");
            return Ok(());
        }

        let instance = state.instance.take();
        state.resolved = false;
        state.closed = true;

        match (instance, &self.closer) {
            (Some(instance), Some(close)) => {
                debug!(key = self.key, "close");
                close(instance, token.clone())
                    .instrument(self.options.span().clone())
                    .await
                    .map_err(|source| DepError::CloseFailed {
                        key: self.key.to_owned(),
                        source,
                    })
            }
            (None, _) => {
                debug!(key = self.key, "close (nop: not cached)");
                Ok(())
            }
            (Some(_), None) => {
                debug!(key = self.key, "close (nop: no closer)");
                Ok(())
            }
        }
    }
}

impl<T> Dep<T>
where
    T: Close + Clone + 'static,
{
    /// Close the cached instance through its [`Close`] implementation.
    pub fn closeable(self) -> Self {
        self.with_closer(|instance: T, _token| async move { instance.close() })
    }
}

impl<T> Dep<T>
where
    T: CloseWithContext + Clone + 'static,
{
    /// Close the cached instance through its [`CloseWithContext`] implementation.
    pub fn closeable_with_context(self) -> Self {
        self.with_closer(|instance: T, token| async move { instance.close(&token).await })
    }
}

impl<T> fmt::Debug for Dep<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dep")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Clone, Debug)]
    struct Conn {
        id: usize,
        closed: Arc<AtomicUsize>,
    }

    impl Close for Conn {
        fn close(&self) -> anyhow::Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const CONN: DepKey<Conn> = DepKey::new("conn");

    fn counting_dep(options: DepOptions) -> (Dep<Conn>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (c, cl) = (calls.clone(), closed.clone());
        let dep = Dep::new(CONN, options, move |_| {
            let id = c.fetch_add(1, Ordering::SeqCst);
            let closed = cl.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Conn { id, closed })
            }
        })
        .closeable();
        (dep, calls, closed)
    }

    #[tokio::test]
    async fn singleton_resolves_once_under_concurrent_callers() {
        let (dep, calls, _) = counting_dep(DepOptions::new().singleton());
        let dep = Arc::new(dep);

        let gets = (0..16).map(|_| {
            let dep = dep.clone();
            tokio::spawn(async move { dep.get().await.unwrap().id })
        });
        let ids = futures::future::join_all(gets).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ids.into_iter().all(|id| id.unwrap() == 0));
    }

    #[tokio::test]
    async fn transient_resolves_on_every_get() {
        let (dep, calls, _) = counting_dep(DepOptions::new());

        for expected in 0..3 {
            assert_eq!(dep.get().await.unwrap().id, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn resolver_failure_is_verbatim_and_retryable() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let dep = Dep::new(
            DepKey::<u32>::new("flaky"),
            DepOptions::new().singleton(),
            move |_| {
                let attempt = a.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        anyhow::bail!("connection refused")
                    }
                    Ok(42)
                }
            },
        );

        let err = dep.get().await.unwrap_err();
        assert!(matches!(err, DepError::Resolve(_)));
        assert_eq!(err.to_string(), "connection refused");
        assert!(!dep.is_closed().await);

        assert_eq!(dep.get().await.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_runs_closer_once_then_rejects() {
        let (dep, _, closed) = counting_dep(DepOptions::new().singleton());
        let token = CancellationToken::new();

        dep.get().await.unwrap();
        dep.close(&token).await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(dep.is_closed().await);

        assert!(dep.close(&token).await.unwrap_err().is_closed());
        assert!(dep.get().await.unwrap_err().is_closed());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_unresolved_is_nop() {
        let (dep, calls, closed) = counting_dep(DepOptions::new().singleton());

        dep.close(&CancellationToken::new()).await.unwrap();
        assert!(!dep.is_closed().await);
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        dep.get().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_close_does_not_touch_handed_out_instances() {
        let (dep, _, closed) = counting_dep(DepOptions::new());

        dep.get().await.unwrap();
        dep.close(&CancellationToken::new()).await.unwrap();
        assert!(dep.is_closed().await);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_failure_still_closes() {
        let dep = Dep::new(
            DepKey::<Arc<String>>::new("broken"),
            DepOptions::new().singleton(),
            |_| async { Ok(Arc::new("x".to_owned())) },
        )
        .with_closer(|_, _| async { Err(anyhow::anyhow!("socket already gone")) });
        let token = CancellationToken::new();

        dep.get().await.unwrap();
        let err = dep.close(&token).await.unwrap_err();
        assert!(matches!(err, DepError::CloseFailed { ref key, .. } if key == "broken"));
        assert!(err.to_string().contains("socket already gone"));
        assert!(dep.close(&token).await.unwrap_err().is_closed());
    }

    struct Client {
        saw_cancelled: AtomicUsize,
    }

    #[async_trait]
    impl CloseWithContext for Client {
        async fn close(&self, token: &CancellationToken) -> anyhow::Result<()> {
            if token.is_cancelled() {
                self.saw_cancelled.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn context_closer_receives_token() {
        let client = Arc::new(Client {
            saw_cancelled: AtomicUsize::new(0),
        });
        let c = client.clone();
        let dep = Dep::new(
            DepKey::<Arc<Client>>::new("client"),
            DepOptions::new().singleton(),
            move |_| {
                let c = c.clone();
                async move { Ok(c) }
            },
        )
        .closeable_with_context();

        dep.get().await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        dep.close(&token).await.unwrap();
        assert_eq!(client.saw_cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_delegates_to_probe() {
        let (dep, _, _) = counting_dep(DepOptions::new().singleton());
        let dep = Arc::new(dep);
        assert!(dep.health(CancellationToken::new()).await.is_ok());

        let (dep, calls, _) = counting_dep(DepOptions::new().singleton());
        let dep = Arc::new(dep.with_health_check(|_, dep: Arc<Dep<Conn>>| async move {
            let conn = dep.get().await?;
            anyhow::ensure!(conn.id == 0, "unexpected connection {}", conn.id);
            Ok(())
        }));
        assert!(dep.health(CancellationToken::new()).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
