//! Typed registry of dependency handles with reverse-of-first-access teardown.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CloseFailure, DepError};
use crate::handle::{Dep, DepKey};

/// Object-safe view of a [`Dep`], so handles of different types share one map.
trait ErasedDep: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn close<'a>(&'a self, token: &'a CancellationToken) -> BoxFuture<'a, Result<(), DepError>>;
    fn health(self: Arc<Self>, token: CancellationToken) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<T> ErasedDep for Dep<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn close<'a>(&'a self, token: &'a CancellationToken) -> BoxFuture<'a, Result<(), DepError>> {
        Dep::close(self, token).boxed()
    }

    fn health(self: Arc<Self>, token: CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> {
        async move { Dep::health(&self, token).await }.boxed()
    }
}

/// Registry of dependency handles keyed by [`DepKey`].
///
/// Handles are registered at startup and resolved on demand through [`get`](Container::get).
/// The first successful `get` for a key enrolls it for teardown; [`close`](Container::close)
/// then walks the enrolled keys backwards. A dependent usually pulls its own dependencies
/// in while it is being constructed, so they enroll before it does and close after it.
#[derive(Default)]
pub struct Container {
    deps: RwLock<HashMap<&'static str, Arc<dyn ErasedDep>>>,
    order: RwLock<Vec<&'static str>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handle and returns the shared reference kept by the container.
    /// Fails without touching the existing entry when the key is already taken.
    pub fn register<T>(&self, dep: Dep<T>) -> Result<Arc<Dep<T>>, DepError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = dep.key();
        let dep = Arc::new(dep);

        let mut deps = self.deps.write().unwrap_or_else(|e| e.into_inner());
        if deps.contains_key(key) {
            return Err(DepError::AlreadyRegistered {
                key: key.to_owned(),
            });
        }
        deps.insert(key, dep.clone());
        debug!(key, "dependency registered");

        Ok(dep)
    }

    /// Looks up the handle registered for `key`, with its concrete type.
    pub fn dep<T>(&self, key: DepKey<T>) -> Result<Arc<Dep<T>>, DepError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let erased = self
            .deps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key.name())
            .cloned()
            .ok_or_else(|| DepError::NotFound {
                key: key.name().to_owned(),
            })?;
        let registered = erased.type_name();

        erased
            .into_any()
            .downcast::<Dep<T>>()
            .map_err(|_| DepError::TypeMismatch {
                key: key.name().to_owned(),
                registered,
                requested: type_name::<T>(),
            })
    }

    /// Resolves the dependency registered for `key`, enrolling it for teardown on success.
    pub async fn get<T>(&self, key: DepKey<T>) -> Result<T, DepError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let dep = self.dep(key)?;
        let instance = dep.get().await?;
        self.enroll(key.name());

        Ok(instance)
    }

    fn enroll(&self, key: &'static str) {
        if self
            .order
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&key)
        {
            return;
        }

        let mut order = self.order.write().unwrap_or_else(|e| e.into_inner());
        if !order.contains(&key) {
            order.push(key);
        }
    }

    /// Keys in the order they will be closed.
    pub fn teardown_order(&self) -> Vec<&'static str> {
        let order = self.order.read().unwrap_or_else(|e| e.into_inner());
        order.iter().rev().copied().collect()
    }

    /// Runs every registered handle's health probe, sorted by key, and reports the
    /// first failure prefixed with its key.
    pub async fn health(&self, token: CancellationToken) -> anyhow::Result<()> {
        let mut deps: Vec<(&'static str, Arc<dyn ErasedDep>)> = self
            .deps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(key, dep)| (*key, dep.clone()))
            .collect();
        deps.sort_by_key(|(key, _)| *key);

        for (key, dep) in deps {
            dep.health(token.clone())
                .await
                .map_err(|e| e.context(format!("dependency '{key}'")))?;
        }

        Ok(())
    }

    /// Closes enrolled handles, last enrolled first. Every handle gets its close call
    /// even when earlier ones fail; failures are returned together. The enrollment list
    /// is emptied, so later calls do nothing.
    pub async fn close(&self, token: &CancellationToken) -> Result<(), DepError> {
        let order = std::mem::take(&mut *self.order.write().unwrap_or_else(|e| e.into_inner()));
        if order.is_empty() {
            return Ok(());
        }

        let deps: Vec<(&'static str, Option<Arc<dyn ErasedDep>>)> = {
            let deps = self.deps.read().unwrap_or_else(|e| e.into_inner());
            order
                .iter()
                .rev()
                .map(|key| (*key, deps.get(key).cloned()))
                .collect()
        };

        let mut failures = Vec::new();
        for (key, dep) in deps {
            let Some(dep) = dep else {
                continue;
            };
            if let Err(error) = dep.close(token).await {
                warn!(key, error = %error, "dependency close failed");
                failures.push(CloseFailure {
                    key: key.to_owned(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DepError::Teardown(failures))
        }
    }
}
