use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use common_deps::{Close, CloseWithContext};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// In-memory counter store standing in for a real database client.
#[derive(Default)]
pub struct CounterStore {
    counters: RwLock<HashMap<String, u64>>,
    closed: RwLock<bool>,
}

impl CounterStore {
    pub fn incr(&self, name: &str) -> anyhow::Result<u64> {
        if self.is_closed() {
            anyhow::bail!("counter store is closed");
        }
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        let value = counters.entry(name.to_owned()).or_default();
        *value += 1;
        Ok(*value)
    }

    pub fn get(&self, name: &str) -> u64 {
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        counters.get(name).copied().unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ping(&self) -> anyhow::Result<()> {
        match self.is_closed() {
            true => Err(anyhow::anyhow!("counter store is closed")),
            false => Ok(()),
        }
    }
}

impl Close for CounterStore {
    fn close(&self) -> anyhow::Result<()> {
        let mut closed = self.closed.write().unwrap_or_else(|e| e.into_inner());
        if *closed {
            anyhow::bail!("counter store already closed");
        }
        *closed = true;
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        info!(counters = counters.len(), "counter store flushed");
        Ok(())
    }
}

/// Periodically logs the counters; closing waits for the final report unless the
/// teardown is cancelled first.
pub struct Reporter {
    name: String,
}

impl Reporter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }

    pub fn report(&self, store: &CounterStore) {
        info!(reporter = %self.name, ticks = store.get("ticks"), "report");
    }
}

#[async_trait]
impl CloseWithContext for Reporter {
    async fn close(&self, token: &CancellationToken) -> anyhow::Result<()> {
        tokio::select! {
            _ = token.cancelled() => anyhow::bail!("reporter {} did not flush in time", self.name),
            _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {
                info!(reporter = %self.name, "final report sent");
                Ok(())
            }
        }
    }
}
