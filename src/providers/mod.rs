//! Concurrent data providers.
//!
//! Each provider owns at most one background worker. Workers share a single
//! cancellation token and select on tick-or-cancel, so shutdown latency is
//! bounded by the slowest in-flight HTTP call.

pub mod battery;
pub mod evcc;
pub mod load;
pub mod price;
pub mod pv;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::httpx::FetchError;

/// Latest value published by a provider. Writers replace the whole value;
/// readers clone it out, so a reader never observes a partial update.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for SnapshotCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> SnapshotCell<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn get(&self) -> T {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, value: T) {
        *self.inner.write().await = value;
    }
}

/// Most recent refresh failure, kept for the status surface. Refresh errors
/// never propagate; the provider degrades to its last good value.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderError {
    pub kind: &'static str,
    pub message: String,
    pub source: &'static str,
    pub config_entry: String,
    pub timestamp: DateTime<Utc>,
}

impl ProviderError {
    pub fn from_fetch(source: &'static str, config_entry: impl Into<String>, err: &FetchError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            source,
            config_entry: config_entry.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Owns the stop token and the handles of every spawned worker. Shutdown
/// cancels once and joins in reverse spawn order.
pub struct Supervisor {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        // A panicking worker raises the stop signal so the remaining workers
        // shut down in order instead of running headless.
        let mut guard = PanicGuard {
            name,
            token: self.token.clone(),
            armed: true,
        };
        self.handles.push((
            name,
            tokio::spawn(async move {
                future.await;
                guard.armed = false;
            }),
        ));
        info!(worker = name, "worker started");
    }

    pub async fn shutdown(mut self) {
        self.token.cancel();
        while let Some((name, handle)) = self.handles.pop() {
            match handle.await {
                Ok(()) => info!(worker = name, "worker stopped"),
                Err(e) => warn!(worker = name, error = %e, "worker join failed"),
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

struct PanicGuard {
    name: &'static str,
    token: CancellationToken,
    armed: bool,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if self.armed && std::thread::panicking() {
            warn!(worker = self.name, "worker panicked, raising stop signal");
            self.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn snapshot_swap_is_visible_to_readers() {
        let cell = SnapshotCell::new(1u32);
        let reader = cell.clone();
        cell.set(2).await;
        assert_eq!(reader.get().await, 2);
    }

    #[tokio::test]
    async fn supervisor_cancels_and_joins_workers() {
        let mut supervisor = Supervisor::new();
        let token = supervisor.token();
        let cell = SnapshotCell::new(false);
        let witness = cell.clone();
        supervisor.spawn("test", async move {
            token.cancelled().await;
            witness.set(true).await;
        });

        tokio::time::timeout(Duration::from_secs(1), supervisor.shutdown())
            .await
            .expect("shutdown must not hang");
        assert!(cell.get().await);
    }

    #[tokio::test]
    async fn worker_panic_raises_stop_signal() {
        let mut supervisor = Supervisor::new();
        let token = supervisor.token();
        supervisor.spawn("doomed", async {
            panic!("boom");
        });

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("panic must cancel the stop token");
        supervisor.shutdown().await;
    }
}
