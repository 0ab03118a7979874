//! Warm container pool.
//!
//! A fixed number of supply workers each start a container, hand it off
//! through a bounded queue, and start the next one. A checkout holds a
//! semaphore permit until it is dropped, so at most `workers` containers
//! are ever checked out at once.
//!
//! ```text
//! worker 1 ──┐
//! worker 2 ──┼──▶ [ hand-off queue ] ──▶ acquire() ──▶ Checkout (≤ W live)
//! worker W ──┘
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use stepbox_common::config::SandboxLimits;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backend::ContainerBackend;
use crate::container::Container;
use crate::registry::WantedRegistry;

/// Failure to obtain a container from the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The caller gave up before a container was handed over.
    #[error("canceled waiting for a container")]
    Canceled,

    /// The pool has been shut down.
    #[error("container pool is shut down")]
    Closed,
}

/// How supply workers back off after a failed start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay before the next start attempt.
    pub delay: Duration,
}

/// Configuration for the container pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of supply workers, and the checkout limit.
    pub workers: usize,
    /// Capacity of the hand-off queue.
    pub queue_capacity: usize,
    /// Backoff applied after a failed start.
    pub retry: RetryPolicy,
    /// Limits applied to every container.
    pub limits: SandboxLimits,
}

impl PoolConfig {
    /// Pool configuration with `workers` workers and the given limits.
    #[must_use]
    pub const fn new(workers: usize, limits: SandboxLimits) -> Self {
        let retry = RetryPolicy {
            delay: limits.start_retry_delay,
        };
        Self {
            workers,
            queue_capacity: 1,
            retry,
            limits,
        }
    }
}

/// A container checked out of the pool.
///
/// Dereferences to the [`Container`]. Releases its pool slot on drop; the
/// container must be closed before that.
#[derive(Debug)]
pub struct Checkout {
    container: Container,
    _permit: OwnedSemaphorePermit,
}

impl Deref for Checkout {
    type Target = Container;

    fn deref(&self) -> &Container {
        &self.container
    }
}

impl DerefMut for Checkout {
    fn deref_mut(&mut self) -> &mut Container {
        &mut self.container
    }
}

/// Supplies freshly started containers, one per checkout.
#[derive(Debug)]
pub struct ContainerPool {
    ready: Mutex<mpsc::Receiver<Container>>,
    checkouts: Arc<Semaphore>,
    workers: usize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ContainerPool {
    /// Starts `config.workers` supply workers and returns the pool.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(
        backend: Arc<dyn ContainerBackend>,
        registry: WantedRegistry,
        config: PoolConfig,
    ) -> Self {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        tracing::info!(workers, backend = %backend.describe(), "starting container pool");
        for worker in 0..workers {
            let supply = Supply {
                worker,
                backend: Arc::clone(&backend),
                registry: registry.clone(),
                limits: config.limits.clone(),
                retry: config.retry,
                tx: tx.clone(),
                shutdown: shutdown.clone(),
            };
            let _ = tasks.spawn(supply.run());
        }
        let _ = tasks.close();

        Self {
            ready: Mutex::new(rx),
            checkouts: Arc::new(Semaphore::new(workers)),
            workers,
            shutdown,
            tasks,
        }
    }

    /// Number of supply workers, which is also the checkout limit.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Number of containers currently checked out.
    #[must_use]
    pub fn checked_out(&self) -> usize {
        self.workers - self.checkouts.available_permits()
    }

    /// Waits for a ready container.
    ///
    /// Cancel-safe: dropping the future before it resolves never takes a
    /// container off the queue.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool has been shut down.
    pub async fn acquire(&self) -> Result<Checkout, PoolError> {
        let permit = Arc::clone(&self.checkouts)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        let mut ready = self.ready.lock().await;
        let container = ready.recv().await.ok_or(PoolError::Closed)?;
        drop(ready);
        tracing::debug!(name = %container.name(), "container checked out");
        Ok(Checkout {
            container,
            _permit: permit,
        })
    }

    /// Waits for a ready container until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Canceled`] if `cancel` fires first, or
    /// [`PoolError::Closed`] if the pool has been shut down.
    pub async fn acquire_with(&self, cancel: &CancellationToken) -> Result<Checkout, PoolError> {
        tokio::select! {
            res = self.acquire() => res,
            () = cancel.cancelled() => Err(PoolError::Canceled),
        }
    }

    /// Waits for a ready container for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Canceled`] on timeout, or
    /// [`PoolError::Closed`] if the pool has been shut down.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Checkout, PoolError> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .unwrap_or(Err(PoolError::Canceled))
    }

    /// Stops the supply workers and closes every container not yet
    /// checked out.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.checkouts.close();
        self.tasks.wait().await;

        let mut ready = self.ready.lock().await;
        ready.close();
        while let Ok(container) = ready.try_recv() {
            container.close().await;
        }
        tracing::info!("container pool stopped");
    }
}

/// One supply worker: start, hand off, repeat.
struct Supply {
    worker: usize,
    backend: Arc<dyn ContainerBackend>,
    registry: WantedRegistry,
    limits: SandboxLimits,
    retry: RetryPolicy,
    tx: mpsc::Sender<Container>,
    shutdown: CancellationToken,
}

impl Supply {
    async fn run(self) {
        let mut failures = 0u32;
        while !self.shutdown.is_cancelled() {
            tracing::debug!(worker = self.worker, "starting container");
            let started = tokio::select! {
                res = Container::start(self.backend.as_ref(), &self.limits, &self.registry) => res,
                () = self.shutdown.cancelled() => break,
            };

            let container = match started {
                Ok(container) => {
                    failures = 0;
                    container
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.retry.delay;
                    tracing::warn!(
                        worker = self.worker,
                        error = %e,
                        failures,
                        ?delay,
                        "error starting container"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => continue,
                        () = self.shutdown.cancelled() => break,
                    }
                }
            };

            let slot = tokio::select! {
                slot = self.tx.reserve() => slot.ok(),
                () = self.shutdown.cancelled() => None,
            };
            match slot {
                Some(slot) => slot.send(container),
                None => {
                    container.close().await;
                    break;
                }
            }
        }
        tracing::debug!(worker = self.worker, "supply worker stopped");
    }
}
