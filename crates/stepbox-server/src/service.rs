//! The sandbox service: every piece of shared state, owned in one place.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::{Request, Response};
use stepbox_common::config::SandboxLimits;
use stepbox_runtime::backend::ContainerBackend;
use stepbox_runtime::pool::{ContainerPool, PoolConfig};
use stepbox_runtime::registry::WantedRegistry;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::health::{HealthError, HealthMonitor, IdleConnections, LeakMonitor};
use crate::http::{self, BoxError};

/// Settings for [`SandboxService::start`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Pool size, which also caps concurrent runs and pending body reads.
    pub workers: usize,
    /// Development mode: per-request timing logs.
    pub dev: bool,
    /// Timeouts and size caps.
    pub limits: SandboxLimits,
}

/// Owns the container pool, the wanted registry, the admission gate, and
/// the monitors. Constructed once and shared by every connection.
#[derive(Debug)]
pub struct SandboxService {
    pool: ContainerPool,
    registry: WantedRegistry,
    limits: SandboxLimits,
    admission: Semaphore,
    health: HealthMonitor,
    idle: IdleConnections,
    dev: bool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SandboxService {
    /// Starts the pool workers and the leak monitor.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(backend: Arc<dyn ContainerBackend>, config: ServiceConfig) -> Self {
        let registry = WantedRegistry::new();
        let pool = ContainerPool::spawn(
            Arc::clone(&backend),
            registry.clone(),
            PoolConfig::new(config.workers, config.limits.clone()),
        );
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let leaks = LeakMonitor::new(backend, config.limits.clone(), registry.clone());
        let _ = tasks.spawn(leaks.run(shutdown.child_token()));

        Self {
            pool,
            registry,
            health: HealthMonitor::new(&config.limits),
            admission: Semaphore::new(config.workers.max(1)),
            limits: config.limits,
            idle: IdleConnections::new(),
            dev: config.dev,
            shutdown,
            tasks,
        }
    }

    /// Routes one HTTP request.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        http::route(self, req).await
    }

    /// Waits for a free admission slot. `None` once shutting down.
    pub(crate) async fn admit(&self) -> Option<SemaphorePermit<'_>> {
        self.admission.acquire().await.ok()
    }

    /// Cached liveness check.
    ///
    /// # Errors
    ///
    /// Returns the [`HealthError`] of the latest probe.
    pub async fn check_health(&self) -> Result<(), HealthError> {
        self.health.check(&self.pool, &self.idle).await
    }

    /// The container pool.
    #[must_use]
    pub const fn pool(&self) -> &ContainerPool {
        &self.pool
    }

    /// Containers this service currently wants running.
    #[must_use]
    pub const fn registry(&self) -> &WantedRegistry {
        &self.registry
    }

    /// Timeouts and size caps in force.
    #[must_use]
    pub const fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Whether development mode is on.
    #[must_use]
    pub const fn is_dev(&self) -> bool {
        self.dev
    }

    /// Handle for dropping idle keep-alive connections.
    #[must_use]
    pub const fn idle_connections(&self) -> &IdleConnections {
        &self.idle
    }

    /// Tracker for background work that shutdown waits on.
    pub(crate) const fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Token cancelled when the service begins shutting down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops admitting requests, stops the monitors, and shuts the pool
    /// down. Returns once runs already holding a container have closed it.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down sandbox service");
        self.shutdown.cancel();
        self.admission.close();
        self.pool.shutdown().await;
        let _ = self.tasks.close();
        self.tasks.wait().await;
    }
}
