//! Liveness probing and leak detection.

use std::sync::Arc;
use std::time::Duration;

use stepbox_common::config::SandboxLimits;
use stepbox_runtime::backend::ContainerBackend;
use stepbox_runtime::listing::{LeakReport, ListError, find_leaks};
use stepbox_runtime::pool::{ContainerPool, PoolError};
use stepbox_runtime::registry::WantedRegistry;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Why the service is unhealthy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthError {
    /// No container could be obtained in time.
    #[error("failed to get a sandbox container: {0}")]
    NoContainer(PoolError),

    /// The probe container did not shut down in time.
    #[error("timeout closing sandbox container")]
    CloseTimeout,
}

/// Handle used to ask every idle keep-alive connection to close.
#[derive(Debug, Clone)]
pub struct IdleConnections {
    tx: watch::Sender<u64>,
}

impl Default for IdleConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleConnections {
    /// Creates a handle with no connections subscribed.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    /// Receiver a connection watches for drop requests.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    /// Asks every connection with no request in flight to close.
    pub fn drop_idle(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

#[derive(Debug, Default)]
struct HealthState {
    last_check: Option<Instant>,
    last_result: Option<Result<(), HealthError>>,
}

/// Cached liveness probe.
///
/// A probe checks out one container and closes it straight away. Results
/// are cached so health polling does not starve the pool.
#[derive(Debug)]
pub struct HealthMonitor {
    state: Mutex<HealthState>,
    ttl: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    /// Creates a monitor using the cache TTL and probe deadline in `limits`.
    #[must_use]
    pub fn new(limits: &SandboxLimits) -> Self {
        Self {
            state: Mutex::new(HealthState::default()),
            ttl: limits.health_cache_ttl,
            probe_timeout: limits.health_probe_timeout,
        }
    }

    /// Returns the cached result, probing first if it is stale.
    ///
    /// On a healthy-to-unhealthy transition idle connections are dropped.
    /// Concurrent callers wait for the one probe in progress.
    ///
    /// # Errors
    ///
    /// Returns the [`HealthError`] of the latest probe.
    pub async fn check(
        &self,
        pool: &ContainerPool,
        idle: &IdleConnections,
    ) -> Result<(), HealthError> {
        let mut state = self.state.lock().await;
        if let (Some(at), Some(result)) = (state.last_check, &state.last_result) {
            if at.elapsed() < self.ttl {
                return result.clone();
            }
        }

        let result = self.probe(pool).await;
        let was_healthy = !matches!(state.last_result, Some(Err(_)));
        if was_healthy {
            if let Err(e) = &result {
                tracing::warn!(error = %e, "sandbox became unhealthy, dropping idle connections");
                idle.drop_idle();
            }
        }
        state.last_check = Some(Instant::now());
        state.last_result = Some(result.clone());
        result
    }

    async fn probe(&self, pool: &ContainerPool) -> Result<(), HealthError> {
        let deadline = Instant::now() + self.probe_timeout;
        let checkout = tokio::time::timeout_at(deadline, pool.acquire())
            .await
            .unwrap_or(Err(PoolError::Canceled))
            .map_err(HealthError::NoContainer)?;

        let closing = tokio::spawn(async move {
            checkout.close().await;
        });
        match tokio::time::timeout_at(deadline, closing).await {
            Ok(_) => Ok(()),
            Err(_) => Err(HealthError::CloseTimeout),
        }
    }
}

/// Periodically compares running containers with the wanted set.
///
/// Only reports; leaked containers are left alone.
pub struct LeakMonitor {
    backend: Arc<dyn ContainerBackend>,
    limits: SandboxLimits,
    registry: WantedRegistry,
}

impl LeakMonitor {
    /// Creates a monitor over `backend`'s containers.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        limits: SandboxLimits,
        registry: WantedRegistry,
    ) -> Self {
        Self {
            backend,
            limits,
            registry,
        }
    }

    /// Runs one reconciliation pass and logs the counts.
    ///
    /// # Errors
    ///
    /// Returns [`ListError`] if the containers cannot be listed.
    pub async fn check_once(&self) -> Result<LeakReport, ListError> {
        let report = find_leaks(self.backend.as_ref(), &self.limits, &self.registry).await?;
        tracing::info!(
            containers = report.total,
            unwanted = report.unwanted.len(),
            "container census"
        );
        if report.has_leaks() {
            tracing::warn!(names = ?report.unwanted, "unwanted sandbox containers running");
        }
        Ok(report)
    }

    /// Checks every `leak_check_interval` until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let period = self.limits.leak_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => break,
            }
            match self.check_once().await {
                Ok(_) => {}
                Err(ListError::Unsupported) => {
                    tracing::info!(backend = %self.backend.describe(), "backend cannot list containers, leak monitor disabled");
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "error counting sandbox containers"),
            }
        }
    }
}
