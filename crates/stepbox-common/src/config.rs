//! Tunable limits for the sandbox runtime and the run coordinator.

use std::time::Duration;

use crate::constants;
use crate::error::{Result, SandboxError};

/// Timing and size limits applied to every container and run.
///
/// `Default` yields the production values from [`crate::constants`];
/// tests shrink them to keep runs fast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Maximum accepted request body, in bytes.
    pub max_body_size: usize,
    /// Maximum bytes captured per output stream.
    pub max_output_size: usize,
    /// Memory cap passed to the isolation runtime.
    pub memory_limit_bytes: u64,
    /// Ceiling for the handshake marker to appear.
    pub start_timeout: Duration,
    /// Deadline for a single run.
    pub run_timeout: Duration,
    /// Grace period between interrupt and kill.
    pub stop_grace: Duration,
    /// Delay before a failed start is retried.
    pub start_retry_delay: Duration,
    /// Time-to-live of a cached health result.
    pub health_cache_ttl: Duration,
    /// Deadline for one liveness probe.
    pub health_probe_timeout: Duration,
    /// Interval between leak reconciliation passes.
    pub leak_check_interval: Duration,
    /// Deadline for one external container listing.
    pub list_timeout: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_body_size: constants::MAX_BINARY_SIZE,
            max_output_size: constants::MAX_OUTPUT_SIZE,
            memory_limit_bytes: constants::MEMORY_LIMIT_BYTES,
            start_timeout: constants::START_TIMEOUT,
            run_timeout: constants::RUN_TIMEOUT,
            stop_grace: constants::STOP_GRACE,
            start_retry_delay: constants::START_RETRY_DELAY,
            health_cache_ttl: constants::HEALTH_CACHE_TTL,
            health_probe_timeout: constants::HEALTH_PROBE_TIMEOUT,
            leak_check_interval: constants::LEAK_CHECK_INTERVAL,
            list_timeout: constants::LIST_TIMEOUT,
        }
    }
}

impl SandboxLimits {
    /// Capacity of the stdout buffer: the output cap plus room for the
    /// handshake marker.
    #[must_use]
    pub const fn stdout_capacity(&self) -> usize {
        self.max_output_size + constants::CONTAINED_START_MESSAGE.len()
    }

    /// Checks that every limit is usable.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Config`] naming the first zero-valued limit.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("max_body_size", self.max_body_size == 0),
            ("max_output_size", self.max_output_size == 0),
            ("memory_limit_bytes", self.memory_limit_bytes == 0),
            ("start_timeout", self.start_timeout.is_zero()),
            ("run_timeout", self.run_timeout.is_zero()),
            ("leak_check_interval", self.leak_check_interval.is_zero()),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(SandboxError::Config {
                message: format!("{name} must be greater than zero"),
            });
        }
        Ok(())
    }
}
