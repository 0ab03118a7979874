//! Command-line configuration.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use stepbox_common::config::SandboxLimits;
use stepbox_common::constants::{
    CONTAINED_BINARY_PATH, DEFAULT_OCI_RUNTIME, DEFAULT_SANDBOX_IMAGE, DEFAULT_TRACER_PATH,
};
use stepbox_common::error::{Result, SandboxError};

use crate::contained::ContainedConfig;
use crate::service::ServiceConfig;

/// Where this process sits in the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// HTTP server managing the container pool.
    Server,
    /// The program running inside the isolation runtime.
    Contained,
}

/// stepbox: runs untrusted binaries in gVisor containers.
#[derive(Parser, Debug)]
#[command(name = "stepbox", version, about, long_about = None)]
pub struct Cli {
    /// Run as the HTTP server or as the contained process.
    #[arg(long, value_enum, default_value_t = Mode::Server)]
    pub mode: Mode,

    /// HTTP listen address. Only used in server mode.
    #[arg(long, env = "STEPBOX_LISTEN", default_value = "0.0.0.0:80")]
    pub listen: SocketAddr,

    /// Number of containers kept warm and allowed to run concurrently.
    /// Defaults to the number of CPUs.
    #[arg(long, env = "STEPBOX_WORKERS")]
    pub workers: Option<usize>,

    /// Image hosting the untrusted binary.
    #[arg(long = "untrusted-container", default_value = DEFAULT_SANDBOX_IMAGE)]
    pub untrusted_container: String,

    /// Development mode: skip the image pull and log usage hints.
    #[arg(long)]
    pub dev: bool,

    /// Path to the docker executable. Looked up on `PATH` when unset.
    #[arg(long)]
    pub docker: Option<PathBuf>,

    /// OCI runtime used for sandbox containers.
    #[arg(long, default_value = DEFAULT_OCI_RUNTIME)]
    pub oci_runtime: String,

    /// Run containers as local shell scripts instead of docker. Provides no
    /// isolation; for local development only.
    #[arg(long, value_name = "SCRIPT")]
    pub local_script: Option<String>,

    /// Step tracer invoked in contained mode.
    #[arg(long, default_value = DEFAULT_TRACER_PATH)]
    pub tracer: PathBuf,
}

impl Cli {
    /// Worker count, falling back to the available parallelism.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
        })
    }

    /// Service configuration for server mode.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Config`] if the worker count is zero or a
    /// limit is unusable.
    pub fn service_config(&self) -> Result<ServiceConfig> {
        let workers = self.worker_count();
        if workers == 0 {
            return Err(SandboxError::Config {
                message: "workers must be greater than zero".into(),
            });
        }
        let limits = SandboxLimits::default();
        limits.validate()?;
        Ok(ServiceConfig {
            workers,
            dev: self.dev,
            limits,
        })
    }

    /// Configuration for contained mode.
    #[must_use]
    pub fn contained_config(&self) -> ContainedConfig {
        ContainedConfig {
            tracer: self.tracer.clone(),
            binary_path: PathBuf::from(CONTAINED_BINARY_PATH),
            ..ContainedConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["stepbox"]).unwrap();
        assert_eq!(cli.mode, Mode::Server);
        assert_eq!(cli.listen, "0.0.0.0:80".parse().unwrap());
        assert_eq!(cli.untrusted_container, DEFAULT_SANDBOX_IMAGE);
        assert_eq!(cli.oci_runtime, "runsc");
        assert!(!cli.dev);
        assert!(cli.worker_count() >= 1);
    }

    #[test]
    fn contained_mode_flag_as_passed_by_docker() {
        let cli = Cli::try_parse_from(["stepbox", "--mode=contained"]).unwrap();
        assert_eq!(cli.mode, Mode::Contained);
        assert_eq!(
            cli.contained_config().binary_path,
            PathBuf::from(CONTAINED_BINARY_PATH)
        );
    }

    #[test]
    fn zero_workers_rejected() {
        let cli = Cli::try_parse_from(["stepbox", "--workers", "0"]).unwrap();
        assert!(matches!(
            cli.service_config(),
            Err(SandboxError::Config { .. })
        ));
    }

    #[test]
    fn explicit_workers_used() {
        let cli = Cli::try_parse_from(["stepbox", "--workers", "3", "--dev"]).unwrap();
        let config = cli.service_config().unwrap();
        assert_eq!(config.workers, 3);
        assert!(config.dev);
    }
}
