//! Docker backend running each container under gVisor.

use std::path::PathBuf;

use stepbox_common::config::SandboxLimits;
use stepbox_common::types::ContainerName;
use tokio::process::Command;

use super::{BackendError, ContainerBackend, run_checked};

/// Backend launching containers with `docker run`.
///
/// Every container gets no network, a memory cap, an executable tmpfs
/// scratch mount, the configured OCI runtime, and an attached stdin.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: PathBuf,
    image: String,
    oci_runtime: String,
}

impl DockerBackend {
    /// Creates a backend using an explicit docker executable.
    #[must_use]
    pub fn new(docker: PathBuf, image: impl Into<String>, oci_runtime: impl Into<String>) -> Self {
        Self {
            docker,
            image: image.into(),
            oci_runtime: oci_runtime.into(),
        }
    }

    /// Creates a backend using the `docker` found on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] if docker is not installed.
    pub fn locate(image: impl Into<String>, oci_runtime: impl Into<String>) -> Result<Self, BackendError> {
        let docker = which::which("docker").map_err(|source| BackendError::NotFound {
            program: "docker".into(),
            source,
        })?;
        Ok(Self::new(docker, image, oci_runtime))
    }

    /// The sandbox image this backend runs.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Arguments passed to `docker` to start container `name`.
    #[must_use]
    pub fn run_args(&self, name: &ContainerName, limits: &SandboxLimits) -> Vec<String> {
        vec![
            "run".into(),
            format!("--name={name}"),
            "--rm".into(),
            "--tmpfs=/tmpfs:exec".into(),
            "-i".into(),
            format!("--runtime={}", self.oci_runtime),
            "--network=none".into(),
            format!("--memory={}", limits.memory_limit_bytes),
            self.image.clone(),
            "--mode=contained".into(),
        ]
    }

    /// Arguments passed to `docker` to list containers by name prefix.
    #[must_use]
    pub fn list_args(prefix: &str) -> Vec<String> {
        vec![
            "ps".into(),
            "--filter".into(),
            format!("name={prefix}"),
            "--format".into(),
            "{{json .}}".into(),
        ]
    }

    /// Verifies the docker daemon is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if `docker version` fails.
    pub async fn check_daemon(&self) -> Result<(), BackendError> {
        let mut cmd = Command::new(&self.docker);
        let _ = cmd.arg("version");
        let _ = run_checked(cmd, "docker version").await?;
        Ok(())
    }

    /// Pulls the sandbox image.
    ///
    /// # Errors
    ///
    /// Returns an error if `docker pull` fails.
    pub async fn pull_image(&self) -> Result<(), BackendError> {
        let mut cmd = Command::new(&self.docker);
        let _ = cmd.args(["pull", &self.image]);
        let _ = run_checked(cmd, &format!("docker pull {}", self.image)).await?;
        tracing::info!(image = %self.image, "sandbox image pulled");
        Ok(())
    }
}

impl ContainerBackend for DockerBackend {
    fn run_command(&self, name: &ContainerName, limits: &SandboxLimits) -> Command {
        let mut cmd = Command::new(&self.docker);
        let _ = cmd.args(self.run_args(name, limits));
        cmd
    }

    fn list_command(&self, prefix: &str) -> Option<Command> {
        let mut cmd = Command::new(&self.docker);
        let _ = cmd.args(Self::list_args(prefix));
        Some(cmd)
    }

    fn describe(&self) -> String {
        format!("docker ({}, runtime {})", self.image, self.oci_runtime)
    }
}
