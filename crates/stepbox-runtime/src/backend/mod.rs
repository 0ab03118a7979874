//! Isolation runtime abstraction.
//!
//! A backend only knows how to build the commands that launch and list
//! sandbox containers; process supervision lives in [`crate::container`].

pub mod docker;
pub mod script;

use std::process::Stdio;

use stepbox_common::config::SandboxLimits;
use stepbox_common::types::ContainerName;
use thiserror::Error;
use tokio::process::Command;

pub use docker::DockerBackend;
pub use script::ScriptBackend;

/// Failure of a backend management command.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The runtime executable could not be located.
    #[error("{program} not found: {source}")]
    NotFound {
        /// Executable that was searched for.
        program: String,
        /// Lookup failure.
        source: which::Error,
    },

    /// A management command could not be run.
    #[error("running {command}: {source}")]
    Io {
        /// Command line that failed to start.
        command: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A management command exited unsuccessfully.
    #[error("{command} failed: {output}")]
    CommandFailed {
        /// Command line that failed.
        command: String,
        /// Combined stdout and stderr of the command.
        output: String,
    },
}

/// Platform-agnostic container backend.
///
/// Implementors produce ready-to-spawn commands; the caller wires up
/// stdio and supervises the resulting process.
pub trait ContainerBackend: Send + Sync {
    /// Command that launches one sandbox container named `name`.
    ///
    /// The process must print the handshake marker on stdout once ready,
    /// then consume the framed payload from stdin.
    fn run_command(&self, name: &ContainerName, limits: &SandboxLimits) -> Command;

    /// Command listing running containers whose name starts with `prefix`,
    /// as one JSON object per line. `None` if the backend cannot list.
    fn list_command(&self, prefix: &str) -> Option<Command>;

    /// Short description used in logs.
    fn describe(&self) -> String;
}

/// Runs a management command to completion, failing on non-zero exit.
pub(crate) async fn run_checked(mut command: Command, display: &str) -> Result<String, BackendError> {
    let output = command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| BackendError::Io {
            command: display.to_owned(),
            source,
        })?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(BackendError::CommandFailed {
            command: display.to_owned(),
            output: combined,
        });
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_checked_returns_output() {
        let mut cmd = Command::new("sh");
        let _ = cmd.args(["-c", "echo out; echo err >&2"]);
        let out = run_checked(cmd, "sh").await.unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn run_checked_reports_failure() {
        let mut cmd = Command::new("sh");
        let _ = cmd.args(["-c", "echo boom >&2; exit 1"]);
        let err = run_checked(cmd, "sh -c").await.unwrap_err();
        assert!(matches!(err, BackendError::CommandFailed { ref output, .. } if output.contains("boom")));
    }
}
