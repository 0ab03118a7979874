//! Local shell backend for development without docker.
//!
//! Runs the configured script with `sh -c` and no isolation at all. Never
//! use it for untrusted input.

use std::path::PathBuf;

use stepbox_common::config::SandboxLimits;
use stepbox_common::types::ContainerName;
use tokio::process::Command;

use super::ContainerBackend;

/// Backend that runs a shell script per container.
///
/// The container name is exported to the script as `STEPBOX_CONTAINER`.
#[derive(Debug, Clone)]
pub struct ScriptBackend {
    shell: PathBuf,
    script: String,
    list_script: Option<String>,
}

impl ScriptBackend {
    /// Creates a backend running `script` through `/bin/sh`.
    #[must_use]
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            script: script.into(),
            list_script: None,
        }
    }

    /// Sets a script whose stdout is used as the container listing.
    ///
    /// The prefix is exported as `STEPBOX_PREFIX`.
    #[must_use]
    pub fn with_list_script(mut self, script: impl Into<String>) -> Self {
        self.list_script = Some(script.into());
        self
    }

    fn command(&self, script: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        let _ = cmd.arg("-c").arg(script);
        cmd
    }
}

impl ContainerBackend for ScriptBackend {
    fn run_command(&self, name: &ContainerName, _limits: &SandboxLimits) -> Command {
        let mut cmd = self.command(&self.script);
        let _ = cmd.env("STEPBOX_CONTAINER", name.as_str());
        cmd
    }

    fn list_command(&self, prefix: &str) -> Option<Command> {
        let script = self.list_script.as_deref()?;
        let mut cmd = self.command(script);
        let _ = cmd.env("STEPBOX_PREFIX", prefix);
        Some(cmd)
    }

    fn describe(&self) -> String {
        format!("local script ({})", self.script)
    }
}
