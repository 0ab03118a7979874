//! Listing running sandbox containers and spotting leaks.
//!
//! A leak is a running container that carries the sandbox name prefix but
//! is not in the [`WantedRegistry`]. Detection only reports; nothing is
//! removed.

use std::process::Stdio;

use serde::Deserialize;
use stepbox_common::config::SandboxLimits;
use stepbox_common::constants::CONTAINER_NAME_PREFIX;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::backend::ContainerBackend;
use crate::process::{WaitError, wait_or_stop};
use crate::registry::WantedRegistry;

/// Failure to list containers.
#[derive(Debug, Error)]
pub enum ListError {
    /// The backend has no listing command.
    #[error("backend cannot list containers")]
    Unsupported,

    /// The listing command could not be launched or read.
    #[error("running container listing: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The listing command failed or did not finish in time.
    #[error("container listing failed: {source}")]
    Failed {
        /// How the command ended.
        source: WaitError,
    },

    /// A listing line was not a JSON container record.
    #[error("unparsable listing line {line}: {source}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// JSON decode error.
        source: serde_json::Error,
    },
}

/// One running container as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListedContainer {
    /// Backend container id.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Image the container runs.
    #[serde(rename = "Image", default)]
    pub image: String,
    /// Container name(s).
    #[serde(rename = "Names", default)]
    pub names: String,
}

/// Result of comparing the running containers with the wanted set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakReport {
    /// Number of listed containers.
    pub total: usize,
    /// Names of running containers nobody is tracking.
    pub unwanted: Vec<String>,
}

impl LeakReport {
    /// Whether any leaked container was found.
    #[must_use]
    pub fn has_leaks(&self) -> bool {
        !self.unwanted.is_empty()
    }
}

/// Parses newline-delimited JSON container records, skipping blank lines.
///
/// # Errors
///
/// Returns [`ListError::Parse`] for the first line that is not a record.
pub fn parse_listing(output: &[u8]) -> Result<Vec<ListedContainer>, ListError> {
    output
        .split(|&b| b == b'\n')
        .enumerate()
        .filter(|(_, line)| !line.trim_ascii().is_empty())
        .map(|(idx, line)| {
            serde_json::from_slice(line).map_err(|source| ListError::Parse {
                line: idx + 1,
                source,
            })
        })
        .collect()
}

/// Compares listed containers against the wanted set.
///
/// Records without a name are never reported.
#[must_use]
pub fn reconcile(listed: &[ListedContainer], wanted: &WantedRegistry) -> LeakReport {
    let unwanted = listed
        .iter()
        .map(|c| c.names.as_str())
        .filter(|name| !name.is_empty() && !wanted.contains(name))
        .map(str::to_owned)
        .collect();
    LeakReport {
        total: listed.len(),
        unwanted,
    }
}

/// Lists running containers whose name carries the sandbox prefix.
///
/// The listing command is interrupted after `limits.list_timeout`.
///
/// # Errors
///
/// Returns [`ListError`] if the command cannot run, fails, times out, or
/// prints something other than container records.
pub async fn list_containers(
    backend: &dyn ContainerBackend,
    limits: &SandboxLimits,
) -> Result<Vec<ListedContainer>, ListError> {
    let mut cmd = backend
        .list_command(CONTAINER_NAME_PREFIX)
        .ok_or(ListError::Unsupported)?;
    let _ = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let pipe = child.stdout.take();
    let mut stdout = Vec::new();
    let reader = async {
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut stdout).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (read, waited) = tokio::join!(
        reader,
        wait_or_stop(
            &mut child,
            tokio::time::sleep(limits.list_timeout),
            limits.stop_grace
        )
    );
    waited.map_err(|source| ListError::Failed { source })?;
    read?;
    parse_listing(&stdout)
}

/// Lists containers and reports the ones nobody is tracking.
///
/// # Errors
///
/// Returns [`ListError`] if the listing fails.
pub async fn find_leaks(
    backend: &dyn ContainerBackend,
    limits: &SandboxLimits,
    wanted: &WantedRegistry,
) -> Result<LeakReport, ListError> {
    let listed = list_containers(backend, limits).await?;
    Ok(reconcile(&listed, wanted))
}

#[cfg(test)]
mod tests {
    use stepbox_common::types::ContainerName;

    use super::*;

    fn listed(name: &str) -> ListedContainer {
        ListedContainer {
            id: "abc".into(),
            image: "img".into(),
            names: name.into(),
        }
    }

    #[test]
    fn parse_skips_blank_lines() {
        let out = b"{\"ID\":\"1\",\"Image\":\"a\",\"Names\":\"play_run_1\",\"State\":\"running\"}\n\n  \n{\"ID\":\"2\",\"Image\":\"b\",\"Names\":\"play_run_2\"}\n";
        let parsed = parse_listing(out).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "1");
        assert_eq!(parsed[1].names, "play_run_2");
    }

    #[test]
    fn parse_reports_line_number() {
        let err = parse_listing(b"{\"ID\":\"1\"}\nnot json\n").unwrap_err();
        assert!(matches!(err, ListError::Parse { line: 2, .. }));
    }

    #[test]
    fn parse_empty_output() {
        assert!(parse_listing(b"").unwrap().is_empty());
    }

    #[test]
    fn reconcile_flags_unwanted_only() {
        let wanted = WantedRegistry::new();
        wanted.insert(&ContainerName::new("play_run_aaaaaaaa"));
        let report = reconcile(
            &[listed("play_run_aaaaaaaa"), listed("play_run_bbbbbbbb"), listed("")],
            &wanted,
        );
        assert_eq!(report.total, 3);
        assert_eq!(report.unwanted, vec!["play_run_bbbbbbbb".to_owned()]);
        assert!(report.has_leaks());
    }

    #[test]
    fn reconcile_empty_names_never_leak() {
        let report = reconcile(&[listed(""), listed("")], &WantedRegistry::new());
        assert!(!report.has_leaks());
    }
}
