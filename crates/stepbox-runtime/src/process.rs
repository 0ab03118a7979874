//! Escalating wait for child processes.
//!
//! [`wait_or_stop`] waits for a child to exit. If the stop signal fires
//! first the child is interrupted, and killed outright if it is still
//! alive after the grace period.

use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Child;

/// Why waiting on a process did not end in a clean exit.
///
/// `Clone` so a completion result can be cached and handed out repeatedly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The process ran to completion with a failure status.
    #[error("process exited abnormally ({})", describe_exit(.code, .signal))]
    Exited {
        /// Exit code, absent when the process was killed by a signal.
        code: Option<i32>,
        /// Terminating signal number, when known.
        signal: Option<i32>,
    },

    /// The process was stopped because the stop signal fired.
    #[error("process stopped on request")]
    Stopped,

    /// Waiting itself failed.
    #[error("waiting for process failed: {message}")]
    Io {
        /// Description of the underlying failure.
        message: String,
    },
}

impl WaitError {
    /// Numeric exit code for an abnormal exit; `-1` when the process was
    /// terminated by a signal. `None` for every other error.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code, .. } => Some(code.unwrap_or(-1)),
            Self::Stopped | Self::Io { .. } => None,
        }
    }
}

#[allow(clippy::ref_option)]
fn describe_exit(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("exit status {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".into(),
    }
}

/// Maps an exit status to the wait result: success is `Ok`.
///
/// # Errors
///
/// Returns [`WaitError::Exited`] for any non-success status.
pub fn classify_status(status: ExitStatus) -> Result<(), WaitError> {
    if status.success() {
        return Ok(());
    }
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;
    Err(WaitError::Exited {
        code: status.code(),
        signal,
    })
}

fn io_error(e: &std::io::Error) -> WaitError {
    WaitError::Io {
        message: e.to_string(),
    }
}

/// Waits for `child` to exit, stopping it when `stop` resolves first.
///
/// On stop the child is sent an interrupt; if it has not exited after
/// `grace` it is killed. A child stopped this way reports
/// [`WaitError::Stopped`] regardless of its exit status. A child that had
/// already exited when the stop fired reports its real status.
///
/// # Errors
///
/// Returns the classified exit status, [`WaitError::Stopped`], or
/// [`WaitError::Io`] when the wait syscall fails.
pub async fn wait_or_stop<S>(child: &mut Child, stop: S, grace: Duration) -> Result<(), WaitError>
where
    S: Future<Output = ()>,
{
    tokio::select! {
        biased;
        status = child.wait() => return status.map_err(|e| io_error(&e)).and_then(classify_status),
        () = stop => {}
    }

    match child.try_wait() {
        Ok(Some(status)) => return classify_status(status),
        Ok(None) => {}
        Err(e) => return Err(io_error(&e)),
    }

    if !interrupt(child) {
        let status = child.wait().await.map_err(|e| io_error(&e))?;
        return classify_status(status);
    }
    tracing::debug!(pid = ?child.id(), "sent interrupt");

    if grace.is_zero() || tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::debug!(pid = ?child.id(), "grace period elapsed, killing");
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "kill failed");
        }
        let _ = child.wait().await.map_err(|e| io_error(&e))?;
    }
    Err(WaitError::Stopped)
}

/// Sends SIGINT to the child. Returns `false` if the process is already gone.
#[cfg(unix)]
fn interrupt(child: &Child) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGINT) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::debug!(pid, error = %e, "interrupt failed");
            true
        }
    }
}

/// Without POSIX signals there is no gentle interrupt; kill right away.
#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> bool {
    child.start_kill().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sh")
    }

    #[tokio::test]
    async fn clean_exit_is_ok() {
        let mut child = sh("exit 0");
        let res = wait_or_stop(&mut child, std::future::pending(), Duration::from_millis(50)).await;
        assert_eq!(res, Ok(()));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code() {
        let mut child = sh("exit 7");
        let err = wait_or_stop(&mut child, std::future::pending(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(7));
    }

    #[tokio::test]
    async fn stop_interrupts_sleeping_child() {
        let mut child = sh("exec sleep 30");
        let stop = tokio::time::sleep(Duration::from_millis(50));
        let started = std::time::Instant::now();
        let err = wait_or_stop(&mut child, stop, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_when_interrupt_is_ignored() {
        let mut child = sh("trap '' INT; while :; do sleep 1; done");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stop = std::future::ready(());
        let started = std::time::Instant::now();
        let err = wait_or_stop(&mut child, stop, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Stopped);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn signal_exit_maps_to_minus_one() {
        let err = WaitError::Exited {
            code: None,
            signal: Some(9),
        };
        assert_eq!(err.exit_code(), Some(-1));
        assert!(err.to_string().contains("signal 9"));
        assert_eq!(WaitError::Stopped.exit_code(), None);
    }
}
