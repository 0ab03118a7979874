//! A single-use sandbox container and its lifecycle.
//!
//! [`Container::start`] launches the isolation runtime, waits for the
//! handshake marker on stdout, and returns a container whose stdin is
//! ready for the framed payload. [`Container::close`] tears it down; it is
//! idempotent and always terminates, escalating from interrupt to kill.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use stepbox_common::config::SandboxLimits;
use stepbox_common::constants::{CONTAINED_START_MESSAGE, CONTAINED_STDERR_HEADER};
use stepbox_common::types::ContainerName;
use thiserror::Error;
use tokio::process::ChildStdin;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::backend::ContainerBackend;
use crate::output::{OutputRouter, SharedBuffer, pump, strip_stderr_header};
use crate::process::{WaitError, wait_or_stop};
use crate::registry::WantedRegistry;

/// How long output pipes may keep draining after the process exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Most bytes of each stream included in a teardown log line.
const DIAGNOSTIC_LOG_LIMIT: usize = 4096;

/// The cached result of waiting on the container process.
pub type Completion = Result<(), WaitError>;

/// Failure to bring a container up to the handshake.
#[derive(Debug, Error)]
pub enum StartError {
    /// The isolation runtime could not be launched.
    #[error("launching container {name}: {source}")]
    Spawn {
        /// Container that failed to launch.
        name: ContainerName,
        /// Underlying spawn error.
        source: std::io::Error,
    },

    /// The handshake marker did not appear in time.
    #[error("timeout starting container {name}")]
    Timeout {
        /// Container that timed out.
        name: ContainerName,
    },

    /// The process ended before sending the handshake marker.
    #[error("container {name} exited before handshake: {reason}: {stderr}")]
    Exited {
        /// Container that exited.
        name: ContainerName,
        /// How the process ended.
        reason: String,
        /// Captured stderr, lossily decoded.
        stderr: String,
    },
}

enum Handshake {
    Ready,
    StdoutClosed,
    Exited(Completion),
    TimedOut,
}

/// A running sandbox container, used for exactly one run.
///
/// Owns the stdin of the contained process and the bounded capture of its
/// stdout (after the handshake) and stderr. A watcher task reaps the
/// process; its result is delivered once through a shared future and can
/// be re-read any number of times.
pub struct Container {
    name: ContainerName,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    cancel: CancellationToken,
    completion: Shared<BoxFuture<'static, Completion>>,
    registry: WantedRegistry,
    closed: AtomicBool,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Launches a container and waits for its handshake.
    ///
    /// The name is registered as wanted before launch. On any failure the
    /// partially started container is closed before returning.
    ///
    /// # Errors
    ///
    /// Returns [`StartError`] if the launch fails, the marker does not
    /// arrive within `limits.start_timeout`, or the process exits first.
    pub async fn start(
        backend: &dyn ContainerBackend,
        limits: &SandboxLimits,
        registry: &WantedRegistry,
    ) -> Result<Self, StartError> {
        let name = ContainerName::generate();
        registry.insert(&name);

        let mut cmd = backend.run_command(&name, limits);
        let _ = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                registry.remove(&name);
                return Err(StartError::Spawn { name, source });
            }
        };
        let pid = child.id();
        let stdin = child.stdin.take();
        tracing::debug!(name = %name, ?pid, "container process launched");

        let stdout = SharedBuffer::new(limits.stdout_capacity());
        let stderr = SharedBuffer::new(limits.max_output_size);
        let (ready_tx, ready_rx) = oneshot::channel();

        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            let mut router = OutputRouter::new(CONTAINED_START_MESSAGE, stdout.clone(), ready_tx);
            readers.push(tokio::spawn(pump(pipe, move |chunk| router.feed(chunk))));
        }
        if let Some(pipe) = child.stderr.take() {
            let sink = stderr.clone();
            readers.push(tokio::spawn(pump(pipe, move |chunk| {
                let _ = sink.write(chunk);
            })));
        }

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let grace = limits.stop_grace;
        let watcher = tokio::spawn(async move {
            let result = wait_or_stop(&mut child, stop.cancelled_owned(), grace).await;
            let drain = futures::future::join_all(readers.iter_mut());
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
                for reader in &readers {
                    reader.abort();
                }
            }
            result
        });
        let completion = watcher
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(WaitError::Io {
                        message: format!("watcher task failed: {e}"),
                    })
                })
            })
            .boxed()
            .shared();

        let container = Self {
            name,
            pid,
            stdin,
            stdout,
            stderr,
            cancel,
            completion: completion.clone(),
            registry: registry.clone(),
            closed: AtomicBool::new(false),
        };
        container.finish_start(ready_rx, completion, limits.start_timeout).await
    }

    async fn finish_start(
        self,
        ready: oneshot::Receiver<()>,
        completion: Shared<BoxFuture<'static, Completion>>,
        timeout: Duration,
    ) -> Result<Self, StartError> {
        let handshake = tokio::select! {
            biased;
            r = ready => if r.is_ok() { Handshake::Ready } else { Handshake::StdoutClosed },
            res = completion => Handshake::Exited(res),
            () = tokio::time::sleep(timeout) => Handshake::TimedOut,
        };

        let exited = match handshake {
            Handshake::Ready => {
                tracing::info!(name = %self.name, "started container");
                return Ok(self);
            }
            Handshake::TimedOut => None,
            Handshake::Exited(res) => Some(res),
            Handshake::StdoutClosed => {
                tracing::debug!(name = %self.name, "stdout closed before handshake");
                None
            }
        };

        self.close().await;
        let err = match exited {
            Some(res) => self.exited_error(&res),
            None => match self.try_completion() {
                Some(res) if !matches!(res, Err(WaitError::Stopped)) => self.exited_error(&res),
                _ => StartError::Timeout {
                    name: self.name.clone(),
                },
            },
        };
        Err(err)
    }

    fn exited_error(&self, res: &Completion) -> StartError {
        StartError::Exited {
            name: self.name.clone(),
            reason: res
                .as_ref()
                .err()
                .map_or_else(|| "exit status 0".to_owned(), ToString::to_string),
            stderr: String::from_utf8_lossy(&self.stderr.to_vec()).into_owned(),
        }
    }

    /// The container's unique name.
    #[must_use]
    pub const fn name(&self) -> &ContainerName {
        &self.name
    }

    /// Takes exclusive ownership of the container's stdin.
    ///
    /// Returns `None` after the first call. Dropping the handle closes the
    /// stream and signals end of input.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Waits for the container process to finish.
    ///
    /// The first caller observes the watcher's result; every later call
    /// returns the same cached value immediately.
    ///
    /// # Errors
    ///
    /// Returns the [`WaitError`] the watcher produced.
    pub async fn wait(&self) -> Completion {
        self.completion.clone().await
    }

    /// The completion result if the process has already been reaped.
    #[must_use]
    pub fn try_completion(&self) -> Option<Completion> {
        self.completion.peek().cloned()
    }

    /// Everything captured from stdout after the handshake marker.
    ///
    /// Complete only once [`Container::wait`] has returned.
    #[must_use]
    pub fn stdout(&self) -> Vec<u8> {
        self.stdout.to_vec()
    }

    /// Everything captured from stderr.
    #[must_use]
    pub fn stderr(&self) -> Vec<u8> {
        self.stderr.to_vec()
    }

    /// Whether either output stream exceeded its cap.
    #[must_use]
    pub fn output_overflowed(&self) -> bool {
        self.stdout.overflowed() || self.stderr.overflowed()
    }

    /// Whether [`Container::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Unregisters, stops, and reaps the container.
    ///
    /// Safe to call any number of times; only the first call logs
    /// diagnostics for an abnormal termination. Always returns once the
    /// stop grace period has elapsed and the process has been killed.
    pub async fn close(&self) {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.registry.remove(&self.name);
        self.cancel.cancel();
        let res = self.wait().await;
        if !first {
            return;
        }
        match res {
            Ok(()) => tracing::debug!(name = %self.name, "container closed"),
            Err(WaitError::Stopped) => tracing::debug!(name = %self.name, "container stopped"),
            Err(e) => {
                let stderr = self.stderr();
                let stdout = self.stdout();
                tracing::warn!(
                    name = %self.name,
                    error = %e,
                    stderr = %log_excerpt(strip_stderr_header(&stderr, CONTAINED_STDERR_HEADER)),
                    stdout = %log_excerpt(&stdout),
                    "container terminated abnormally"
                );
            }
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if !self.is_closed() {
            tracing::warn!(name = %self.name, "container dropped without close");
            self.registry.remove(&self.name);
            self.cancel.cancel();
        }
    }
}

fn log_excerpt(bytes: &[u8]) -> String {
    let end = bytes.len().min(DIAGNOSTIC_LOG_LIMIT);
    let mut text = String::from_utf8_lossy(&bytes[..end]).into_owned();
    if bytes.len() > end {
        text.push_str("...");
    }
    text
}
