//! Contained mode: the program that runs inside the isolation runtime.
//!
//! Announces readiness, reads the framed payload from stdin, runs the
//! binary under the step tracer, and streams the tracer's steps file back
//! on stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use stepbox_common::constants::{
    CONTAINED_BINARY_PATH, CONTAINED_START_MESSAGE, CONTAINED_STDERR_HEADER, DEFAULT_TRACER_PATH,
    RUN_TIMEOUT, RUN_TIMEOUT_MESSAGE, TRACER_DEADLINE_SLACK, TRACER_OUTPUT_DIR, TRACER_STEPS_FILE,
    TRACER_STOP_GRACE,
};
use stepbox_common::error::SandboxError;
use stepbox_runtime::process::{WaitError, wait_or_stop};
use stepbox_runtime::protocol;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// How long tracer output may keep draining after the tracer exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Fatal contained-mode failure.
#[derive(Debug, Error)]
pub enum ContainedError {
    /// A file or stream operation failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The payload on stdin could not be decoded.
    #[error(transparent)]
    Input(#[from] SandboxError),
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> ContainedError {
    let context = context.into();
    move |source| ContainedError::Io { context, source }
}

/// Paths and timing for contained mode.
#[derive(Debug, Clone)]
pub struct ContainedConfig {
    /// Where the received binary is written.
    pub binary_path: PathBuf,
    /// Step tracer executable.
    pub tracer: PathBuf,
    /// Directory the tracer runs in; it writes its steps below it.
    pub workdir: PathBuf,
    /// Run deadline of the parent; the tracer gets this minus `deadline_slack`.
    pub run_timeout: Duration,
    /// Head start left to the parent to collect output.
    pub deadline_slack: Duration,
    /// Grace period between interrupting and killing the tracer.
    pub stop_grace: Duration,
}

impl Default for ContainedConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from(CONTAINED_BINARY_PATH),
            tracer: PathBuf::from(DEFAULT_TRACER_PATH),
            workdir: PathBuf::from("."),
            run_timeout: RUN_TIMEOUT,
            deadline_slack: TRACER_DEADLINE_SLACK,
            stop_grace: TRACER_STOP_GRACE,
        }
    }
}

/// Runs one payload and returns the exit code this process should exit with.
///
/// # Errors
///
/// Returns [`ContainedError`] when the payload is malformed or a file
/// cannot be written or read. The caller treats every error as fatal.
pub async fn run_contained<R, O, E>(
    config: &ContainedConfig,
    stdin: &mut R,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<i32, ContainedError>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    stdout
        .write_all(CONTAINED_START_MESSAGE)
        .await
        .map_err(io_err("writing to stdout"))?;
    stdout.flush().await.map_err(io_err("flushing stdout"))?;

    let mut slurp = Vec::new();
    let _ = stdin
        .read_to_end(&mut slurp)
        .await
        .map_err(io_err("reading stdin in contained mode"))?;
    let payload = protocol::decode(&slurp)?;
    drop(slurp);

    write_executable(&config.binary_path, &payload.binary).await?;
    let source_path = Path::new(&payload.build_loc).join("main.go");
    tokio::fs::create_dir_all(&payload.build_loc)
        .await
        .map_err(io_err(format!("creating {}", payload.build_loc)))?;
    tokio::fs::write(&source_path, &payload.source_context)
        .await
        .map_err(io_err("writing contained main.go"))?;

    stderr
        .write_all(CONTAINED_STDERR_HEADER)
        .await
        .map_err(io_err("writing header to stderr"))?;

    let output_dir = config.workdir.join(TRACER_OUTPUT_DIR);
    tokio::fs::create_dir(&output_dir)
        .await
        .map_err(io_err("creating output directory"))?;

    let args = payload.meta.args.unwrap_or_default();
    let result = run_tracer(config, &args, stdout, stderr).await?;
    if matches!(result, Err(WaitError::Stopped)) {
        stderr
            .write_all(format!("{RUN_TIMEOUT_MESSAGE}\n").as_bytes())
            .await
            .map_err(io_err("writing to stderr"))?;
    }

    let steps_path = output_dir.join(TRACER_STEPS_FILE);
    let mut steps = tokio::fs::File::open(&steps_path)
        .await
        .map_err(io_err(format!("opening {}", steps_path.display())))?;
    let _ = tokio::io::copy(&mut steps, stdout)
        .await
        .map_err(io_err("streaming steps to stdout"))?;
    stdout.flush().await.map_err(io_err("flushing stdout"))?;
    stderr.flush().await.map_err(io_err("flushing stderr"))?;

    Ok(match result {
        Ok(()) => 0,
        Err(e) => e.exit_code().unwrap_or(1),
    })
}

#[cfg(unix)]
async fn write_executable(path: &Path, bytes: &[u8]) -> Result<(), ContainedError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, bytes)
        .await
        .map_err(io_err("writing contained binary"))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(io_err("making contained binary executable"))
}

#[cfg(not(unix))]
async fn write_executable(path: &Path, bytes: &[u8]) -> Result<(), ContainedError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(io_err("writing contained binary"))
}

/// Runs `<tracer> exec <binary> <args...>`, forwarding its output.
async fn run_tracer<O, E>(
    config: &ContainedConfig,
    args: &[String],
    stdout: &mut O,
    stderr: &mut E,
) -> Result<Result<(), WaitError>, ContainedError>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut cmd = Command::new(&config.tracer);
    let _ = cmd
        .arg("exec")
        .arg(&config.binary_path)
        .args(args)
        .current_dir(&config.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(io_err("starting step tracer"))?;
    let out_pipe = child.stdout.take();
    let err_pipe = child.stderr.take();

    let deadline = config.run_timeout.saturating_sub(config.deadline_slack);
    let exited = CancellationToken::new();
    let waited = async {
        let res = wait_or_stop(&mut child, tokio::time::sleep(deadline), config.stop_grace).await;
        exited.cancel();
        res
    };
    let drained = exited.clone();
    let forwarded = async move {
        let copies = async move {
            if let Some(mut pipe) = out_pipe {
                let _ = tokio::io::copy(&mut pipe, stdout).await;
            }
        };
        let copies_err = async move {
            if let Some(mut pipe) = err_pipe {
                let _ = tokio::io::copy(&mut pipe, stderr).await;
            }
        };
        let drain = async {
            drained.cancelled().await;
            tokio::time::sleep(OUTPUT_DRAIN_TIMEOUT).await;
        };
        tokio::select! {
            _ = async { tokio::join!(copies, copies_err) } => {}
            () = drain => tracing::debug!("tracer output still open after exit"),
        }
    };
    let (result, ()) = tokio::join!(waited, forwarded);
    if let Err(e) = &result {
        tracing::debug!(error = %e, "step tracer did not exit cleanly");
    }
    Ok(result)
}
