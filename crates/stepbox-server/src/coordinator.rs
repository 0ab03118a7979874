//! Run coordinator: one request, one container.
//!
//! Admission, body decoding, container checkout, the stdin protocol, the
//! run deadline, and classification of the result. The container is
//! closed on every path, including when hyper drops the handler because
//! the client went away; the pool slot is only released after that close
//! has reaped the process.

use std::fmt;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode};
use stepbox_common::constants::{OUTPUT_TOO_LARGE_MESSAGE, RUN_TIMEOUT_MESSAGE};
use stepbox_common::types::{ProcessMeta, RunRequest, RunResponse};
use stepbox_runtime::container::{Completion, Container};
use stepbox_runtime::pool::{Checkout, PoolError};
use stepbox_runtime::process::WaitError;
use stepbox_runtime::protocol::{ProtocolError, WirePayload};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::http::{self, BoxError};
use crate::service::SandboxService;

/// Header carrying one extra argument for the binary; may repeat.
pub const ARGUMENT_HEADER: &str = "x-argument";

/// A run that produced no response body for the caller.
#[derive(Debug, Error)]
pub enum RunError {
    /// The run endpoint only accepts POST.
    #[error("expected a POST")]
    MethodNotAllowed,

    /// The body was too large or not a valid request.
    #[error("{message}")]
    Decode {
        /// Decoder or body-limit error text.
        message: String,
    },

    /// No container could be checked out.
    #[error("failed to get container")]
    NoContainer {
        /// Why the pool gave up.
        #[source]
        source: PoolError,
    },

    /// Writing the payload to the container failed.
    #[error("unknown error during docker run")]
    Protocol {
        /// Underlying write or encode error.
        #[source]
        source: ProtocolError,
    },

    /// The container ended in a way that is not a program exit.
    #[error("unknown error during docker run")]
    Internal {
        /// How waiting on the container failed.
        #[source]
        source: WaitError,
    },

    /// The task driving the container did not return.
    #[error("unknown error during docker run")]
    Task {
        /// Join failure of the run task.
        #[source]
        source: tokio::task::JoinError,
    },

    /// The client went away before the run finished.
    #[error("request abandoned")]
    Abandoned,
}

impl RunError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed => StatusCode::BAD_REQUEST,
            Self::Decode { .. }
            | Self::NoContainer { .. }
            | Self::Protocol { .. }
            | Self::Internal { .. }
            | Self::Task { .. }
            | Self::Abandoned => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Handles `/run`, turning the outcome into an HTTP response.
pub async fn handle_run<B>(service: &SandboxService, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    match execute(service, req).await {
        Ok(response) => http::json_response(&response),
        Err(e) => {
            match &e {
                RunError::MethodNotAllowed => {}
                RunError::Decode { message } => {
                    tracing::info!(error = %message, "failed to decode request");
                }
                RunError::NoContainer { source } => {
                    tracing::warn!(error = %source, "failed to get container");
                }
                RunError::Protocol { source } => {
                    tracing::warn!(error = %source, "failed to write payload to container");
                }
                RunError::Internal { source } => {
                    tracing::error!(error = %source, "unexpected container failure");
                }
                RunError::Task { source } => {
                    tracing::error!(error = %source, "run task failed");
                }
                RunError::Abandoned => {}
            }
            http::text_response(e.status(), &e.to_string())
        }
    }
}

/// Runs one request to completion.
///
/// # Errors
///
/// Returns [`RunError`] for outcomes that are not a program result. Run
/// timeouts and oversized output are program results and come back as
/// `Ok` with the error field set.
pub async fn execute<B>(service: &SandboxService, req: Request<B>) -> Result<RunResponse, RunError>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    let mut trace = RequestTrace::new(service.is_dev());
    trace.log(format_args!("/run"));

    if req.method() != Method::POST {
        return Err(RunError::MethodNotAllowed);
    }
    let header_args = argument_header(req.headers());

    let Some(_admitted) = service.admit().await else {
        return Err(RunError::NoContainer {
            source: PoolError::Closed,
        });
    };

    let limits = service.limits();
    let mut request = read_request(req.into_body(), limits.max_body_size).await?;
    trace.log(format_args!("read {} bytes", request.binary.len()));

    let checkout = service
        .pool()
        .acquire()
        .await
        .map_err(|source| RunError::NoContainer { source })?;
    trace.log(format_args!("got container {}", checkout.name()));

    let meta = ProcessMeta {
        args: header_args.or(request.args.take()),
    };
    let deadline = Instant::now() + limits.run_timeout;

    // The checkout lives on its own task so the close always runs to the
    // end and the pool slot is released only after the process is reaped.
    // Dropping this handler cancels `abandoned` and cuts the run short.
    let abandoned = CancellationToken::new();
    let _abandon_on_drop = abandoned.clone().drop_guard();
    let run = service.tasks().spawn(run_checkout(
        checkout,
        request,
        meta,
        deadline,
        abandoned,
        trace,
    ));
    run.await.map_err(|source| RunError::Task { source })?
}

/// How the run phase of a checkout ended.
enum Outcome {
    Finished(Result<Completion, ProtocolError>),
    TimedOut,
    Abandoned,
}

/// Drives one checked-out container and closes it on every path.
async fn run_checkout(
    mut checkout: Checkout,
    request: RunRequest,
    meta: ProcessMeta,
    deadline: Instant,
    abandoned: CancellationToken,
    mut trace: RequestTrace,
) -> Result<RunResponse, RunError> {
    let payload = WirePayload {
        meta: &meta,
        build_loc: &request.build_loc,
        source_context: &request.source_context,
        binary: &request.binary,
    };

    let outcome = tokio::select! {
        driven = tokio::time::timeout_at(deadline, drive(&mut checkout, &payload, &mut trace)) => {
            driven.map_or(Outcome::TimedOut, Outcome::Finished)
        }
        () = abandoned.cancelled() => Outcome::Abandoned,
    };
    trace.log(format_args!("leaving handler; about to close container"));
    checkout.close().await;

    match outcome {
        Outcome::TimedOut => {
            trace.log(format_args!("timeout"));
            Ok(RunResponse::error(RUN_TIMEOUT_MESSAGE))
        }
        Outcome::Abandoned => Err(RunError::Abandoned),
        Outcome::Finished(Err(source)) => Err(RunError::Protocol { source }),
        Outcome::Finished(Ok(completion)) => classify(&checkout, completion),
    }
}

/// Writes the payload, closes stdin, and waits for the process.
async fn drive(
    container: &mut Container,
    payload: &WirePayload<'_>,
    trace: &mut RequestTrace,
) -> Result<Completion, ProtocolError> {
    if let Some(mut stdin) = container.take_stdin() {
        payload.write_to(&mut stdin).await?;
    }
    trace.log(format_args!("wrote+closed"));
    Ok(container.wait().await)
}

/// Maps a finished container to the caller's response.
///
/// Overflow wins over everything: truncated output is never returned.
///
/// # Errors
///
/// Returns [`RunError::Internal`] for wait errors that are not an exit.
pub fn classify(container: &Container, completion: Completion) -> Result<RunResponse, RunError> {
    if container.output_overflowed() {
        return Ok(RunResponse::error(OUTPUT_TOO_LARGE_MESSAGE));
    }
    match completion {
        Ok(()) => Ok(RunResponse::completed(0, container.stdout())),
        Err(e) => match e.exit_code() {
            Some(code) => Ok(RunResponse::completed(code, container.stdout())),
            None => Err(RunError::Internal { source: e }),
        },
    }
}

/// Collects `X-Argument` values; `None` when the header is absent.
fn argument_header(headers: &HeaderMap) -> Option<Vec<String>> {
    let args: Vec<String> = headers
        .get_all(ARGUMENT_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_owned)
        .collect();
    (!args.is_empty()).then_some(args)
}

async fn read_request<B>(body: B, limit: usize) -> Result<RunRequest, RunError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let bytes = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|e| RunError::Decode {
            message: e.to_string(),
        })?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| RunError::Decode {
        message: e.to_string(),
    })
}

/// Development-mode timing log for a single request.
struct RequestTrace {
    enabled: bool,
    started: Instant,
    last: Instant,
}

impl RequestTrace {
    fn new(enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            enabled,
            started: now,
            last: now,
        }
    }

    fn log(&mut self, message: fmt::Arguments<'_>) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let total = now - self.started;
        let step = now - self.last;
        self.last = now;
        tracing::info!("+{total:.3?} +{step:.3?} {message}");
    }
}
