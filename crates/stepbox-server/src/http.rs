//! HTTP surface: routing, response helpers, and the accept loop.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::{Body, Incoming};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, X_CONTENT_TYPE_OPTIONS};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use stepbox_common::types::RunResponse;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::task::TaskTracker;

use crate::coordinator;
use crate::service::SandboxService;

/// Boxed error accepted from request bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Dispatches a request by path.
pub async fn route<B>(service: &SandboxService, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    match req.uri().path() {
        "/run" => coordinator::handle_run(service, req).await,
        "/health" => match service.check_health().await {
            Ok(()) => text_response(StatusCode::OK, "OK"),
            Err(e) => text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("health check failure: {e}"),
            ),
        },
        "/" => text_response(StatusCode::OK, "Hi from sandbox"),
        _ => text_response(StatusCode::NOT_FOUND, "404 page not found"),
    }
}

/// Plain-text response; a trailing newline is appended.
#[must_use]
pub fn text_response(status: StatusCode, text: &str) -> Response<Full<Bytes>> {
    let mut body = String::with_capacity(text.len() + 1);
    body.push_str(text);
    body.push('\n');
    let mut res = Response::new(Full::new(Bytes::from(body)));
    *res.status_mut() = status;
    let headers = res.headers_mut();
    let _ = headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    let _ = headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    res
}

/// Pretty-printed JSON run response with an explicit length.
#[must_use]
pub fn json_response(response: &RunResponse) -> Response<Full<Bytes>> {
    let body = match serde_json::to_vec_pretty(response) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "encoding run response");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "error encoding JSON");
        }
    };
    let len = body.len();
    let mut res = Response::new(Full::new(Bytes::from(body)));
    let headers = res.headers_mut();
    let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let _ = headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    res
}

/// Accepts connections until the service starts shutting down, then waits
/// for open connections to finish.
///
/// # Errors
///
/// Currently infallible; accept errors are logged and retried.
pub async fn serve(listener: TcpListener, service: Arc<SandboxService>) -> std::io::Result<()> {
    let shutdown = service.shutdown_token();
    let connections = TaskTracker::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = shutdown.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                let _ = connections.spawn(serve_connection(stream, peer, Arc::clone(&service)));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
    let _ = connections.close();
    connections.wait().await;
    tracing::info!("http server stopped");
    Ok(())
}

/// Counts a request as in flight for as long as it is alive.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        let _ = counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, service: Arc<SandboxService>) {
    tracing::debug!(%peer, "accepted connection");
    let in_flight = Arc::new(AtomicUsize::new(0));
    let handler = {
        let service = Arc::clone(&service);
        let in_flight = Arc::clone(&in_flight);
        service_fn(move |req: Request<Incoming>| {
            let service = Arc::clone(&service);
            let active = InFlight::enter(&in_flight);
            async move {
                let res = service.handle(req).await;
                drop(active);
                Ok::<_, Infallible>(res)
            }
        })
    };

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), handler);
    let mut conn = std::pin::pin!(conn);
    let mut idle = service.idle_connections().subscribe();
    let shutdown = service.shutdown_token();
    let mut closing = false;
    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    tracing::debug!(%peer, error = %e, "connection error");
                }
                break;
            }
            Ok(()) = idle.changed(), if !closing => {
                if in_flight.load(Ordering::Acquire) == 0 {
                    tracing::debug!(%peer, "dropping idle connection");
                    closing = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
            () = shutdown.cancelled(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
