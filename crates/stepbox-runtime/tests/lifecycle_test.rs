//! Container lifecycle tests against the local shell backend.
//!
//! Every "container" is a `/bin/sh -c` script that prints the handshake
//! marker and then behaves like a contained process would.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use stepbox_common::config::SandboxLimits;
use stepbox_common::types::ProcessMeta;
use stepbox_runtime::backend::{ContainerBackend, ScriptBackend};
use stepbox_runtime::container::{Container, StartError};
use stepbox_runtime::listing::{ListError, find_leaks, list_containers};
use stepbox_runtime::pool::{ContainerPool, PoolConfig, PoolError};
use stepbox_runtime::process::WaitError;
use stepbox_runtime::protocol::WirePayload;
use stepbox_runtime::registry::WantedRegistry;
use tokio::io::AsyncWriteExt;

const MARKER: &str = r"printf 'golang-gvisor-process-started\n'";

fn limits() -> SandboxLimits {
    SandboxLimits {
        start_timeout: Duration::from_secs(5),
        run_timeout: Duration::from_secs(2),
        stop_grace: Duration::from_millis(100),
        start_retry_delay: Duration::from_millis(50),
        list_timeout: Duration::from_millis(500),
        ..SandboxLimits::default()
    }
}

fn backend(script: &str) -> ScriptBackend {
    ScriptBackend::new(script)
}

async fn start(script: &str, limits: &SandboxLimits) -> (Container, WantedRegistry) {
    let registry = WantedRegistry::new();
    let container = Container::start(&backend(script), limits, &registry)
        .await
        .expect("container should start");
    (container, registry)
}

// ── Handshake ────────────────────────────────────────────────────────

#[tokio::test]
async fn start_discards_noise_before_marker() {
    let script = format!("printf 'noise before'; {MARKER}; exec cat");
    let (mut container, registry) = start(&script, &limits()).await;
    assert!(registry.contains(container.name().as_str()));

    let mut stdin = container.take_stdin().unwrap();
    stdin.write_all(b"hello").await.unwrap();
    drop(stdin);

    assert_eq!(container.wait().await, Ok(()));
    assert_eq!(container.stdout(), b"hello");
    container.close().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn start_matches_marker_split_across_writes() {
    let script = "printf 'golang-gvisor-'; sleep 0.1; printf 'process-started\\nafter'; exec cat >/dev/null";
    let (mut container, _registry) = start(script, &limits()).await;
    drop(container.take_stdin());
    assert_eq!(container.wait().await, Ok(()));
    assert_eq!(container.stdout(), b"after");
    container.close().await;
}

#[tokio::test]
async fn start_times_out_without_marker() {
    let limits = SandboxLimits {
        start_timeout: Duration::from_millis(200),
        ..limits()
    };
    let registry = WantedRegistry::new();
    let began = Instant::now();
    let err = Container::start(&backend("exec sleep 5"), &limits, &registry)
        .await
        .unwrap_err();
    assert!(matches!(err, StartError::Timeout { .. }), "got {err}");
    assert!(began.elapsed() < Duration::from_secs(3));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn start_reports_exit_before_marker() {
    let registry = WantedRegistry::new();
    let err = Container::start(&backend("echo oops >&2; exit 3"), &limits(), &registry)
        .await
        .unwrap_err();
    match err {
        StartError::Exited { reason, stderr, .. } => {
            assert!(reason.contains("exit status 3"), "reason: {reason}");
            assert!(stderr.contains("oops"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(registry.is_empty());
}

// ── Running ──────────────────────────────────────────────────────────

#[tokio::test]
async fn framed_payload_reaches_the_process() {
    let (mut container, _registry) = start(&format!("{MARKER}; exec cat"), &limits()).await;
    let meta = ProcessMeta {
        args: Some(vec!["-v".into()]),
    };
    let payload = WirePayload {
        meta: &meta,
        build_loc: "/tmp/build",
        source_context: b"package main",
        binary: &[0x7f, b'E', b'L', b'F'],
    };

    let mut stdin = container.take_stdin().unwrap();
    payload.write_to(&mut stdin).await.unwrap();
    drop(stdin);

    assert_eq!(container.wait().await, Ok(()));
    assert_eq!(container.stdout(), payload.encode().unwrap());
    container.close().await;
}

#[tokio::test]
async fn exit_code_is_reported() {
    let script = format!("{MARKER}; cat >/dev/null; printf partial; exit 7");
    let (mut container, _registry) = start(&script, &limits()).await;
    drop(container.take_stdin());

    let err = container.wait().await.unwrap_err();
    assert_eq!(err.exit_code(), Some(7));
    assert_eq!(container.stdout(), b"partial");
    container.close().await;
}

#[tokio::test]
async fn completion_can_be_read_repeatedly() {
    let (mut container, _registry) = start(&format!("{MARKER}; exit 2"), &limits()).await;
    drop(container.take_stdin());
    let first = container.wait().await;
    let second = container.wait().await;
    assert_eq!(first, second);
    assert_eq!(container.try_completion(), Some(first));
    container.close().await;
}

#[tokio::test]
async fn output_overflow_is_flagged() {
    let limits = SandboxLimits {
        max_output_size: 16,
        ..limits()
    };
    let script = format!("{MARKER}; head -c 4096 /dev/zero; cat >/dev/null");
    let (mut container, _registry) = start(&script, &limits).await;
    drop(container.take_stdin());

    assert_eq!(container.wait().await, Ok(()));
    assert!(container.output_overflowed());
    assert!(container.stdout().len() <= limits.stdout_capacity());
    container.close().await;
}

// ── Teardown ─────────────────────────────────────────────────────────

#[tokio::test]
async fn close_is_idempotent_and_stops_the_process() {
    let (container, registry) = start(&format!("{MARKER}; exec cat"), &limits()).await;
    let began = Instant::now();
    container.close().await;
    container.close().await;

    assert!(container.is_closed());
    assert!(registry.is_empty());
    assert_eq!(container.wait().await, Err(WaitError::Stopped));
    assert!(began.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn close_kills_process_ignoring_interrupt() {
    let script = format!("trap '' INT; {MARKER}; while :; do sleep 0.05; done");
    let (container, _registry) = start(&script, &limits()).await;
    let began = Instant::now();
    container.close().await;
    assert_eq!(container.wait().await, Err(WaitError::Stopped));
    assert!(began.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn concurrent_close_calls_all_return() {
    let (container, _registry) = start(&format!("{MARKER}; exec cat"), &limits()).await;
    let container = Arc::new(container);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let c = Arc::clone(&container);
            tokio::spawn(async move { c.close().await })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }
    assert!(container.is_closed());
}

// ── Pool ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn pool_bounds_checkouts_by_worker_count() {
    let registry = WantedRegistry::new();
    let backend: Arc<dyn ContainerBackend> = Arc::new(backend(&format!("{MARKER}; exec cat")));
    let pool = ContainerPool::spawn(backend, registry.clone(), PoolConfig::new(2, limits()));

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(pool.checked_out(), 2);
    assert_ne!(first.name(), second.name());

    let third = pool.acquire_timeout(Duration::from_millis(300)).await;
    assert_eq!(third.unwrap_err(), PoolError::Canceled);

    first.close().await;
    drop(first);
    let third = pool.acquire_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(pool.checked_out(), 2);

    second.close().await;
    third.close().await;
    drop((second, third));
    pool.shutdown().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn pool_recovers_from_failed_starts() {
    let dir = tempfile::tempdir().unwrap();
    let flag = dir.path().join("started-once");
    let script = format!(
        "if [ -e {flag} ]; then {MARKER}; exec cat; else touch {flag}; exit 1; fi",
        flag = flag.display()
    );
    let registry = WantedRegistry::new();
    let backend: Arc<dyn ContainerBackend> = Arc::new(backend(&script));
    let pool = ContainerPool::spawn(backend, registry.clone(), PoolConfig::new(1, limits()));

    let checkout = pool.acquire_timeout(Duration::from_secs(5)).await.unwrap();
    checkout.close().await;
    drop(checkout);
    pool.shutdown().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn pool_shutdown_closes_unclaimed_containers() {
    let registry = WantedRegistry::new();
    let backend: Arc<dyn ContainerBackend> = Arc::new(backend(&format!("{MARKER}; exec cat")));
    let pool = ContainerPool::spawn(backend, registry.clone(), PoolConfig::new(2, limits()));

    // Let the workers fill the hand-off queue and block on it.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!registry.is_empty());

    pool.shutdown().await;
    assert!(registry.is_empty());
    assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
}

#[tokio::test]
async fn canceled_acquire_takes_nothing() {
    let registry = WantedRegistry::new();
    let backend: Arc<dyn ContainerBackend> = Arc::new(backend("exec sleep 30"));
    let pool = ContainerPool::spawn(backend, registry.clone(), PoolConfig::new(1, limits()));

    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();
    assert_eq!(pool.acquire_with(&cancel).await.unwrap_err(), PoolError::Canceled);
    assert_eq!(pool.checked_out(), 0);

    pool.shutdown().await;
    assert!(registry.is_empty());
}

// ── Listing ──────────────────────────────────────────────────────────

#[tokio::test]
async fn leaks_are_reported_from_listing() {
    let list = r#"printf '{"ID":"1","Image":"img","Names":"play_run_deadbeef"}\n\n{"ID":"2","Image":"img","Names":""}\n'"#;
    let backend = backend("exit 0").with_list_script(list);
    let report = find_leaks(&backend, &limits(), &WantedRegistry::new())
        .await
        .unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.unwanted, vec!["play_run_deadbeef".to_owned()]);
}

#[tokio::test]
async fn listing_receives_name_prefix() {
    let list = r#"printf '{"ID":"1","Image":"img","Names":"%s0000"}\n' "$STEPBOX_PREFIX""#;
    let backend = backend("exit 0").with_list_script(list);
    let listed = list_containers(&backend, &limits()).await.unwrap();
    assert_eq!(listed[0].names, "play_run_0000");
}

#[tokio::test]
async fn slow_listing_is_interrupted() {
    let backend = backend("exit 0").with_list_script("exec sleep 5");
    let began = Instant::now();
    let err = list_containers(&backend, &limits()).await.unwrap_err();
    assert!(matches!(err, ListError::Failed { source: WaitError::Stopped }));
    assert!(began.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn listing_unsupported_without_script() {
    let err = list_containers(&backend("exit 0"), &limits()).await.unwrap_err();
    assert!(matches!(err, ListError::Unsupported));
}
