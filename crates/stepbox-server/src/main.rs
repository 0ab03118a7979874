//! # stepbox
//!
//! Sandbox server for untrusted binaries, and the program that runs inside
//! each sandbox container.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use stepbox_runtime::backend::{ContainerBackend, DockerBackend, ScriptBackend};
use stepbox_server::config::{Cli, Mode};
use stepbox_server::contained::run_contained;
use stepbox_server::http::serve;
use stepbox_server::service::SandboxService;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.mode {
        Mode::Contained => contained(&cli).await,
        Mode::Server => server(&cli).await,
    }
}

async fn contained(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.contained_config();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    match run_contained(&config, &mut stdin, &mut stdout, &mut stderr).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "contained run failed");
            std::process::exit(1)
        }
    }
}

async fn server(cli: &Cli) -> anyhow::Result<()> {
    tracing::info!("stepbox sandbox starting");
    let config = cli.service_config()?;
    let backend = backend(cli).await?;

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    let addr = listener.local_addr()?;
    if cli.dev {
        tracing::info!("running in dev mode; sandbox listening at http://{addr}/");
        tracing::info!(
            "run a binary with: curl -v -H 'X-Argument: arg1' --data-binary @request.json http://{addr}/run"
        );
    } else {
        tracing::info!(listen = %addr, "listening");
    }

    let service = Arc::new(SandboxService::start(backend, config));
    let stop = service.shutdown_token();
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, shutting down");
            stop.cancel();
        }
    });

    serve(listener, Arc::clone(&service)).await?;
    service.shutdown().await;
    Ok(())
}

async fn backend(cli: &Cli) -> anyhow::Result<Arc<dyn ContainerBackend>> {
    if let Some(script) = &cli.local_script {
        tracing::warn!(script = %script, "using local script backend; binaries run WITHOUT isolation");
        return Ok(Arc::new(ScriptBackend::new(script.clone())));
    }

    let docker = match &cli.docker {
        Some(path) => DockerBackend::new(path.clone(), &cli.untrusted_container, &cli.oci_runtime),
        None => DockerBackend::locate(&cli.untrusted_container, &cli.oci_runtime)?,
    };
    docker
        .check_daemon()
        .await
        .context("failed to connect to docker")?;
    if !cli.dev {
        docker
            .pull_image()
            .await
            .with_context(|| format!("error pulling {}", docker.image()))?;
    }
    Ok(Arc::new(docker))
}
