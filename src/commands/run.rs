use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use edged::config::EdgedConfig;
use edged::daemon::{Daemon, DaemonCommand, Params, TreeSnapshot, WorkBarrier};
use edged::http_server::{HttpServer, HttpServerConfig};
use edged::workloads::build_default_tree;

pub(crate) async fn cmd_run(port: Option<u16>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => EdgedConfig::load_from(&path)?.with_env_overrides(),
        None => EdgedConfig::load()?,
    };
    if let Some(port) = port {
        config.http.port = port;
    }

    let termination = Arc::new(WorkBarrier::new());
    let root = build_default_tree(&config, Some(Arc::clone(&termination)))?;
    root.run(Params::new())?;

    let started = root.clone();
    let started = tokio::task::spawn_blocking(move || {
        started.submit_command(DaemonCommand::run(), Params::new())
    })
    .await?;
    if let Err(e) = started {
        stop(&root).await;
        return Err(e).context("Failed to start daemon tree");
    }

    tracing::info!(
        tree = %TreeSnapshot::capture(&root).outline(),
        "Daemon tree running"
    );

    let server = HttpServer::new(
        HttpServerConfig {
            port: config.http.port,
            host: config.http.host.clone(),
        },
        root.clone(),
    );
    let shutdown = async move {
        let _ = tokio::task::spawn_blocking(move || termination.wait()).await;
    };

    if let Err(e) = server.run(shutdown).await {
        stop(&root).await;
        return Err(e);
    }

    let joined = root.clone();
    tokio::task::spawn_blocking(move || joined.join()).await?;

    match root.last_error() {
        Some(error) => anyhow::bail!("Daemon tree stopped with an error: {}", error),
        None => {
            tracing::info!("Daemon tree ended");
            Ok(())
        }
    }
}

/// End the tree and wait for its run loops.
async fn stop(root: &Daemon) {
    let root = root.clone();
    let _ = tokio::task::spawn_blocking(move || {
        if let Err(e) = root.submit_command(DaemonCommand::end(), Params::new()) {
            tracing::warn!(error = %e, "Failed to end daemon tree");
        }
        root.join();
    })
    .await;
}
