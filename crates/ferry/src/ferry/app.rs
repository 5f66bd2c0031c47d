use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::ferry::{
    api, config, logging, public, telemetry,
    tunnel::{
        acceptor::{Acceptor, AcceptorOptions},
        registry::ClientRegistry,
    },
};

pub async fn run(config_path: Option<PathBuf>, overrides: config::Overrides) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    cfg.apply_overrides(overrides)?;

    let _logging = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        api_addr = %cfg.api_addr,
        tunnel_addr = %cfg.tunnel_addr,
        domain = cfg.domain.as_deref().unwrap_or(""),
        max_sockets = cfg.max_sockets,
        grace = ?cfg.grace,
        "ferry: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let registry = Arc::new(ClientRegistry::new(cfg.max_sockets, cfg.grace));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    // Tunnel acceptance endpoint.
    {
        let acceptor = Acceptor::new(AcceptorOptions {
            listen_addr: cfg.tunnel_addr.clone(),
            handshake_timeout: cfg.timeouts.handshake_timeout,
            max_head_bytes: cfg.max_header_bytes,
            registry: registry.clone(),
        });
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { acceptor.listen_and_serve(shutdown).await });
    }

    // Public front: tunnel subdomains plus the API.
    {
        let api = api::router(api::ApiState {
            registry: registry.clone(),
            metrics: Some(prom.clone()),
        });
        let front = public::PublicFront::new(
            registry.clone(),
            cfg.domain.clone(),
            api,
            cfg.timeouts.handshake_timeout,
            cfg.max_header_bytes,
        );
        let listen_addr = cfg.api_addr.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { public::serve_with_shutdown(&listen_addr, front, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let mut outcome = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(err))) => outcome = Err(err),
                Some(Err(join_err)) => outcome = Err(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    // Pending acquirers fail and idle tunnel sockets are released.
    registry.close_all();

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
