use std::process::ExitCode;
use std::sync::Arc;

use agent::config::{AppConfig, Cli, Command, CREDENTIALS_SECRET, STATE_CONFIGMAP};
use agent::persist::{KubeConfigMapStore, KubeSecretStore};
use agent::{build_context, cluster, context::SharedContext, http, peer_api, reconcile, telemetry, BootError};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: agent::config::ServeArgs) -> ExitCode {
    let cfg = match AppConfig::resolve(args) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "invalid configuration");
            return ExitCode::from(1);
        }
    };
    telemetry::init_metrics_recorder();
    telemetry::set_log_level("INFO");

    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(err) => {
            error!(%err, "cannot reach the kubernetes API");
            return ExitCode::from(1);
        }
    };

    let sensitive_store = Arc::new(KubeSecretStore::new(
        client.clone(),
        &cfg.namespace,
        CREDENTIALS_SECRET,
    ));
    let state_store = Arc::new(KubeConfigMapStore::new(
        client.clone(),
        &cfg.namespace,
        STATE_CONFIGMAP,
    ));
    let backend = Arc::new(cluster::KubeBackend::new(client, &cfg.namespace));

    let ctx = match build_context(cfg, sensitive_store, state_store, backend).await {
        Ok(ctx) => ctx,
        Err(BootError::Credentials(err)) => {
            error!(%err, "credential store is unusable");
            return ExitCode::from(2);
        }
        Err(BootError::Other(err)) => {
            error!(%err, "startup failed");
            return ExitCode::from(1);
        }
    };

    {
        let settings = ctx.registry.settings().await;
        telemetry::set_log_level(&settings.log_level);
        info!(
            agent = %ctx.cfg.agent_name,
            self_url = %ctx.cfg.self_url,
            namespace = %ctx.cfg.namespace,
            fingerprint = %ctx.credentials.fingerprint(),
            peers = ctx.registry.peers().await.len(),
            submitted = ctx.registry.submitted().await.len(),
            "agent starting"
        );
    }

    let api_addr = format!("{}:{}", ctx.cfg.host, ctx.cfg.port);
    let peer_addr = format!("{}:{}", ctx.cfg.host, ctx.cfg.peer_port);
    let api_listener = match TcpListener::bind(&api_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr = %api_addr, "cannot bind dashboard port");
            return ExitCode::from(1);
        }
    };
    let peer_listener = match TcpListener::bind(&peer_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr = %peer_addr, "cannot bind peer port");
            return ExitCode::from(1);
        }
    };
    info!(api = %api_addr, peer = %peer_addr, "listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconcile_handle = {
        let ctx = ctx.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = reconcile::reconcile_loop(ctx, shutdown).await {
                error!(?err, "reconcile loop terminated with error");
            }
        })
    };

    // Both sides dial after a restart; newer-wins dedupe leaves one channel.
    reconcile::redial_persisted_peers(&ctx).await;

    let api_server = {
        let app = http::router(ctx.clone());
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = axum::serve(api_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await;
            if let Err(err) = result {
                error!(?err, "dashboard server exited with error");
            }
        })
    };
    let peer_server = {
        let app = peer_api::router(ctx.clone());
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = axum::serve(peer_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await;
            if let Err(err) = result {
                error!(?err, "peer server exited with error");
            }
        })
    };

    shutdown_signal().await;
    info!("shutdown signal received, stopping agent");
    let _ = shutdown_tx.send(true);

    goodbye_all(&ctx).await;

    let _ = reconcile_handle.await;
    let _ = api_server.await;
    let _ = peer_server.await;

    ExitCode::SUCCESS
}

/// Tell connected peers we are going away cleanly so they keep our record
/// but mark the channel down immediately.
async fn goodbye_all(ctx: &SharedContext) {
    let peers = ctx.registry.peers().await;
    for peer in &peers {
        if ctx.channels.is_connected(&peer.name) {
            ctx.channels.push_goodbye(&peer.name);
        }
    }
    // Give the goodbye frames a moment to drain before dropping the sockets.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    for peer in &peers {
        ctx.channels.close_peer(&peer.name);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
