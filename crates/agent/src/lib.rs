use std::sync::Arc;

pub mod admission;
pub mod channel;
pub mod cluster;
pub mod config;
pub mod context;
pub mod credentials;
pub mod executor;
pub mod handshake;
pub mod http;
pub mod peer_api;
pub mod persist;
pub mod quantity;
pub mod reconcile;
pub mod router;
pub mod state;
pub mod telemetry;
pub mod tunnel;

#[cfg(test)]
pub mod test_support;

/// Startup failure, split so the binary can map exit codes.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// The credential store (sensitive blob) cannot be read or written.
    #[error("credential store failure: {0}")]
    Credentials(#[source] anyhow::Error),
    /// Any other fatal startup problem.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Assemble the agent context from its stores and cluster backend. Shared by
/// the binary and the integration tests (which plug in memory stores and a
/// mock cluster).
pub async fn build_context(
    cfg: config::AppConfig,
    sensitive_store: persist::DynBlobStore,
    state_store: persist::DynBlobStore,
    cluster: cluster::DynClusterBackend,
) -> Result<context::SharedContext, BootError> {
    let sensitive = Arc::new(
        persist::BlobHandle::open(sensitive_store)
            .await
            .map_err(|err| BootError::Credentials(err.into()))?,
    );
    let state_handle = Arc::new(
        persist::BlobHandle::open(state_store)
            .await
            .map_err(|err| BootError::Other(err.into()))?,
    );

    let credentials = credentials::CredentialStore::open(&cfg.agent_name, sensitive.clone())
        .await
        .map_err(|err| BootError::Credentials(err.into()))?;
    let registry = state::Registry::restore(sensitive, state_handle).await;

    let request_timeout = cfg.request_timeout_secs;
    let ctx = context::AgentContext {
        cfg,
        credentials,
        registry,
        channels: channel::ChannelManager::new(request_timeout),
        cluster,
        http: reqwest::Client::new(),
        router: router::Router::standard(),
        executor: executor::Executor::default(),
        tunnel_streams: tunnel::StreamRegistry::default(),
        reconcile_wake: tokio::sync::Notify::new(),
    }
    .into_shared();
    Ok(ctx)
}
