//! The agent context: every component, constructed once at startup and
//! threaded explicitly into everything that needs a collaborator.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::channel::ChannelManager;
use crate::cluster::DynClusterBackend;
use crate::config::AppConfig;
use crate::credentials::CredentialStore;
use crate::executor::Executor;
use crate::router::Router;
use crate::state::SharedRegistry;
use crate::tunnel::StreamRegistry;

pub struct AgentContext {
    pub cfg: AppConfig,
    pub credentials: CredentialStore,
    pub registry: SharedRegistry,
    pub channels: ChannelManager,
    pub cluster: DynClusterBackend,
    pub http: reqwest::Client,
    pub router: Router,
    pub executor: Executor,
    pub tunnel_streams: StreamRegistry,
    /// Kicks the reconciler outside its regular tick.
    pub reconcile_wake: Notify,
}

pub type SharedContext = Arc<AgentContext>;

impl AgentContext {
    /// Freeze the context and late-bind the channel manager to it.
    pub fn into_shared(self) -> SharedContext {
        let ctx = Arc::new(self);
        ctx.channels.bind(Arc::downgrade(&ctx));
        ctx
    }
}
