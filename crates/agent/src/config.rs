use clap::{Args, Parser, Subcommand};

/// Label identifying Deployments managed by this agent.
pub const REMOTE_APP_ID_LABEL: &str = "porpulsion.io/remote-app-id";
/// Label recording which peer submitted a managed Deployment.
pub const SOURCE_PEER_LABEL: &str = "porpulsion.io/source-peer";

/// Name of the Secret holding keypairs, the invite token and peer CAs.
pub const CREDENTIALS_SECRET: &str = "porpulsion-credentials";
/// Name of the ConfigMap holding apps, approvals, settings and notifications.
pub const STATE_CONFIGMAP: &str = "porpulsion-state";

#[derive(Debug, Parser)]
#[command(name = "porpulsion", about = "peer-to-peer Kubernetes connector agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent.
    Serve(ServeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Name this agent announces to peers.
    #[arg(long, env = "AGENT_NAME", default_value = "porpulsion-agent")]
    pub agent_name: String,

    /// Externally reachable base URL of this agent's peer surface.
    #[arg(long, env = "SELF_URL")]
    pub self_url: Option<String>,

    /// Bind address for both listeners.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Dashboard API port.
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Peer-facing port (handshake + WebSocket upgrades).
    #[arg(long, env = "PEER_PORT", default_value_t = 8001)]
    pub peer_port: u16,

    /// Kubernetes namespace the agent deploys into and persists under.
    #[arg(long, env = "NAMESPACE")]
    pub namespace: Option<String>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub agent_name: String,
    pub self_url: String,
    pub host: String,
    pub port: u16,
    pub peer_port: u16,
    pub namespace: String,
    /// Whole-handshake deadline.
    pub handshake_timeout_secs: u64,
    /// Default channel request deadline.
    pub request_timeout_secs: u64,
    /// Reconciler sweep interval.
    pub reconcile_interval_secs: u64,
}

impl AppConfig {
    /// Resolve CLI flags and orchestrator-injected env into a config.
    ///
    /// `SELF_URL` falls back to `POD_IP` (injected via the downward API) so an
    /// in-cluster agent comes up without explicit configuration; the fallback
    /// is only reachable inside the cluster, which `resolve` logs loudly.
    pub fn resolve(args: ServeArgs) -> anyhow::Result<Self> {
        let namespace = args
            .namespace
            .or_else(|| std::env::var("POD_NAMESPACE").ok())
            .unwrap_or_else(|| "porpulsion".to_string());
        if namespace.trim().is_empty() {
            anyhow::bail!("namespace must not be empty");
        }

        let self_url = match args.self_url {
            Some(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            _ => {
                let host = std::env::var("POD_IP").unwrap_or_else(|_| "127.0.0.1".to_string());
                let url = format!("http://{}:{}", host, args.peer_port);
                tracing::warn!(
                    %url,
                    "SELF_URL not set; auto-detected a pod-internal address. Peering across \
                     clusters needs an externally reachable URL"
                );
                url
            }
        };

        if args.agent_name.trim().is_empty() {
            anyhow::bail!("agent name must not be empty");
        }
        if args.port == args.peer_port {
            anyhow::bail!("--port and --peer-port must differ");
        }

        Ok(Self {
            agent_name: args.agent_name,
            self_url,
            host: args.host,
            port: args.port,
            peer_port: args.peer_port,
            namespace,
            handshake_timeout_secs: 15,
            request_timeout_secs: 30,
            reconcile_interval_secs: 5,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> ServeArgs {
        ServeArgs {
            agent_name: "agent-a".into(),
            self_url: Some("https://a.example/".into()),
            host: "0.0.0.0".into(),
            port: 8000,
            peer_port: 8001,
            namespace: Some("porpulsion".into()),
        }
    }

    #[test]
    fn resolve_trims_trailing_slash() {
        let cfg = AppConfig::resolve(base_args()).expect("resolves");
        assert_eq!(cfg.self_url, "https://a.example");
    }

    #[test]
    fn resolve_rejects_equal_ports() {
        let mut args = base_args();
        args.peer_port = args.port;
        assert!(AppConfig::resolve(args).is_err());
    }

    #[test]
    fn resolve_rejects_empty_agent_name() {
        let mut args = base_args();
        args.agent_name = "  ".into();
        assert!(AppConfig::resolve(args).is_err());
    }
}
