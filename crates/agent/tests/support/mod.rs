//! Two-agent test harness: real listeners on loopback, memory blob stores,
//! and a cluster fake that makes every applied Deployment ready at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;

use agent::cluster::{
    deployment_name, ClusterBackend, ClusterError, DeploymentState, DynClusterBackend,
};
use agent::config::AppConfig;
use agent::context::SharedContext;
use agent::persist::MemoryBlobStore;
use agent::{build_context, http, peer_api};
use common::api::{LogLine, PodDetail, RemoteApp};

#[derive(Default)]
pub struct MockCluster {
    pub deployments: Mutex<HashMap<String, DeploymentState>>,
    pub applied: Mutex<Vec<RemoteApp>>,
    pub pod_ips: Mutex<HashMap<String, Vec<String>>>,
    pub logs: Mutex<HashMap<String, Vec<LogLine>>>,
}

impl MockCluster {
    fn ready_state(app: &RemoteApp) -> DeploymentState {
        let name = deployment_name(&app.id, &app.name);
        DeploymentState {
            app_id: app.id.clone(),
            source_peer: app.source_peer.clone(),
            name: name.clone(),
            desired: app.spec.replicas,
            ready: app.spec.replicas,
            available: app.spec.replicas,
            updated: app.spec.replicas,
            generation_observed: true,
            pod_problem: None,
            pods: (0..app.spec.replicas)
                .map(|i| PodDetail {
                    name: format!("{name}-{i}"),
                    phase: "Running".into(),
                    ready: true,
                    restarts: 0,
                    node: Some("node-1".into()),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ClusterBackend for MockCluster {
    async fn apply_deployment(&self, app: &RemoteApp) -> Result<(), ClusterError> {
        self.applied.lock().unwrap().push(app.clone());
        self.deployments
            .lock()
            .unwrap()
            .insert(app.id.clone(), Self::ready_state(app));
        Ok(())
    }

    async fn delete_deployment(&self, app_id: &str) -> Result<(), ClusterError> {
        self.deployments.lock().unwrap().remove(app_id);
        Ok(())
    }

    async fn scale_deployment(&self, app_id: &str, replicas: u32) -> Result<(), ClusterError> {
        let mut deployments = self.deployments.lock().unwrap();
        let Some(state) = deployments.get_mut(app_id) else {
            return Err(ClusterError::Rejected(anyhow::anyhow!("no deployment")));
        };
        state.desired = replicas;
        state.ready = replicas;
        state.available = replicas;
        Ok(())
    }

    async fn deployment_state(
        &self,
        app_id: &str,
    ) -> Result<Option<DeploymentState>, ClusterError> {
        Ok(self.deployments.lock().unwrap().get(app_id).cloned())
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentState>, ClusterError> {
        Ok(self.deployments.lock().unwrap().values().cloned().collect())
    }

    async fn pod_logs(&self, app_id: &str, _tail: u32) -> Result<Vec<LogLine>, ClusterError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .get(app_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn ready_pod_ips(&self, app_id: &str) -> Result<Vec<String>, ClusterError> {
        Ok(self
            .pod_ips
            .lock()
            .unwrap()
            .get(app_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct TestAgent {
    pub ctx: SharedContext,
    pub cluster: Arc<MockCluster>,
    pub api_url: String,
    pub peer_url: String,
}

/// Boot an agent with both listeners on ephemeral loopback ports.
pub async fn spawn_agent(agent_name: &str) -> TestAgent {
    let api_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind api");
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
    let api_port = api_listener.local_addr().expect("api addr").port();
    let peer_port = peer_listener.local_addr().expect("peer addr").port();

    let cfg = AppConfig {
        agent_name: agent_name.to_string(),
        self_url: format!("http://127.0.0.1:{peer_port}"),
        host: "127.0.0.1".into(),
        port: api_port,
        peer_port,
        namespace: "porpulsion".into(),
        handshake_timeout_secs: 5,
        request_timeout_secs: 5,
        reconcile_interval_secs: 1,
    };

    let cluster = Arc::new(MockCluster::default());
    let ctx = build_context(
        cfg,
        MemoryBlobStore::shared(),
        MemoryBlobStore::shared(),
        cluster.clone() as DynClusterBackend,
    )
    .await
    .expect("context");

    tokio::spawn({
        let app = http::router(ctx.clone());
        async move {
            axum::serve(api_listener, app).await.expect("api server");
        }
    });
    tokio::spawn({
        let app = peer_api::router(ctx.clone());
        async move {
            axum::serve(peer_listener, app).await.expect("peer server");
        }
    });

    TestAgent {
        ctx,
        cluster,
        api_url: format!("http://127.0.0.1:{api_port}"),
        peer_url: format!("http://127.0.0.1:{peer_port}"),
    }
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_until<F, Fut>(what: &str, deadline: Duration, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Complete a handshake from `a` to `b` and wait for the channel.
pub async fn peer_agents(client: &reqwest::Client, a: &TestAgent, b: &TestAgent) {
    let token = b.ctx.credentials.current_invite_token().await;
    let fingerprint = b.ctx.credentials.fingerprint().to_string();

    let response = client
        .post(format!("{}/api/peers/connect", a.api_url))
        .json(&serde_json::json!({
            "name": "b",
            "url": b.peer_url,
            "invite_token": token,
            "expected_fingerprint": fingerprint,
        }))
        .send()
        .await
        .expect("connect request");
    assert!(
        response.status().is_success(),
        "handshake failed: {}",
        response.text().await.unwrap_or_default()
    );

    let a_ctx = a.ctx.clone();
    wait_until("channel a->b", Duration::from_secs(5), || {
        let ctx = a_ctx.clone();
        async move { ctx.channels.is_connected("b") }
    })
    .await;

    let b_ctx = b.ctx.clone();
    let a_name = a.ctx.cfg.agent_name.clone();
    wait_until("channel b->a", Duration::from_secs(5), || {
        let ctx = b_ctx.clone();
        let name = a_name.clone();
        async move { ctx.channels.is_connected(&name) }
    })
    .await;
}
