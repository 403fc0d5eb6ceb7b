//! Shared fakes for unit tests: an in-memory cluster backend and a context
//! builder wired to memory blob stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use common::api::{LogLine, PodDetail, RemoteApp};

use crate::cluster::{
    deployment_name, ClusterBackend, ClusterError, DeploymentState, DynClusterBackend,
};
use crate::config::AppConfig;
use crate::context::SharedContext;
use crate::persist::MemoryBlobStore;

/// Cluster fake: applying a deployment makes it Ready immediately unless a
/// test flips `hold_rollouts`.
#[derive(Default)]
pub struct MockCluster {
    pub deployments: Mutex<HashMap<String, DeploymentState>>,
    pub applied: Mutex<Vec<RemoteApp>>,
    pub deleted: Mutex<Vec<String>>,
    pub pod_ips: Mutex<HashMap<String, Vec<String>>>,
    pub logs: Mutex<HashMap<String, Vec<LogLine>>>,
    pub fail_transient: AtomicBool,
    pub hold_rollouts: AtomicBool,
}

impl MockCluster {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_state(&self, state: DeploymentState) {
        self.deployments
            .lock()
            .expect("deployments poisoned")
            .insert(state.app_id.clone(), state);
    }

    pub fn ready_state(app_id: &str, app_name: &str, source_peer: &str, replicas: u32) -> DeploymentState {
        DeploymentState {
            app_id: app_id.to_string(),
            source_peer: Some(source_peer.to_string()),
            name: deployment_name(app_id, app_name),
            desired: replicas,
            ready: replicas,
            available: replicas,
            updated: replicas,
            generation_observed: true,
            pod_problem: None,
            pods: (0..replicas)
                .map(|i| PodDetail {
                    name: format!("{}-{i}", deployment_name(app_id, app_name)),
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
        if self.fail_transient.swap(false, Ordering::SeqCst) {
            return Err(ClusterError::Unavailable(anyhow::anyhow!("mock outage")));
        }
        self.applied
            .lock()
            .expect("applied poisoned")
            .push(app.clone());
        let mut state = Self::ready_state(
            &app.id,
            &app.name,
            app.source_peer.as_deref().unwrap_or(""),
            app.spec.replicas,
        );
        if self.hold_rollouts.load(Ordering::SeqCst) {
            state.ready = 0;
            state.available = 0;
            for pod in &mut state.pods {
                pod.ready = false;
            }
        }
        self.insert_state(state);
        Ok(())
    }

    async fn delete_deployment(&self, app_id: &str) -> Result<(), ClusterError> {
        self.deleted
            .lock()
            .expect("deleted poisoned")
            .push(app_id.to_string());
        self.deployments
            .lock()
            .expect("deployments poisoned")
            .remove(app_id);
        Ok(())
    }

    async fn scale_deployment(&self, app_id: &str, replicas: u32) -> Result<(), ClusterError> {
        let mut deployments = self.deployments.lock().expect("deployments poisoned");
        let Some(state) = deployments.get_mut(app_id) else {
            return Err(ClusterError::Rejected(anyhow::anyhow!(
                "no deployment for app {app_id}"
            )));
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
        Ok(self
            .deployments
            .lock()
            .expect("deployments poisoned")
            .get(app_id)
            .cloned())
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentState>, ClusterError> {
        Ok(self
            .deployments
            .lock()
            .expect("deployments poisoned")
            .values()
            .cloned()
            .collect())
    }

    async fn pod_logs(&self, app_id: &str, _tail: u32) -> Result<Vec<LogLine>, ClusterError> {
        Ok(self
            .logs
            .lock()
            .expect("logs poisoned")
            .get(app_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn ready_pod_ips(&self, app_id: &str) -> Result<Vec<String>, ClusterError> {
        Ok(self
            .pod_ips
            .lock()
            .expect("pod ips poisoned")
            .get(app_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn base_config(agent_name: &str) -> AppConfig {
    AppConfig {
        agent_name: agent_name.to_string(),
        self_url: "http://127.0.0.1:0".into(),
        host: "127.0.0.1".into(),
        port: 0,
        peer_port: 0,
        namespace: "porpulsion".into(),
        handshake_timeout_secs: 5,
        request_timeout_secs: 2,
        reconcile_interval_secs: 1,
    }
}

pub async fn test_context(agent_name: &str) -> SharedContext {
    test_context_with(agent_name, MockCluster::shared()).await
}

pub async fn test_context_with(agent_name: &str, cluster: Arc<MockCluster>) -> SharedContext {
    crate::build_context(
        base_config(agent_name),
        MemoryBlobStore::shared(),
        MemoryBlobStore::shared(),
        cluster as DynClusterBackend,
    )
    .await
    .expect("test context")
}
