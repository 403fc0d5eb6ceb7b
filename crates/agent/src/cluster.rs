//! Kubernetes access behind a trait so the executor, reconciler and tunnel
//! are testable with a mock.
//!
//! The agent only ever touches Deployments and Pods carrying the
//! `porpulsion.io/remote-app-id` label; arbitrary workloads are unreachable
//! by construction.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PropagationPolicy};
use tracing::debug;

use common::api::{ImagePullPolicy, LogLine, PodDetail, RemoteApp, RemoteAppSpec};

use crate::config::{REMOTE_APP_ID_LABEL, SOURCE_PEER_LABEL};

const FIELD_MANAGER: &str = "porpulsion";

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Transient API failure (rate limit, conflict, server error); retry.
    #[error("kubernetes api unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    /// The API rejected the object; retrying the same request cannot help.
    #[error("kubernetes rejected the request: {0}")]
    Rejected(#[source] anyhow::Error),
}

impl ClusterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Unavailable(_))
    }

    fn from_kube(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if matches!(resp.code, 409 | 429) || resp.code >= 500 => {
                ClusterError::Unavailable(err.into())
            }
            kube::Error::Api(_) => ClusterError::Rejected(err.into()),
            _ => ClusterError::Unavailable(err.into()),
        }
    }
}

/// Live state of one managed Deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentState {
    pub app_id: String,
    pub source_peer: Option<String>,
    pub name: String,
    pub desired: u32,
    pub ready: u32,
    pub available: u32,
    pub updated: u32,
    /// False while the controller has not observed the latest generation.
    pub generation_observed: bool,
    /// A sustained-looking container problem (e.g. `ImagePullBackOff`),
    /// reported as-is; the executor decides when it counts as failure.
    pub pod_problem: Option<String>,
    pub pods: Vec<PodDetail>,
}

#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Create or update the Deployment for an app. Idempotent.
    async fn apply_deployment(&self, app: &RemoteApp) -> Result<(), ClusterError>;

    /// Delete with foreground cascade. Succeeds when already absent.
    async fn delete_deployment(&self, app_id: &str) -> Result<(), ClusterError>;

    /// Patch only the replica count.
    async fn scale_deployment(&self, app_id: &str, replicas: u32) -> Result<(), ClusterError>;

    /// State of one managed Deployment, `None` when it does not exist.
    async fn deployment_state(&self, app_id: &str)
        -> Result<Option<DeploymentState>, ClusterError>;

    /// All Deployments carrying the workload label.
    async fn list_deployments(&self) -> Result<Vec<DeploymentState>, ClusterError>;

    /// Tail logs of every pod of an app, with kubelet timestamps.
    async fn pod_logs(&self, app_id: &str, tail: u32) -> Result<Vec<LogLine>, ClusterError>;

    /// IPs of pods that are Ready, for tunnel target selection.
    async fn ready_pod_ips(&self, app_id: &str) -> Result<Vec<String>, ClusterError>;
}

pub type DynClusterBackend = Arc<dyn ClusterBackend>;

/// Deployment name for an app: `ra-<id>-<name>`, truncated to the k8s limit.
pub fn deployment_name(app_id: &str, app_name: &str) -> String {
    let mut name = format!("ra-{app_id}-{app_name}");
    name.truncate(63);
    name.trim_end_matches('-').to_string()
}

fn pull_policy_str(policy: ImagePullPolicy) -> String {
    match policy {
        ImagePullPolicy::Always => "Always",
        ImagePullPolicy::IfNotPresent => "IfNotPresent",
        ImagePullPolicy::Never => "Never",
    }
    .to_string()
}

fn resource_map(list: &common::api::ResourceList) -> Option<BTreeMap<String, Quantity>> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!map.is_empty()).then_some(map)
}

fn build_env(spec: &RemoteAppSpec) -> Option<Vec<corev1::EnvVar>> {
    if spec.env.is_empty() {
        return None;
    }
    let vars = spec
        .env
        .iter()
        .map(|env| {
            let value_from = env.value_from.as_ref().map(|source| corev1::EnvVarSource {
                secret_key_ref: source.secret_key_ref.as_ref().map(|sel| {
                    corev1::SecretKeySelector {
                        name: sel.name.clone(),
                        key: sel.key.clone(),
                        optional: None,
                    }
                }),
                config_map_key_ref: source.config_map_key_ref.as_ref().map(|sel| {
                    corev1::ConfigMapKeySelector {
                        name: sel.name.clone(),
                        key: sel.key.clone(),
                        optional: None,
                    }
                }),
                field_ref: source.field_ref.as_ref().map(|fr| corev1::ObjectFieldSelector {
                    field_path: fr.field_path.clone(),
                    api_version: None,
                }),
                ..corev1::EnvVarSource::default()
            });
            corev1::EnvVar {
                name: env.name.clone(),
                value: if value_from.is_some() {
                    None
                } else {
                    Some(env.value.clone().unwrap_or_default())
                },
                value_from,
            }
        })
        .collect();
    Some(vars)
}

fn build_probe(spec: &RemoteAppSpec) -> Option<corev1::Probe> {
    let probe = spec.readiness_probe.as_ref()?;
    Some(corev1::Probe {
        http_get: probe.http_get.as_ref().map(|get| corev1::HTTPGetAction {
            path: Some(get.path.clone()),
            port: IntOrString::Int(i32::from(get.port)),
            ..corev1::HTTPGetAction::default()
        }),
        exec: probe.exec.as_ref().map(|exec| corev1::ExecAction {
            command: Some(exec.command.clone()),
        }),
        initial_delay_seconds: Some(probe.initial_delay_seconds),
        period_seconds: Some(probe.period_seconds),
        failure_threshold: Some(probe.failure_threshold),
        ..corev1::Probe::default()
    })
}

fn build_ports(spec: &RemoteAppSpec) -> Option<Vec<corev1::ContainerPort>> {
    if spec.ports.is_empty() {
        return None;
    }
    let ports = spec
        .ports
        .iter()
        .map(|port| corev1::ContainerPort {
            container_port: i32::from(port.port),
            name: port
                .name
                .clone()
                .or_else(|| Some(format!("port-{}", port.port))),
            ..corev1::ContainerPort::default()
        })
        .collect();
    Some(ports)
}

/// Translate a RemoteApp into the Deployment the executor applies.
pub fn build_deployment(app: &RemoteApp, namespace: &str) -> Deployment {
    let spec = &app.spec;
    let deploy_name = deployment_name(&app.id, &app.name);
    let source_peer = app.source_peer.clone().unwrap_or_default();

    let labels = BTreeMap::from([
        ("app".to_string(), deploy_name.clone()),
        (REMOTE_APP_ID_LABEL.to_string(), app.id.clone()),
        (SOURCE_PEER_LABEL.to_string(), source_peer),
    ]);
    let pod_labels = BTreeMap::from([
        ("app".to_string(), deploy_name.clone()),
        (REMOTE_APP_ID_LABEL.to_string(), app.id.clone()),
    ]);
    let selector = BTreeMap::from([("app".to_string(), deploy_name.clone())]);

    let (pod_security, container_security) = match &spec.security_context {
        Some(sc) => (
            Some(corev1::PodSecurityContext {
                run_as_non_root: sc.run_as_non_root,
                run_as_user: sc.run_as_user,
                run_as_group: sc.run_as_group,
                fs_group: sc.fs_group,
                ..corev1::PodSecurityContext::default()
            }),
            sc.read_only_root_filesystem.map(|ro| corev1::SecurityContext {
                read_only_root_filesystem: Some(ro),
                ..corev1::SecurityContext::default()
            }),
        ),
        None => (None, None),
    };

    let container = corev1::Container {
        name: "main".to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some(pull_policy_str(spec.image_pull_policy)),
        command: spec.command.clone(),
        args: spec.args.clone(),
        ports: build_ports(spec),
        env: build_env(spec),
        readiness_probe: build_probe(spec),
        security_context: container_security,
        resources: if spec.resources.is_empty() {
            None
        } else {
            Some(corev1::ResourceRequirements {
                requests: spec.resources.requests.as_ref().and_then(resource_map),
                limits: spec.resources.limits.as_ref().and_then(resource_map),
                ..corev1::ResourceRequirements::default()
            })
        },
        ..corev1::Container::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(deploy_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(app.spec.replicas as i32),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..LabelSelector::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(corev1::PodSpec {
                    containers: vec![container],
                    image_pull_secrets: if spec.image_pull_secrets.is_empty() {
                        None
                    } else {
                        Some(
                            spec.image_pull_secrets
                                .iter()
                                .map(|name| corev1::LocalObjectReference {
                                    name: name.clone(),
                                })
                                .collect(),
                        )
                    },
                    security_context: pod_security,
                    ..corev1::PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        status: None,
    }
}

// ── Kubernetes-backed implementation ──────────────────────────

pub struct KubeBackend {
    deployments: Api<Deployment>,
    pods: Api<corev1::Pod>,
    namespace: String,
}

impl KubeBackend {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            deployments: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    fn app_selector(app_id: &str) -> String {
        format!("{REMOTE_APP_ID_LABEL}={app_id}")
    }

    async fn find_deployment(&self, app_id: &str) -> Result<Option<Deployment>, ClusterError> {
        let params = ListParams::default().labels(&Self::app_selector(app_id));
        let list = self
            .deployments
            .list(&params)
            .await
            .map_err(ClusterError::from_kube)?;
        Ok(list.items.into_iter().next())
    }

    async fn pods_for(&self, app_id: &str) -> Result<Vec<corev1::Pod>, ClusterError> {
        let params = ListParams::default().labels(&Self::app_selector(app_id));
        Ok(self
            .pods
            .list(&params)
            .await
            .map_err(ClusterError::from_kube)?
            .items)
    }
}

fn pod_is_ready(pod: &corev1::Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn pod_detail(pod: &corev1::Pod) -> PodDetail {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());
    PodDetail {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".into()),
        ready: statuses.is_some_and(|list| !list.is_empty() && list.iter().all(|c| c.ready)),
        restarts: statuses
            .map(|list| list.iter().map(|c| c.restart_count.max(0) as u32).sum())
            .unwrap_or(0),
        node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
    }
}

/// Container waiting reasons that indicate the workload cannot run.
const PROBLEM_REASONS: [&str; 5] = [
    "ImagePullBackOff",
    "ErrImagePull",
    "CrashLoopBackOff",
    "CreateContainerError",
    "ContainerCannotRun",
];

fn pod_problem(pods: &[corev1::Pod]) -> Option<String> {
    for pod in pods {
        let Some(statuses) = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
        else {
            continue;
        };
        for status in statuses {
            let waiting = status.state.as_ref().and_then(|s| s.waiting.as_ref());
            if let Some(reason) = waiting.and_then(|w| w.reason.as_deref()) {
                if PROBLEM_REASONS.contains(&reason) {
                    let pod_name = pod.metadata.name.as_deref().unwrap_or("?");
                    return Some(format!("{reason} on pod {pod_name}"));
                }
            }
        }
    }
    None
}

fn state_from(deployment: &Deployment, pods: &[corev1::Pod]) -> DeploymentState {
    let labels = deployment.metadata.labels.clone().unwrap_or_default();
    let status = deployment.status.as_ref();
    let generation_observed = match (
        deployment.metadata.generation,
        status.and_then(|s| s.observed_generation),
    ) {
        (Some(generation), Some(observed)) => observed >= generation,
        _ => false,
    };

    DeploymentState {
        app_id: labels.get(REMOTE_APP_ID_LABEL).cloned().unwrap_or_default(),
        source_peer: labels.get(SOURCE_PEER_LABEL).cloned().filter(|s| !s.is_empty()),
        name: deployment.metadata.name.clone().unwrap_or_default(),
        desired: deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1)
            .max(0) as u32,
        ready: status.and_then(|s| s.ready_replicas).unwrap_or(0).max(0) as u32,
        available: status.and_then(|s| s.available_replicas).unwrap_or(0).max(0) as u32,
        updated: status.and_then(|s| s.updated_replicas).unwrap_or(0).max(0) as u32,
        generation_observed,
        pod_problem: pod_problem(pods),
        pods: pods.iter().map(pod_detail).collect(),
    }
}

fn parse_log_line(pod: &str, line: &str) -> LogLine {
    match line.split_once(' ') {
        Some((ts, rest)) => match ts.parse::<DateTime<Utc>>() {
            Ok(ts) => LogLine {
                ts: Some(ts),
                pod: pod.to_string(),
                message: rest.to_string(),
            },
            Err(_) => LogLine {
                ts: None,
                pod: pod.to_string(),
                message: line.to_string(),
            },
        },
        None => LogLine {
            ts: None,
            pod: pod.to_string(),
            message: line.to_string(),
        },
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    async fn apply_deployment(&self, app: &RemoteApp) -> Result<(), ClusterError> {
        let deployment = build_deployment(app, &self.namespace);
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.deployments
            .patch(&name, &params, &Patch::Apply(&deployment))
            .await
            .map_err(ClusterError::from_kube)?;
        debug!(deployment = %name, "applied deployment");
        Ok(())
    }

    async fn delete_deployment(&self, app_id: &str) -> Result<(), ClusterError> {
        let Some(deployment) = self.find_deployment(app_id).await? else {
            return Ok(());
        };
        let name = deployment.metadata.name.unwrap_or_default();
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..DeleteParams::default()
        };
        match self.deployments.delete(&name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(ClusterError::from_kube(err)),
        }
    }

    async fn scale_deployment(&self, app_id: &str, replicas: u32) -> Result<(), ClusterError> {
        let Some(deployment) = self.find_deployment(app_id).await? else {
            return Err(ClusterError::Rejected(anyhow::anyhow!(
                "no deployment for app {app_id}"
            )));
        };
        let name = deployment.metadata.name.unwrap_or_default();
        let patch = serde_json::json!({"spec": {"replicas": replicas}});
        self.deployments
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(ClusterError::from_kube)?;
        Ok(())
    }

    async fn deployment_state(
        &self,
        app_id: &str,
    ) -> Result<Option<DeploymentState>, ClusterError> {
        let Some(deployment) = self.find_deployment(app_id).await? else {
            return Ok(None);
        };
        let pods = self.pods_for(app_id).await?;
        Ok(Some(state_from(&deployment, &pods)))
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentState>, ClusterError> {
        let params = ListParams::default().labels(REMOTE_APP_ID_LABEL);
        let list = self
            .deployments
            .list(&params)
            .await
            .map_err(ClusterError::from_kube)?;
        let mut states = Vec::with_capacity(list.items.len());
        for deployment in &list.items {
            let app_id = deployment
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(REMOTE_APP_ID_LABEL))
                .cloned()
                .unwrap_or_default();
            let pods = if app_id.is_empty() {
                Vec::new()
            } else {
                self.pods_for(&app_id).await?
            };
            states.push(state_from(deployment, &pods));
        }
        Ok(states)
    }

    async fn pod_logs(&self, app_id: &str, tail: u32) -> Result<Vec<LogLine>, ClusterError> {
        let pods = self.pods_for(app_id).await?;
        let params = LogParams {
            tail_lines: Some(i64::from(tail)),
            timestamps: true,
            ..LogParams::default()
        };
        let mut lines = Vec::new();
        for pod in pods {
            let Some(name) = pod.metadata.name.clone() else {
                continue;
            };
            match self.pods.logs(&name, &params).await {
                Ok(raw) => {
                    lines.extend(raw.lines().map(|line| parse_log_line(&name, line)));
                }
                Err(err) => {
                    // Pods mid-startup have no logs yet; skip rather than fail
                    // the whole request.
                    debug!(pod = %name, %err, "could not fetch logs");
                }
            }
        }
        Ok(lines)
    }

    async fn ready_pod_ips(&self, app_id: &str) -> Result<Vec<String>, ClusterError> {
        let pods = self.pods_for(app_id).await?;
        Ok(pods
            .iter()
            .filter(|pod| pod_is_ready(pod))
            .filter_map(|pod| pod.status.as_ref().and_then(|s| s.pod_ip.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::api::{AppOrigin, RemoteAppStatus};
    use serde_json::json;

    fn app(spec: serde_json::Value) -> RemoteApp {
        RemoteApp {
            id: "abcd1234".into(),
            name: "web".into(),
            spec: serde_json::from_value(spec).expect("spec"),
            status: RemoteAppStatus::Pending,
            origin: AppOrigin::Executing,
            target_peer: None,
            source_peer: Some("agent-a".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            message: None,
        }
    }

    #[test]
    fn deployment_name_truncates_and_trims() {
        assert_eq!(deployment_name("abcd1234", "web"), "ra-abcd1234-web");
        let long = deployment_name("abcd1234", &"x".repeat(100));
        assert!(long.len() <= 63);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn build_deployment_carries_labels_and_replicas() {
        let app = app(json!({"image": "nginx:1.25", "replicas": 2, "ports": [{"port": 80}]}));
        let deployment = build_deployment(&app, "porpulsion");

        let labels = deployment.metadata.labels.expect("labels");
        assert_eq!(labels.get(REMOTE_APP_ID_LABEL).unwrap(), "abcd1234");
        assert_eq!(labels.get(SOURCE_PEER_LABEL).unwrap(), "agent-a");

        let spec = deployment.spec.expect("spec");
        assert_eq!(spec.replicas, Some(2));
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("nginx:1.25"));
        let ports = container.ports.as_ref().expect("ports");
        assert_eq!(ports[0].container_port, 80);
        assert_eq!(ports[0].name.as_deref(), Some("port-80"));
    }

    #[test]
    fn build_deployment_maps_env_sources() {
        let app = app(json!({
            "image": "nginx:1.25",
            "env": [
                {"name": "PLAIN", "value": "1"},
                {"name": "FROM_SECRET", "valueFrom": {"secretKeyRef": {"name": "s", "key": "k"}}},
                {"name": "POD_IP", "valueFrom": {"fieldRef": {"fieldPath": "status.podIP"}}}
            ]
        }));
        let deployment = build_deployment(&app, "porpulsion");
        let env = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .expect("env");

        assert_eq!(env[0].value.as_deref(), Some("1"));
        assert!(env[1].value.is_none());
        assert_eq!(
            env[1]
                .value_from
                .as_ref()
                .unwrap()
                .secret_key_ref
                .as_ref()
                .unwrap()
                .key,
            "k"
        );
        assert_eq!(
            env[2]
                .value_from
                .as_ref()
                .unwrap()
                .field_ref
                .as_ref()
                .unwrap()
                .field_path,
            "status.podIP"
        );
    }

    #[test]
    fn build_deployment_maps_resources_and_security() {
        let app = app(json!({
            "image": "nginx:1.25",
            "resources": {"requests": {"cpu": "250m", "memory": "64Mi"}, "limits": {"cpu": "500m"}},
            "securityContext": {"runAsNonRoot": true, "runAsUser": 1000, "readOnlyRootFilesystem": true}
        }));
        let deployment = build_deployment(&app, "porpulsion");
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();

        let resources = pod_spec.containers[0].resources.as_ref().expect("resources");
        assert_eq!(
            resources.requests.as_ref().unwrap().get("cpu").unwrap().0,
            "250m"
        );
        assert_eq!(
            resources.limits.as_ref().unwrap().get("cpu").unwrap().0,
            "500m"
        );
        assert!(resources.limits.as_ref().unwrap().get("memory").is_none());

        assert_eq!(
            pod_spec.security_context.as_ref().unwrap().run_as_user,
            Some(1000)
        );
        assert_eq!(
            pod_spec.containers[0]
                .security_context
                .as_ref()
                .unwrap()
                .read_only_root_filesystem,
            Some(true)
        );
    }

    #[test]
    fn build_deployment_maps_probe() {
        let app = app(json!({
            "image": "nginx:1.25",
            "readinessProbe": {"httpGet": {"path": "/healthz", "port": 8080}, "periodSeconds": 5}
        }));
        let deployment = build_deployment(&app, "porpulsion");
        let probe = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .readiness_probe
            .clone()
            .expect("probe");
        assert_eq!(
            probe.http_get.as_ref().unwrap().path.as_deref(),
            Some("/healthz")
        );
        assert_eq!(probe.period_seconds, Some(5));
        assert_eq!(probe.initial_delay_seconds, Some(5));
    }

    #[test]
    fn parse_log_line_extracts_timestamp() {
        let line = parse_log_line("web-1", "2026-08-01T10:15:30.123456789Z GET / 200");
        assert!(line.ts.is_some());
        assert_eq!(line.message, "GET / 200");

        let bare = parse_log_line("web-1", "no timestamp here");
        assert!(bare.ts.is_none());
        assert_eq!(bare.message, "no timestamp here");
    }

    #[test]
    fn pod_problem_detects_backoff_reasons() {
        let pod: corev1::Pod = serde_json::from_value(json!({
            "metadata": {"name": "web-1"},
            "status": {"containerStatuses": [{
                "name": "main", "ready": false, "restartCount": 3, "image": "x", "imageID": "",
                "state": {"waiting": {"reason": "ImagePullBackOff"}}
            }]}
        }))
        .expect("pod");
        let problem = pod_problem(&[pod]).expect("problem");
        assert!(problem.contains("ImagePullBackOff"));
        assert!(problem.contains("web-1"));
    }
}
