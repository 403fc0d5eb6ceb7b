//! Shared API DTOs used across the agent's REST surface and the peer channel.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header carrying the invite token on the handshake request.
pub const INVITE_TOKEN_HEADER: &str = "x-invite-token";
/// Header carrying the base64-encoded CA PEM on the WebSocket upgrade.
pub const AGENT_CA_HEADER: &str = "x-agent-ca";
/// Header carrying the connecting agent's name on the WebSocket upgrade.
pub const AGENT_NAME_HEADER: &str = "x-agent-name";

/// Channel method and event names.
pub mod methods {
    /// Liveness echo (logical, independent of WS ping frames).
    pub const PEER_PING: &str = "peer/ping";
    /// Submit a RemoteApp to the peer for execution.
    pub const REMOTEAPP_CREATE: &str = "remoteapp/create";
    /// Delete an executing RemoteApp.
    pub const REMOTEAPP_DELETE: &str = "remoteapp/delete";
    /// Replace the spec of an executing RemoteApp and re-apply.
    pub const REMOTEAPP_SPEC: &str = "remoteapp/spec";
    /// Scale an executing RemoteApp.
    pub const REMOTEAPP_SCALE: &str = "remoteapp/scale";
    /// Fetch live Deployment detail for an executing RemoteApp.
    pub const REMOTEAPP_DETAIL: &str = "remoteapp/detail";
    /// Tail pod logs of an executing RemoteApp.
    pub const REMOTEAPP_LOGS: &str = "remoteapp/logs";
    /// Tunnel an HTTP request to a pod on the executing cluster.
    pub const PROXY_HTTP: &str = "proxy/http";

    /// Push: executor → submitter status update.
    pub const REMOTEAPP_STATUS: &str = "remoteapp/status";
    /// Push: clean-shutdown notice; receiver keeps the peer record.
    pub const PEER_GOODBYE: &str = "peer/goodbye";
    /// Push: one chunk of a tunneled HTTP response.
    pub const PROXY_CHUNK: &str = "proxy/chunk";
    /// Push: caller cancelled an outstanding request (carries its id).
    pub const CANCEL: &str = "cancel";
}

// ── Channel framing ───────────────────────────────────────────

/// One JSON message on the peer channel.
///
/// Requests carry `id` + `type`; replies echo the `id` with `type: "reply"`;
/// pushes carry only `type`. Exactly one frame per WebSocket text message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    /// Correlation id: 128-bit random hex, present on requests and replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Method name for requests/pushes, the literal `reply` for replies.
    #[serde(rename = "type")]
    pub kind: String,
    /// Reply success flag; absent on requests and pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// Method payload, or the reply payload when `ok` is true.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Error message when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    /// Reply type marker.
    pub const REPLY: &'static str = "reply";

    /// Build a request frame.
    pub fn request(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Some(id.into()),
            kind: kind.into(),
            ok: None,
            payload,
            error: None,
        }
    }

    /// Build a successful reply to `id`.
    pub fn reply_ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Some(id.into()),
            kind: Self::REPLY.into(),
            ok: Some(true),
            payload,
            error: None,
        }
    }

    /// Build an error reply to `id`.
    pub fn reply_err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind: Self::REPLY.into(),
            ok: Some(false),
            payload: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Build a fire-and-forget push frame.
    pub fn push(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            ok: None,
            payload,
            error: None,
        }
    }

    /// Whether this frame is a reply to an outstanding request.
    pub fn is_reply(&self) -> bool {
        self.kind == Self::REPLY
    }
}

// ── RemoteApp spec schema ─────────────────────────────────────

/// Container image pull policy, mirroring the Kubernetes field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ImagePullPolicy {
    /// Pull on every pod start.
    Always,
    /// Pull only when the image is absent on the node.
    #[default]
    IfNotPresent,
    /// Never pull; the image must already be present.
    Never,
}

/// A single exposed container port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortSpec {
    /// Container port, 1..=65535.
    pub port: u16,
    /// Optional port name, at most 15 characters (the IANA_SVC_NAME limit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// CPU and memory quantities as Kubernetes quantity strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct ResourceList {
    /// CPU quantity, e.g. `500m` or `1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory quantity, e.g. `256Mi` or `1Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceList {
    /// Whether neither quantity is set.
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// Resource requests and limits for the workload's single container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct ResourceRequirements {
    /// Scheduler-facing resource requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
    /// Hard resource limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,
}

impl ResourceRequirements {
    /// Whether no quantities are set at all.
    pub fn is_empty(&self) -> bool {
        self.requests.as_ref().is_none_or(ResourceList::is_empty)
            && self.limits.as_ref().is_none_or(ResourceList::is_empty)
    }
}

/// Reference to a key in a Secret or ConfigMap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KeySelector {
    /// Name of the referenced object.
    pub name: String,
    /// Key within the referenced object.
    pub key: String,
}

/// Downward-API field reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldRef {
    /// Pod field path, e.g. `status.podIP`.
    pub field_path: String,
}

/// Source for an environment variable value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvVarSource {
    /// Read the value from a Secret key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeySelector>,
    /// Read the value from a ConfigMap key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeySelector>,
    /// Read the value from a pod field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_ref: Option<FieldRef>,
}

impl EnvVarSource {
    fn source_count(&self) -> usize {
        usize::from(self.secret_key_ref.is_some())
            + usize::from(self.config_map_key_ref.is_some())
            + usize::from(self.field_ref.is_some())
    }
}

/// One container environment variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Literal value; mutually exclusive with `value_from`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Indirect value source; mutually exclusive with `value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

/// HTTP GET readiness check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HttpGetAction {
    /// Request path.
    pub path: String,
    /// Container port to probe.
    pub port: u16,
}

/// Command-execution readiness check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExecAction {
    /// Command and arguments run inside the container.
    pub command: Vec<String>,
}

/// Readiness probe for the workload container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReadinessProbe {
    /// HTTP GET probe; mutually exclusive with `exec`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpGetAction>,
    /// Exec probe; mutually exclusive with `http_get`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    /// Seconds before the first probe.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: i32,
    /// Seconds between probes.
    #[serde(default = "default_period")]
    pub period_seconds: i32,
    /// Consecutive failures before the pod is marked unready.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i32,
}

fn default_initial_delay() -> i32 {
    5
}

fn default_period() -> i32 {
    10
}

fn default_failure_threshold() -> i32 {
    3
}

/// Pod- and container-level security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecurityContext {
    /// Require the container to run as a non-root user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    /// UID to run the container as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    /// GID to run the container as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    /// Filesystem group applied to mounted volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
    /// Mount the container's root filesystem read-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_root_filesystem: Option<bool>,
}

/// The authoritative RemoteApp workload spec. Unknown fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoteAppSpec {
    /// Container image to run.
    pub image: String,
    /// Number of pod replicas.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Exposed container ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
    /// Resource requests and limits.
    #[serde(default, skip_serializing_if = "ResourceRequirements::is_empty")]
    pub resources: ResourceRequirements,
    /// Override the container entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Override the container arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Container environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Image pull policy.
    #[serde(default, skip_serializing_if = "is_default_pull_policy")]
    pub image_pull_policy: ImagePullPolicy,
    /// Names of Secrets holding registry credentials.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
    /// Readiness probe for the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ReadinessProbe>,
    /// Security context for the pod and container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

fn default_replicas() -> u32 {
    1
}

fn is_default_pull_policy(policy: &ImagePullPolicy) -> bool {
    *policy == ImagePullPolicy::IfNotPresent
}

/// A RemoteApp spec field that failed validation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid spec field {field}: {reason}")]
pub struct InvalidSpec {
    /// Offending field path.
    pub field: String,
    /// Human-readable reason.
    pub reason: String,
}

impl InvalidSpec {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl RemoteAppSpec {
    /// Validate field-level constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        if self.image.trim().is_empty() {
            return Err(InvalidSpec::new("image", "must not be empty"));
        }
        for (idx, port) in self.ports.iter().enumerate() {
            if port.port == 0 {
                return Err(InvalidSpec::new(
                    &format!("ports[{idx}].port"),
                    "must be in 1..=65535",
                ));
            }
            if let Some(name) = &port.name {
                if name.len() > 15 {
                    return Err(InvalidSpec::new(
                        &format!("ports[{idx}].name"),
                        "must be at most 15 characters",
                    ));
                }
            }
        }
        for (idx, env) in self.env.iter().enumerate() {
            if env.name.trim().is_empty() {
                return Err(InvalidSpec::new(
                    &format!("env[{idx}].name"),
                    "must not be empty",
                ));
            }
            match (&env.value, &env.value_from) {
                (Some(_), Some(_)) => {
                    return Err(InvalidSpec::new(
                        &format!("env[{idx}]"),
                        "value and valueFrom are mutually exclusive",
                    ));
                }
                (None, Some(source)) if source.source_count() != 1 => {
                    return Err(InvalidSpec::new(
                        &format!("env[{idx}].valueFrom"),
                        "exactly one source must be set",
                    ));
                }
                _ => {}
            }
        }
        if let Some(probe) = &self.readiness_probe {
            match (&probe.http_get, &probe.exec) {
                (Some(_), Some(_)) | (None, None) => {
                    return Err(InvalidSpec::new(
                        "readinessProbe",
                        "exactly one of httpGet or exec must be set",
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ── RemoteApp lifecycle ───────────────────────────────────────

/// Lifecycle state of a RemoteApp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteAppStatus {
    /// Submitted, not yet accepted by the executor.
    Pending,
    /// Accepted by an operator out of the approval queue.
    Approved,
    /// Rejected by an operator out of the approval queue.
    Rejected,
    /// Deployment created, pods not yet available.
    Creating,
    /// Some replicas available, not all ready.
    Running,
    /// All replicas ready.
    Ready,
    /// Deployment or admission failed; see the record's message.
    Failed,
    /// Executor gave up waiting for progress.
    Timeout,
    /// Torn down (or teardown is pending retry).
    Deleted,
}

impl RemoteAppStatus {
    /// Whether the app no longer consumes cluster resources.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteAppStatus::Failed
                | RemoteAppStatus::Timeout
                | RemoteAppStatus::Deleted
                | RemoteAppStatus::Rejected
        )
    }

    /// Canonical wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteAppStatus::Pending => "Pending",
            RemoteAppStatus::Approved => "Approved",
            RemoteAppStatus::Rejected => "Rejected",
            RemoteAppStatus::Creating => "Creating",
            RemoteAppStatus::Running => "Running",
            RemoteAppStatus::Ready => "Ready",
            RemoteAppStatus::Failed => "Failed",
            RemoteAppStatus::Timeout => "Timeout",
            RemoteAppStatus::Deleted => "Deleted",
        }
    }
}

/// Which side of the channel owns a RemoteApp record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppOrigin {
    /// This agent submitted the app to a peer.
    Submitted,
    /// This agent received the app and runs it locally.
    Executing,
}

/// One unit of cross-cluster workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteApp {
    /// Opaque id minted by the submitter, preserved by the executor.
    pub id: String,
    /// Operator-chosen name.
    pub name: String,
    /// The workload spec.
    pub spec: RemoteAppSpec,
    /// Current lifecycle state.
    pub status: RemoteAppStatus,
    /// Which side of the channel this record belongs to.
    pub origin: AppOrigin,
    /// Peer executing the app; set when `origin == submitted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer: Option<String>,
    /// Peer that submitted the app; set when `origin == executing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_peer: Option<String>,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
    /// Last status transition time.
    pub updated_at: DateTime<Utc>,
    /// Free-form detail surfaced in the UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ── Peers ─────────────────────────────────────────────────────

/// Peering state of a known peer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Handshake accepted locally, channel not yet up.
    Connecting,
    /// Inbound handshake redeemed, waiting for operator confirmation.
    AwaitingConfirmation,
    /// Channel authenticated at least once.
    Connected,
    /// Handshake or channel failed; see `last_error`.
    Failed,
}

/// Live channel state, tracked separately from the peer record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// A live authenticated WebSocket exists.
    Connected,
    /// No live channel; reconnect may be in progress.
    Disconnected,
}

/// A peer as reported on the dashboard API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    /// Local name for the peer, unique on this agent.
    pub name: String,
    /// Externally reachable base URL of the peer.
    pub url: String,
    /// SHA-256 fingerprint of the pinned CA certificate.
    pub ca_fingerprint: String,
    /// Peering state.
    pub status: PeerStatus,
    /// Live channel state.
    pub channel: ChannelState,
    /// When the peering completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    /// Most recent handshake or channel error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A redeemed inbound handshake waiting for operator confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundHandshake {
    /// Request id used by the accept/reject endpoints.
    pub id: String,
    /// The requesting agent's name.
    pub name: String,
    /// The requesting agent's base URL.
    pub url: String,
    /// SHA-256 fingerprint of the requester's CA.
    pub ca_fingerprint: String,
    /// When the handshake arrived.
    pub arrived_at: DateTime<Utc>,
}

// ── Handshake ─────────────────────────────────────────────────

/// Body of `POST /peer`. The invite token travels in `x-invite-token`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeRequest {
    /// The initiating agent's name.
    pub name: String,
    /// The initiating agent's externally reachable URL.
    pub self_url: String,
    /// The initiating agent's CA certificate PEM.
    pub ca_pem: String,
    /// The responder fingerprint the operator copied out-of-band. Checked by
    /// the responder against its own CA before the invite token is consumed.
    pub expected_fingerprint: String,
}

/// Successful handshake response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeResponse {
    /// The responding agent's name.
    pub name: String,
    /// The responding agent's externally reachable URL.
    pub self_url: String,
    /// The responding agent's CA certificate PEM, to be pinned.
    pub ca_pem: String,
}

// ── Channel payloads ──────────────────────────────────────────

/// Payload of `remoteapp/create`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateAppRequest {
    /// Submitter-minted app id.
    pub id: String,
    /// Operator-chosen name.
    pub name: String,
    /// Workload spec.
    pub spec: RemoteAppSpec,
}

/// Reply payload of `remoteapp/create` and `remoteapp/spec`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AdmissionReply {
    /// Whether the submission was accepted.
    pub accepted: bool,
    /// Rejection reason when `accepted` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// True when the app is queued for manual approval.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_approval: bool,
}

/// Payload of `remoteapp/delete`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteAppRequest {
    /// App id to tear down. Idempotent.
    pub id: String,
}

/// Payload of `remoteapp/spec`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecUpdateRequest {
    /// App id.
    pub id: String,
    /// Replacement spec; re-validated by admission.
    pub spec: RemoteAppSpec,
}

/// Payload of `remoteapp/scale`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaleRequest {
    /// App id.
    pub id: String,
    /// New replica count.
    pub replicas: u32,
}

/// Log line ordering for `remoteapp/logs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOrder {
    /// Group lines by pod.
    #[default]
    Pod,
    /// Merge lines across pods by timestamp.
    Time,
}

/// Payload of `remoteapp/logs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogsRequest {
    /// App id.
    pub id: String,
    /// Lines per pod.
    #[serde(default = "default_log_tail")]
    pub tail: u32,
    /// Line ordering.
    #[serde(default)]
    pub order: LogOrder,
}

fn default_log_tail() -> u32 {
    200
}

/// One pod log line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    /// Kubelet timestamp; None when the line carried no parsable timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    /// Pod the line came from.
    pub pod: String,
    /// The log line.
    pub message: String,
}

/// Reply payload of `remoteapp/logs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LogsReply {
    /// Ordered log lines.
    pub lines: Vec<LogLine>,
}

/// Per-pod detail inside [`DetailReply`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodDetail {
    /// Pod name.
    pub name: String,
    /// Pod phase as reported by Kubernetes.
    pub phase: String,
    /// Whether all containers are ready.
    pub ready: bool,
    /// Total container restarts.
    pub restarts: u32,
    /// Node the pod is scheduled on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// Reply payload of `remoteapp/detail`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetailReply {
    /// Deployment name on the executing cluster.
    pub deploy_name: String,
    /// Desired replica count.
    pub desired: u32,
    /// Ready replica count.
    pub ready: u32,
    /// Available replica count.
    pub available: u32,
    /// Updated replica count.
    pub updated: u32,
    /// Per-pod detail.
    pub pods: Vec<PodDetail>,
}

/// Push payload of `remoteapp/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPush {
    /// App id.
    pub id: String,
    /// New status.
    pub status: RemoteAppStatus,
    /// Optional detail message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Transition time on the executor.
    pub updated_at: DateTime<Utc>,
}

/// Payload of `proxy/http`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyHttpRequest {
    /// App id; resolved to pods via the workload label on the executor.
    pub id: String,
    /// Target container port.
    pub port: u16,
    /// HTTP method.
    pub method: String,
    /// Request path (no query string).
    pub path: String,
    /// Raw query string, without the leading `?`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    /// Request headers, hop-by-hop headers already stripped.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Base64-encoded request body.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body_b64: String,
    /// Stream id the executor tags response chunks with.
    pub stream_id: String,
}

/// Push payload of `proxy/chunk`. The first chunk of a stream carries the
/// status and headers; the last sets `final`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyChunkPush {
    /// Stream id from the originating request.
    pub stream_id: String,
    /// Base64-encoded body chunk; may be empty on the final frame.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chunk_b64: String,
    /// Whether this is the last frame of the stream.
    #[serde(rename = "final")]
    pub is_final: bool,
    /// Response status, on the first frame only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Response headers, on the first frame only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// Push payload of `cancel`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancelPush {
    /// Correlation id of the cancelled request.
    pub id: String,
}

/// A RemoteApp that arrived while manual approval is required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingApproval {
    /// Submitter-minted app id.
    pub id: String,
    /// Operator-chosen name.
    pub name: String,
    /// The submitted spec, re-validated when approved.
    pub spec: RemoteAppSpec,
    /// Peer that submitted the app.
    pub source_peer: String,
    /// When the submission arrived.
    pub arrived_at: DateTime<Utc>,
}

// ── Settings ──────────────────────────────────────────────────

/// Agent settings, persisted as flat JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Accept RemoteApp submissions from peers.
    pub allow_inbound_remoteapps: bool,
    /// Queue inbound apps for manual approval before executing.
    pub require_remoteapp_approval: bool,
    /// Accept inbound tunnel requests from peers.
    pub allow_inbound_tunnels: bool,
    /// Comma-separated peer names allowed to submit; empty = all.
    pub allowed_source_peers: String,
    /// Comma-separated `peer` or `peer/app-id` tunnel allowlist; empty = all.
    pub allowed_tunnel_peers: String,
    /// Comma-separated image prefixes allowed; empty = all.
    pub allowed_images: String,
    /// Comma-separated image prefixes always rejected.
    pub blocked_images: String,
    /// Reject specs without cpu and memory requests.
    pub require_resource_requests: bool,
    /// Reject specs without cpu and memory limits.
    pub require_resource_limits: bool,
    /// Per-pod cpu request cap, quantity string; empty = unlimited.
    pub max_cpu_request_per_pod: String,
    /// Per-pod cpu limit cap.
    pub max_cpu_limit_per_pod: String,
    /// Per-pod memory request cap.
    pub max_memory_request_per_pod: String,
    /// Per-pod memory limit cap.
    pub max_memory_limit_per_pod: String,
    /// Per-app replica cap; 0 = unlimited.
    pub max_replicas_per_app: u32,
    /// Aggregate deployment cap; 0 = unlimited.
    pub max_total_deployments: u32,
    /// Aggregate pod cap; 0 = unlimited.
    pub max_total_pods: u32,
    /// Aggregate cpu request cap, quantity string; empty = unlimited.
    pub max_total_cpu_requests: String,
    /// Aggregate memory request cap.
    pub max_total_memory_requests: String,
    /// Agent log level: DEBUG, INFO, WARN or ERROR.
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            allow_inbound_remoteapps: true,
            require_remoteapp_approval: false,
            allow_inbound_tunnels: true,
            allowed_source_peers: String::new(),
            allowed_tunnel_peers: String::new(),
            allowed_images: String::new(),
            blocked_images: String::new(),
            require_resource_requests: false,
            require_resource_limits: false,
            max_cpu_request_per_pod: String::new(),
            max_cpu_limit_per_pod: String::new(),
            max_memory_request_per_pod: String::new(),
            max_memory_limit_per_pod: String::new(),
            max_replicas_per_app: 0,
            max_total_deployments: 0,
            max_total_pods: 0,
            max_total_cpu_requests: String::new(),
            max_total_memory_requests: String::new(),
            log_level: "INFO".into(),
        }
    }
}

/// Partial settings update; unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsPatch {
    /// See [`Settings::allow_inbound_remoteapps`].
    pub allow_inbound_remoteapps: Option<bool>,
    /// See [`Settings::require_remoteapp_approval`].
    pub require_remoteapp_approval: Option<bool>,
    /// See [`Settings::allow_inbound_tunnels`].
    pub allow_inbound_tunnels: Option<bool>,
    /// See [`Settings::allowed_source_peers`].
    pub allowed_source_peers: Option<String>,
    /// See [`Settings::allowed_tunnel_peers`].
    pub allowed_tunnel_peers: Option<String>,
    /// See [`Settings::allowed_images`].
    pub allowed_images: Option<String>,
    /// See [`Settings::blocked_images`].
    pub blocked_images: Option<String>,
    /// See [`Settings::require_resource_requests`].
    pub require_resource_requests: Option<bool>,
    /// See [`Settings::require_resource_limits`].
    pub require_resource_limits: Option<bool>,
    /// See [`Settings::max_cpu_request_per_pod`].
    pub max_cpu_request_per_pod: Option<String>,
    /// See [`Settings::max_cpu_limit_per_pod`].
    pub max_cpu_limit_per_pod: Option<String>,
    /// See [`Settings::max_memory_request_per_pod`].
    pub max_memory_request_per_pod: Option<String>,
    /// See [`Settings::max_memory_limit_per_pod`].
    pub max_memory_limit_per_pod: Option<String>,
    /// See [`Settings::max_replicas_per_app`].
    pub max_replicas_per_app: Option<u32>,
    /// See [`Settings::max_total_deployments`].
    pub max_total_deployments: Option<u32>,
    /// See [`Settings::max_total_pods`].
    pub max_total_pods: Option<u32>,
    /// See [`Settings::max_total_cpu_requests`].
    pub max_total_cpu_requests: Option<String>,
    /// See [`Settings::max_total_memory_requests`].
    pub max_total_memory_requests: Option<String>,
    /// See [`Settings::log_level`].
    pub log_level: Option<String>,
}

impl Settings {
    /// Apply a patch field by field (last writer wins per field).
    pub fn merge(&mut self, patch: SettingsPatch) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = patch.$field {
                    self.$field = value;
                })*
            };
        }
        take!(
            allow_inbound_remoteapps,
            require_remoteapp_approval,
            allow_inbound_tunnels,
            allowed_source_peers,
            allowed_tunnel_peers,
            allowed_images,
            blocked_images,
            require_resource_requests,
            require_resource_limits,
            max_cpu_request_per_pod,
            max_cpu_limit_per_pod,
            max_memory_request_per_pod,
            max_memory_limit_per_pod,
            max_replicas_per_app,
            max_total_deployments,
            max_total_pods,
            max_total_cpu_requests,
            max_total_memory_requests,
            log_level,
        );
    }

    /// Split a comma-separated allowlist into trimmed, non-empty entries.
    pub fn split_list(raw: &str) -> Vec<&str> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .collect()
    }
}

// ── Notifications ─────────────────────────────────────────────

/// Notification severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    /// Informational.
    Info,
    /// Needs operator attention.
    Warn,
    /// Something failed.
    Error,
}

/// One UI notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    /// Opaque id used by the ack endpoint.
    pub id: String,
    /// Emission time.
    pub ts: DateTime<Utc>,
    /// Severity.
    pub level: NotificationLevel,
    /// Short title.
    pub title: String,
    /// Detail message.
    pub message: String,
    /// Whether the operator acknowledged it.
    #[serde(default)]
    pub ack: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_spec() -> RemoteAppSpec {
        serde_json::from_value(json!({"image": "nginx:1.25"})).expect("minimal spec parses")
    }

    #[test]
    fn spec_defaults_apply() {
        let spec = minimal_spec();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.image_pull_policy, ImagePullPolicy::IfNotPresent);
        assert!(spec.ports.is_empty());
        assert!(spec.resources.is_empty());
    }

    #[test]
    fn spec_rejects_unknown_fields() {
        let err = serde_json::from_value::<RemoteAppSpec>(
            json!({"image": "nginx:1.25", "hostNetwork": true}),
        )
        .expect_err("unknown field must be rejected");
        assert!(err.to_string().contains("hostNetwork"));
    }

    #[test]
    fn spec_validate_rejects_zero_port() {
        let spec = serde_json::from_value::<RemoteAppSpec>(
            json!({"image": "nginx:1.25", "ports": [{"port": 0}]}),
        )
        .expect("parses");
        let err = spec.validate().expect_err("port 0 invalid");
        assert_eq!(err.field, "ports[0].port");
    }

    #[test]
    fn spec_validate_rejects_long_port_name() {
        let spec = serde_json::from_value::<RemoteAppSpec>(
            json!({"image": "nginx:1.25", "ports": [{"port": 80, "name": "a-very-long-port-name"}]}),
        )
        .expect("parses");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn spec_validate_rejects_env_with_both_sources() {
        let spec = serde_json::from_value::<RemoteAppSpec>(json!({
            "image": "nginx:1.25",
            "env": [{
                "name": "X",
                "value": "y",
                "valueFrom": {"secretKeyRef": {"name": "s", "key": "k"}}
            }]
        }))
        .expect("parses");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn spec_validate_accepts_field_ref_env() {
        let spec = serde_json::from_value::<RemoteAppSpec>(json!({
            "image": "nginx:1.25",
            "env": [{"name": "POD_IP", "valueFrom": {"fieldRef": {"fieldPath": "status.podIP"}}}]
        }))
        .expect("parses");
        spec.validate().expect("fieldRef env is valid");
    }

    #[test]
    fn probe_requires_exactly_one_action() {
        let spec = serde_json::from_value::<RemoteAppSpec>(json!({
            "image": "nginx:1.25",
            "readinessProbe": {"initialDelaySeconds": 1}
        }))
        .expect("parses");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn frame_wire_shape_matches_contract() {
        let frame = Frame::request("00ff", "peer/ping", json!({}));
        let value = serde_json::to_value(&frame).expect("serializes");
        assert_eq!(value, json!({"id": "00ff", "type": "peer/ping", "payload": {}}));

        let reply = Frame::reply_err("00ff", "unknown type");
        let value = serde_json::to_value(&reply).expect("serializes");
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"], json!("unknown type"));
        assert_eq!(value["type"], json!("reply"));

        let push = Frame::push("remoteapp/status", json!({"id": "a"}));
        let value = serde_json::to_value(&push).expect("serializes");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn status_terminality() {
        assert!(RemoteAppStatus::Deleted.is_terminal());
        assert!(RemoteAppStatus::Failed.is_terminal());
        assert!(RemoteAppStatus::Timeout.is_terminal());
        assert!(!RemoteAppStatus::Running.is_terminal());
        assert!(!RemoteAppStatus::Pending.is_terminal());
    }

    #[test]
    fn settings_merge_is_field_level() {
        let mut settings = Settings::default();
        settings.merge(SettingsPatch {
            allowed_images: Some("registry.internal/".into()),
            max_total_deployments: Some(2),
            ..SettingsPatch::default()
        });
        assert_eq!(settings.allowed_images, "registry.internal/");
        assert_eq!(settings.max_total_deployments, 2);
        // Untouched fields keep their values.
        assert!(settings.allow_inbound_remoteapps);
        assert_eq!(settings.log_level, "INFO");
    }

    #[test]
    fn settings_patch_rejects_unknown_keys() {
        let err = serde_json::from_value::<SettingsPatch>(json!({"max_total_ram": "4Gi"}))
            .expect_err("unknown setting must be rejected");
        assert!(err.to_string().contains("max_total_ram"));
    }

    #[test]
    fn split_list_trims_and_drops_empties() {
        assert_eq!(
            Settings::split_list(" a, b ,, c/d "),
            vec!["a", "b", "c/d"]
        );
        assert!(Settings::split_list("").is_empty());
    }
}
