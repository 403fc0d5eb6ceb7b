//! Admission pipeline for inbound RemoteApps (C8).
//!
//! Runs on every `remoteapp/create` and `remoteapp/spec` before anything
//! touches the cluster. Checks apply in a fixed order, first match wins; the
//! approval queue (when enabled) is handled by the caller after everything
//! here has passed.

use tracing::warn;

use common::api::{RemoteApp, RemoteAppSpec, Settings};

use crate::quantity::{parse_cpu_millis, parse_memory_bytes};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("inbound_disabled: inbound workloads are disabled on this agent")]
    InboundDisabled,
    #[error("peer_not_allowed: peer {0:?} may not submit workloads here")]
    PeerNotAllowed(String),
    #[error("image_blocked: image matches blocked prefix {0:?}")]
    ImageBlocked(String),
    #[error("image_not_allowed: image does not match any allowed prefix")]
    ImageNotAllowed,
    #[error("resource_request_required: {0} must be set")]
    ResourceRequestRequired(&'static str),
    #[error("resource_limit_required: {0} must be set")]
    ResourceLimitRequired(&'static str),
    #[error("per_pod_quota_exceeded({field}): {detail}")]
    PerPodQuotaExceeded { field: &'static str, detail: String },
    #[error("max_replicas_exceeded: {requested} replicas exceed the per-app limit of {limit}")]
    MaxReplicasExceeded { requested: u32, limit: u32 },
    #[error("global_quota_exceeded({field}): {detail}")]
    GlobalQuotaExceeded { field: &'static str, detail: String },
    #[error("invalid_quantity({0}): not a valid Kubernetes quantity")]
    InvalidQuantity(&'static str),
}

impl AdmissionError {
    /// Stable machine-readable kind, used in notifications and replies.
    pub fn kind(&self) -> String {
        match self {
            AdmissionError::InboundDisabled => "inbound_disabled".into(),
            AdmissionError::PeerNotAllowed(_) => "peer_not_allowed".into(),
            AdmissionError::ImageBlocked(_) => "image_blocked".into(),
            AdmissionError::ImageNotAllowed => "image_not_allowed".into(),
            AdmissionError::ResourceRequestRequired(_) => "resource_request_required".into(),
            AdmissionError::ResourceLimitRequired(_) => "resource_limit_required".into(),
            AdmissionError::PerPodQuotaExceeded { field, .. } => {
                format!("per_pod_quota_exceeded({field})")
            }
            AdmissionError::MaxReplicasExceeded { .. } => "max_replicas_exceeded".into(),
            AdmissionError::GlobalQuotaExceeded { field, .. } => {
                format!("global_quota_exceeded({field})")
            }
            AdmissionError::InvalidQuantity(field) => format!("invalid_quantity({field})"),
        }
    }
}

fn spec_cpu_request(spec: &RemoteAppSpec) -> Result<Option<u64>, AdmissionError> {
    spec.resources
        .requests
        .as_ref()
        .and_then(|r| r.cpu.as_deref())
        .map(|raw| parse_cpu_millis(raw).map_err(|_| AdmissionError::InvalidQuantity("requests.cpu")))
        .transpose()
}

fn spec_memory_request(spec: &RemoteAppSpec) -> Result<Option<u64>, AdmissionError> {
    spec.resources
        .requests
        .as_ref()
        .and_then(|r| r.memory.as_deref())
        .map(|raw| {
            parse_memory_bytes(raw).map_err(|_| AdmissionError::InvalidQuantity("requests.memory"))
        })
        .transpose()
}

fn spec_cpu_limit(spec: &RemoteAppSpec) -> Result<Option<u64>, AdmissionError> {
    spec.resources
        .limits
        .as_ref()
        .and_then(|r| r.cpu.as_deref())
        .map(|raw| parse_cpu_millis(raw).map_err(|_| AdmissionError::InvalidQuantity("limits.cpu")))
        .transpose()
}

fn spec_memory_limit(spec: &RemoteAppSpec) -> Result<Option<u64>, AdmissionError> {
    spec.resources
        .limits
        .as_ref()
        .and_then(|r| r.memory.as_deref())
        .map(|raw| {
            parse_memory_bytes(raw).map_err(|_| AdmissionError::InvalidQuantity("limits.memory"))
        })
        .transpose()
}

/// Parse a settings cap; an unparsable operator value disables the cap
/// rather than rejecting every submission.
fn cap_cpu(raw: &str, name: &str) -> Option<u64> {
    if raw.trim().is_empty() {
        return None;
    }
    match parse_cpu_millis(raw) {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(setting = name, value = raw, "unparsable quantity in settings; cap ignored");
            None
        }
    }
}

fn cap_memory(raw: &str, name: &str) -> Option<u64> {
    if raw.trim().is_empty() {
        return None;
    }
    match parse_memory_bytes(raw) {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(setting = name, value = raw, "unparsable quantity in settings; cap ignored");
            None
        }
    }
}

fn image_matches(image: &str, prefixes: &str) -> Option<String> {
    Settings::split_list(prefixes)
        .into_iter()
        .find(|prefix| image.starts_with(prefix))
        .map(str::to_string)
}

/// Admit a spec from `source_peer`, or say exactly why not.
///
/// `executing` is the current set of executing apps for aggregate caps;
/// `exclude_id` removes an app's previous footprint when its spec is being
/// replaced. Aggregation skips terminal apps and multiplies per-pod requests
/// by replicas.
pub fn admit(
    spec: &RemoteAppSpec,
    source_peer: &str,
    settings: &Settings,
    executing: &[RemoteApp],
    exclude_id: Option<&str>,
) -> Result<(), AdmissionError> {
    // 1. Inbound switch.
    if !settings.allow_inbound_remoteapps {
        return Err(AdmissionError::InboundDisabled);
    }

    // 2. Peer allowlist.
    let allowed_peers = Settings::split_list(&settings.allowed_source_peers);
    if !allowed_peers.is_empty() && !allowed_peers.contains(&source_peer) {
        return Err(AdmissionError::PeerNotAllowed(source_peer.to_string()));
    }

    // 3. Blocklist beats 4. allowlist.
    if let Some(prefix) = image_matches(&spec.image, &settings.blocked_images) {
        return Err(AdmissionError::ImageBlocked(prefix));
    }
    if !Settings::split_list(&settings.allowed_images).is_empty()
        && image_matches(&spec.image, &settings.allowed_images).is_none()
    {
        return Err(AdmissionError::ImageNotAllowed);
    }

    let cpu_request = spec_cpu_request(spec)?;
    let memory_request = spec_memory_request(spec)?;
    let cpu_limit = spec_cpu_limit(spec)?;
    let memory_limit = spec_memory_limit(spec)?;

    // 5. Required requests/limits.
    if settings.require_resource_requests {
        if cpu_request.is_none() {
            return Err(AdmissionError::ResourceRequestRequired("requests.cpu"));
        }
        if memory_request.is_none() {
            return Err(AdmissionError::ResourceRequestRequired("requests.memory"));
        }
    }
    if settings.require_resource_limits {
        if cpu_limit.is_none() {
            return Err(AdmissionError::ResourceLimitRequired("limits.cpu"));
        }
        if memory_limit.is_none() {
            return Err(AdmissionError::ResourceLimitRequired("limits.memory"));
        }
    }

    // 6. Per-pod caps.
    per_pod_check(
        cpu_request,
        cap_cpu(&settings.max_cpu_request_per_pod, "max_cpu_request_per_pod"),
        "requests.cpu",
        "m",
    )?;
    per_pod_check(
        cpu_limit,
        cap_cpu(&settings.max_cpu_limit_per_pod, "max_cpu_limit_per_pod"),
        "limits.cpu",
        "m",
    )?;
    per_pod_check(
        memory_request,
        cap_memory(
            &settings.max_memory_request_per_pod,
            "max_memory_request_per_pod",
        ),
        "requests.memory",
        " bytes",
    )?;
    per_pod_check(
        memory_limit,
        cap_memory(
            &settings.max_memory_limit_per_pod,
            "max_memory_limit_per_pod",
        ),
        "limits.memory",
        " bytes",
    )?;

    // 7. Per-app replica cap.
    if settings.max_replicas_per_app > 0 && spec.replicas > settings.max_replicas_per_app {
        return Err(AdmissionError::MaxReplicasExceeded {
            requested: spec.replicas,
            limit: settings.max_replicas_per_app,
        });
    }

    // 8. Aggregate caps over non-terminal executing apps.
    let active: Vec<&RemoteApp> = executing
        .iter()
        .filter(|app| !app.status.is_terminal() && Some(app.id.as_str()) != exclude_id)
        .collect();

    if settings.max_total_deployments > 0
        && active.len() as u32 + 1 > settings.max_total_deployments
    {
        return Err(AdmissionError::GlobalQuotaExceeded {
            field: "deployments",
            detail: format!(
                "limit of {} concurrent deployments reached",
                settings.max_total_deployments
            ),
        });
    }

    if settings.max_total_pods > 0 {
        let pods: u32 = active.iter().map(|app| app.spec.replicas).sum::<u32>() + spec.replicas;
        if pods > settings.max_total_pods {
            return Err(AdmissionError::GlobalQuotaExceeded {
                field: "pods",
                detail: format!(
                    "{} pods requested against a limit of {}",
                    pods, settings.max_total_pods
                ),
            });
        }
    }

    if let Some(cap) = cap_cpu(&settings.max_total_cpu_requests, "max_total_cpu_requests") {
        let mut used: u64 = 0;
        for app in &active {
            used += spec_cpu_request(&app.spec)?.unwrap_or(0) * u64::from(app.spec.replicas);
        }
        let requested = cpu_request.unwrap_or(0) * u64::from(spec.replicas);
        if used + requested > cap {
            return Err(AdmissionError::GlobalQuotaExceeded {
                field: "cpu_requests",
                detail: format!("{requested}m requested, {}m available", cap.saturating_sub(used)),
            });
        }
    }

    if let Some(cap) = cap_memory(
        &settings.max_total_memory_requests,
        "max_total_memory_requests",
    ) {
        let mut used: u64 = 0;
        for app in &active {
            used += spec_memory_request(&app.spec)?.unwrap_or(0) * u64::from(app.spec.replicas);
        }
        let requested = memory_request.unwrap_or(0) * u64::from(spec.replicas);
        if used + requested > cap {
            return Err(AdmissionError::GlobalQuotaExceeded {
                field: "memory_requests",
                detail: format!(
                    "{requested} bytes requested, {} bytes available",
                    cap.saturating_sub(used)
                ),
            });
        }
    }

    Ok(())
}

fn per_pod_check(
    value: Option<u64>,
    cap: Option<u64>,
    field: &'static str,
    unit: &str,
) -> Result<(), AdmissionError> {
    if let (Some(value), Some(cap)) = (value, cap) {
        if value > cap {
            return Err(AdmissionError::PerPodQuotaExceeded {
                field,
                detail: format!("{value}{unit} exceeds the per-pod cap of {cap}{unit}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::api::{AppOrigin, RemoteAppStatus};
    use serde_json::json;

    fn spec(value: serde_json::Value) -> RemoteAppSpec {
        serde_json::from_value(value).expect("spec")
    }

    fn executing_app(id: &str, spec_value: serde_json::Value, status: RemoteAppStatus) -> RemoteApp {
        RemoteApp {
            id: id.into(),
            name: format!("app-{id}"),
            spec: spec(spec_value),
            status,
            origin: AppOrigin::Executing,
            target_peer: None,
            source_peer: Some("agent-a".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            message: None,
        }
    }

    #[test]
    fn inbound_disabled_wins_first() {
        let settings = Settings {
            allow_inbound_remoteapps: false,
            blocked_images: "nginx".into(),
            ..Settings::default()
        };
        let err = admit(&spec(json!({"image": "nginx:1.25"})), "a", &settings, &[], None)
            .expect_err("disabled");
        assert_eq!(err, AdmissionError::InboundDisabled);
    }

    #[test]
    fn peer_allowlist_enforced() {
        let settings = Settings {
            allowed_source_peers: "alpha, beta".into(),
            ..Settings::default()
        };
        admit(&spec(json!({"image": "nginx:1.25"})), "alpha", &settings, &[], None)
            .expect("alpha allowed");
        let err = admit(&spec(json!({"image": "nginx:1.25"})), "gamma", &settings, &[], None)
            .expect_err("gamma denied");
        assert_eq!(err.kind(), "peer_not_allowed");
    }

    #[test]
    fn blocklist_beats_allowlist() {
        let settings = Settings {
            allowed_images: "docker.io/".into(),
            blocked_images: "docker.io/evil".into(),
            ..Settings::default()
        };
        let err = admit(
            &spec(json!({"image": "docker.io/evil:1"})),
            "a",
            &settings,
            &[],
            None,
        )
        .expect_err("blocked");
        assert_eq!(err.kind(), "image_blocked");
    }

    #[test]
    fn unlisted_image_rejected() {
        let settings = Settings {
            allowed_images: "registry.internal/".into(),
            ..Settings::default()
        };
        let err = admit(&spec(json!({"image": "nginx:latest"})), "a", &settings, &[], None)
            .expect_err("not allowed");
        assert_eq!(err.kind(), "image_not_allowed");
        assert!(err.to_string().contains("image_not_allowed"));
    }

    #[test]
    fn required_requests_enforced() {
        let settings = Settings {
            require_resource_requests: true,
            ..Settings::default()
        };
        let err = admit(
            &spec(json!({"image": "a", "resources": {"requests": {"cpu": "100m"}}})),
            "a",
            &settings,
            &[],
            None,
        )
        .expect_err("memory request missing");
        assert_eq!(err, AdmissionError::ResourceRequestRequired("requests.memory"));

        admit(
            &spec(json!({"image": "a", "resources": {"requests": {"cpu": "100m", "memory": "64Mi"}}})),
            "a",
            &settings,
            &[],
            None,
        )
        .expect("both set");
    }

    #[test]
    fn per_pod_cpu_cap_uses_quantity_semantics() {
        let settings = Settings {
            max_cpu_request_per_pod: "0.5".into(),
            ..Settings::default()
        };
        // 500m == 0.5 cores: at the cap, allowed.
        admit(
            &spec(json!({"image": "a", "resources": {"requests": {"cpu": "500m"}}})),
            "a",
            &settings,
            &[],
            None,
        )
        .expect("at cap");
        let err = admit(
            &spec(json!({"image": "a", "resources": {"requests": {"cpu": "501m"}}})),
            "a",
            &settings,
            &[],
            None,
        )
        .expect_err("over cap");
        assert_eq!(err.kind(), "per_pod_quota_exceeded(requests.cpu)");
    }

    #[test]
    fn replica_cap_enforced() {
        let settings = Settings {
            max_replicas_per_app: 3,
            ..Settings::default()
        };
        let err = admit(&spec(json!({"image": "a", "replicas": 4})), "a", &settings, &[], None)
            .expect_err("too many replicas");
        assert_eq!(err.kind(), "max_replicas_exceeded");
    }

    #[test]
    fn third_deployment_hits_global_quota() {
        let settings = Settings {
            max_total_deployments: 2,
            ..Settings::default()
        };
        let running = vec![
            executing_app("one", json!({"image": "a"}), RemoteAppStatus::Running),
            executing_app("two", json!({"image": "a"}), RemoteAppStatus::Ready),
        ];
        let err = admit(&spec(json!({"image": "a"})), "a", &settings, &running, None)
            .expect_err("third rejected");
        assert_eq!(err.kind(), "global_quota_exceeded(deployments)");
    }

    #[test]
    fn terminal_apps_do_not_count_toward_quota() {
        let settings = Settings {
            max_total_deployments: 2,
            ..Settings::default()
        };
        let apps = vec![
            executing_app("one", json!({"image": "a"}), RemoteAppStatus::Running),
            executing_app("two", json!({"image": "a"}), RemoteAppStatus::Failed),
            executing_app("three", json!({"image": "a"}), RemoteAppStatus::Deleted),
        ];
        admit(&spec(json!({"image": "a"})), "a", &settings, &apps, None)
            .expect("only one active deployment counts");
    }

    #[test]
    fn spec_update_excludes_own_footprint() {
        let settings = Settings {
            max_total_cpu_requests: "1".into(),
            ..Settings::default()
        };
        let apps = vec![executing_app(
            "self",
            json!({"image": "a", "resources": {"requests": {"cpu": "800m"}}}),
            RemoteAppStatus::Running,
        )];
        // Replacing its own spec: the old 800m is excluded, 900m fits.
        admit(
            &spec(json!({"image": "a", "resources": {"requests": {"cpu": "900m"}}})),
            "a",
            &settings,
            &apps,
            Some("self"),
        )
        .expect("own footprint excluded");
        // A second app does not fit next to the existing 800m.
        let err = admit(
            &spec(json!({"image": "a", "resources": {"requests": {"cpu": "300m"}}})),
            "a",
            &settings,
            &apps,
            None,
        )
        .expect_err("over aggregate cap");
        assert_eq!(err.kind(), "global_quota_exceeded(cpu_requests)");
    }

    #[test]
    fn aggregate_cpu_multiplies_by_replicas() {
        let settings = Settings {
            max_total_cpu_requests: "1".into(),
            ..Settings::default()
        };
        let err = admit(
            &spec(json!({"image": "a", "replicas": 3, "resources": {"requests": {"cpu": "400m"}}})),
            "a",
            &settings,
            &[],
            None,
        )
        .expect_err("3 x 400m > 1 core");
        assert_eq!(err.kind(), "global_quota_exceeded(cpu_requests)");
    }

    #[test]
    fn pod_aggregate_counts_replicas() {
        let settings = Settings {
            max_total_pods: 4,
            ..Settings::default()
        };
        let apps = vec![executing_app(
            "one",
            json!({"image": "a", "replicas": 3}),
            RemoteAppStatus::Running,
        )];
        let err = admit(&spec(json!({"image": "a", "replicas": 2})), "a", &settings, &apps, None)
            .expect_err("5 pods > 4");
        assert_eq!(err.kind(), "global_quota_exceeded(pods)");
    }

    #[test]
    fn bad_spec_quantity_is_rejected() {
        let err = admit(
            &spec(json!({"image": "a", "resources": {"requests": {"cpu": "lots"}}})),
            "a",
            &Settings::default(),
            &[],
            None,
        )
        .expect_err("unparsable");
        assert_eq!(err.kind(), "invalid_quantity(requests.cpu)");
    }

    #[test]
    fn bad_settings_quantity_disables_cap() {
        let settings = Settings {
            max_cpu_request_per_pod: "banana".into(),
            ..Settings::default()
        };
        admit(
            &spec(json!({"image": "a", "resources": {"requests": {"cpu": "64"}}})),
            "a",
            &settings,
            &[],
            None,
        )
        .expect("cap ignored");
    }
}
