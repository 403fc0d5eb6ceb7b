//! Executor (C7): turns inbound RemoteApps into Deployments and reflects
//! their status back to the submitter.
//!
//! Every accepted app gets a watcher task polling the Deployment until it is
//! Ready, Failed or timed out. Re-applying a spec replaces the app's watcher
//! so status reports never interleave from two generations.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use common::api::{
    methods, AdmissionReply, AppOrigin, CreateAppRequest, DeleteAppRequest, DetailReply,
    LogOrder, LogsReply, LogsRequest, NotificationLevel, RemoteApp, RemoteAppStatus,
    ScaleRequest, SpecUpdateRequest, StatusPush,
};

use crate::admission;
use crate::cluster::{ClusterError, DeploymentState};
use crate::context::SharedContext;
use crate::telemetry;

/// Poll cadence for the per-app watcher.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);
/// A container problem must persist this long before it counts as failure.
const PROBLEM_GRACE: Duration = Duration::from_secs(60);
/// Give up waiting for a rollout after this long without reaching Ready.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(300);
/// Transient Kubernetes errors retry with doubling backoff up to this cap.
const APPLY_RETRY_CAP: Duration = Duration::from_secs(10);
const APPLY_ATTEMPTS: u32 = 5;

/// Tracks the live watcher per app so re-deploys cancel the old one.
#[derive(Default)]
pub struct Executor {
    watchers: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl Executor {
    fn begin_watch(&self, app_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        let mut watchers = self.watchers.lock().expect("watcher map poisoned");
        if let Some(old) = watchers.insert(app_id.to_string(), tx) {
            let _ = old.send(true);
        }
        rx
    }

    pub fn cancel_watch(&self, app_id: &str) {
        if let Some(old) = self
            .watchers
            .lock()
            .expect("watcher map poisoned")
            .remove(app_id)
        {
            let _ = old.send(true);
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, String> {
    serde_json::from_value(payload).map_err(|err| format!("bad payload: {err}"))
}

// ── Channel handlers ──────────────────────────────────────────

/// `remoteapp/create`: admission, optional approval queue, then execute.
pub async fn handle_create(
    ctx: SharedContext,
    peer: String,
    payload: Value,
) -> Result<Value, String> {
    let request: CreateAppRequest = decode(payload)?;
    request.spec.validate().map_err(|err| err.to_string())?;

    let settings = ctx.registry.settings().await;
    let executing = ctx.registry.executing().await;
    if let Err(err) = admission::admit(&request.spec, &peer, &settings, &executing, None) {
        telemetry::record_admission(&err.kind());
        ctx.registry
            .notify(
                NotificationLevel::Info,
                format!("Workload rejected from {peer}"),
                format!("{:?}: {err}", request.name),
            )
            .await;
        let reply = AdmissionReply {
            accepted: false,
            reason: Some(err.to_string()),
            pending_approval: false,
        };
        return serde_json::to_value(reply).map_err(|err| err.to_string());
    }
    telemetry::record_admission("accepted");

    if settings.require_remoteapp_approval {
        ctx.registry
            .queue_approval(common::api::PendingApproval {
                id: request.id.clone(),
                name: request.name.clone(),
                spec: request.spec,
                source_peer: peer.clone(),
                arrived_at: Utc::now(),
            })
            .await
            .map_err(|err| err.to_string())?;
        ctx.registry
            .notify(
                NotificationLevel::Info,
                "Approval required",
                format!("{:?} from {peer} is waiting for your approval.", request.name),
            )
            .await;
        info!(app = %request.id, peer = %peer, "app queued for approval");
        let reply = AdmissionReply {
            accepted: true,
            reason: None,
            pending_approval: true,
        };
        return serde_json::to_value(reply).map_err(|err| err.to_string());
    }

    let app = executing_record(&request.id, &request.name, request.spec, &peer);
    ctx.registry.insert_executing(app.clone()).await;
    info!(app = %app.id, name = %app.name, peer = %peer, "accepted app for execution");
    spawn_workload(ctx, app);

    serde_json::to_value(AdmissionReply {
        accepted: true,
        reason: None,
        pending_approval: false,
    })
    .map_err(|err| err.to_string())
}

/// `remoteapp/delete`: idempotent teardown.
pub async fn handle_delete(
    ctx: SharedContext,
    _peer: String,
    payload: Value,
) -> Result<Value, String> {
    let request: DeleteAppRequest = decode(payload)?;
    ctx.executor.cancel_watch(&request.id);
    // The approval queue may still hold it.
    let _ = ctx.registry.take_approval(&request.id).await;
    ctx.registry.remove_executing(&request.id).await;
    ctx.cluster
        .delete_deployment(&request.id)
        .await
        .map_err(|err| err.to_string())?;
    info!(app = %request.id, "deleted executing app");
    Ok(json!({}))
}

/// `remoteapp/spec`: replace the spec, re-admit, re-apply.
pub async fn handle_spec(
    ctx: SharedContext,
    peer: String,
    payload: Value,
) -> Result<Value, String> {
    let request: SpecUpdateRequest = decode(payload)?;
    request.spec.validate().map_err(|err| err.to_string())?;

    let Some(app) = ctx.registry.get_executing(&request.id).await else {
        return Err("app not found".into());
    };

    let settings = ctx.registry.settings().await;
    let executing = ctx.registry.executing().await;
    if let Err(err) = admission::admit(
        &request.spec,
        &peer,
        &settings,
        &executing,
        Some(&request.id),
    ) {
        telemetry::record_admission(&err.kind());
        let reply = AdmissionReply {
            accepted: false,
            reason: Some(err.to_string()),
            pending_approval: false,
        };
        return serde_json::to_value(reply).map_err(|err| err.to_string());
    }

    let new_spec = request.spec.clone();
    ctx.registry
        .update_executing(&request.id, move |record| {
            record.spec = new_spec;
            record.status = RemoteAppStatus::Creating;
        })
        .await;
    let mut updated = app;
    updated.spec = request.spec;
    updated.status = RemoteAppStatus::Creating;
    spawn_workload(ctx, updated);

    serde_json::to_value(AdmissionReply {
        accepted: true,
        reason: None,
        pending_approval: false,
    })
    .map_err(|err| err.to_string())
}

/// `remoteapp/scale`: patch replicas, re-checking the replica and pod caps.
pub async fn handle_scale(
    ctx: SharedContext,
    peer: String,
    payload: Value,
) -> Result<Value, String> {
    let request: ScaleRequest = decode(payload)?;
    let Some(app) = ctx.registry.get_executing(&request.id).await else {
        return Err("app not found".into());
    };

    let mut scaled_spec = app.spec.clone();
    scaled_spec.replicas = request.replicas;
    let settings = ctx.registry.settings().await;
    let executing = ctx.registry.executing().await;
    admission::admit(&scaled_spec, &peer, &settings, &executing, Some(&request.id))
        .map_err(|err| err.to_string())?;

    ctx.cluster
        .scale_deployment(&request.id, request.replicas)
        .await
        .map_err(|err| err.to_string())?;
    ctx.registry
        .update_executing(&request.id, |record| {
            record.spec.replicas = request.replicas;
        })
        .await;

    let mut watched = app;
    watched.spec.replicas = request.replicas;
    spawn_workload(ctx, watched);
    Ok(json!({ "replicas": request.replicas }))
}

/// `remoteapp/detail`: live Deployment detail.
pub async fn handle_detail(
    ctx: SharedContext,
    _peer: String,
    payload: Value,
) -> Result<Value, String> {
    let request: DeleteAppRequest = decode(payload)?;
    if ctx.registry.get_executing(&request.id).await.is_none() {
        return Err("app not found".into());
    }
    let Some(state) = ctx
        .cluster
        .deployment_state(&request.id)
        .await
        .map_err(|err| err.to_string())?
    else {
        return Err("deployment not found".into());
    };
    let reply = DetailReply {
        deploy_name: state.name,
        desired: state.desired,
        ready: state.ready,
        available: state.available,
        updated: state.updated,
        pods: state.pods,
    };
    serde_json::to_value(reply).map_err(|err| err.to_string())
}

/// `remoteapp/logs`: tail pod logs, grouped by pod or merged by time.
pub async fn handle_logs(
    ctx: SharedContext,
    _peer: String,
    payload: Value,
) -> Result<Value, String> {
    let request: LogsRequest = decode(payload)?;
    if ctx.registry.get_executing(&request.id).await.is_none() {
        return Err("app not found".into());
    }
    let mut lines = ctx
        .cluster
        .pod_logs(&request.id, request.tail)
        .await
        .map_err(|err| err.to_string())?;

    sort_log_lines(&mut lines, request.order);
    serde_json::to_value(LogsReply { lines }).map_err(|err| err.to_string())
}

/// Order log lines for presentation: grouped by pod, or merged by time with
/// timestamp-less lines last.
pub fn sort_log_lines(lines: &mut [common::api::LogLine], order: LogOrder) {
    match order {
        LogOrder::Pod => lines.sort_by(|a, b| a.pod.cmp(&b.pod).then(a.ts.cmp(&b.ts))),
        LogOrder::Time => lines.sort_by(|a, b| match (a.ts, b.ts) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.pod.cmp(&b.pod),
        }),
    }
}

// ── Execution path ────────────────────────────────────────────

pub fn executing_record(
    id: &str,
    name: &str,
    spec: common::api::RemoteAppSpec,
    source_peer: &str,
) -> RemoteApp {
    RemoteApp {
        id: id.to_string(),
        name: name.to_string(),
        spec,
        status: RemoteAppStatus::Creating,
        origin: AppOrigin::Executing,
        target_peer: None,
        source_peer: Some(source_peer.to_string()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        message: None,
    }
}

/// Run an approved app out of the approval queue through the normal path.
pub async fn start_approved(ctx: SharedContext, approval: common::api::PendingApproval) {
    let app = executing_record(
        &approval.id,
        &approval.name,
        approval.spec,
        &approval.source_peer,
    );
    ctx.registry.insert_executing(app.clone()).await;
    spawn_workload(ctx, app);
}

/// Apply the Deployment and watch it on a fresh task.
pub fn spawn_workload(ctx: SharedContext, app: RemoteApp) {
    let cancel = ctx.executor.begin_watch(&app.id);
    tokio::spawn(async move {
        run_workload(ctx, app, cancel).await;
    });
}

/// Resume watching an already-applied Deployment without re-applying it
/// (restart adoption path; the reconstructed record has no usable spec).
pub fn spawn_watch_only(ctx: SharedContext, app: RemoteApp) {
    let mut cancel = ctx.executor.begin_watch(&app.id);
    tokio::spawn(async move {
        let peer = app.source_peer.clone().unwrap_or_default();
        watch_rollout(&ctx, &peer, &app, &mut cancel).await;
    });
}

async fn run_workload(ctx: SharedContext, app: RemoteApp, mut cancel: watch::Receiver<bool>) {
    let peer = app.source_peer.clone().unwrap_or_default();
    report_status(&ctx, &peer, &app.id, RemoteAppStatus::Creating, None).await;

    // A delete or re-apply racing the spawn wins before the first apply.
    if *cancel.borrow() {
        return;
    }

    if let Err(err) = apply_with_retry(&ctx, &app, &mut cancel).await {
        telemetry::record_executor_apply("failed");
        let message = format!("apply failed: {err}");
        warn!(app = %app.id, %err, "deployment apply failed");
        report_status(&ctx, &peer, &app.id, RemoteAppStatus::Failed, Some(message)).await;
        ctx.registry
            .notify(
                NotificationLevel::Error,
                format!("Workload failed: {}", app.name),
                format!("{:?} could not be applied: {err}", app.name),
            )
            .await;
        return;
    }
    telemetry::record_executor_apply("applied");

    watch_rollout(&ctx, &peer, &app, &mut cancel).await;
}

async fn apply_with_retry(
    ctx: &SharedContext,
    app: &RemoteApp,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), ClusterError> {
    let mut delay = Duration::from_secs(1);
    for attempt in 1..=APPLY_ATTEMPTS {
        match ctx.cluster.apply_deployment(app).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() && attempt < APPLY_ATTEMPTS => {
                warn!(app = %app.id, attempt, %err, "transient apply error; retrying");
                tokio::select! {
                    _ = cancel.changed() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(APPLY_RETRY_CAP);
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop returns before exhausting attempts");
}

/// What a Deployment's counters say about the app right now.
pub(crate) fn map_rollout(state: &DeploymentState) -> RemoteAppStatus {
    let all_pods_ready = !state.pods.is_empty() && state.pods.iter().all(|pod| pod.ready);
    if state.generation_observed
        && state.ready >= state.desired
        && (state.desired == 0 || all_pods_ready)
    {
        RemoteAppStatus::Ready
    } else if state.available > 0 {
        RemoteAppStatus::Running
    } else {
        RemoteAppStatus::Creating
    }
}

async fn watch_rollout(
    ctx: &SharedContext,
    peer: &str,
    app: &RemoteApp,
    cancel: &mut watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut problem_since: Option<Instant> = None;
    let mut last_reported = RemoteAppStatus::Creating;

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                info!(app = %app.id, "watcher cancelled (re-deploy or delete)");
                return;
            }
            _ = tokio::time::sleep(WATCH_INTERVAL) => {}
        }

        let state = match ctx.cluster.deployment_state(&app.id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                // Deleted underneath us; the reconciler owns that transition.
                return;
            }
            Err(err) => {
                warn!(app = %app.id, %err, "could not read deployment status");
                continue;
            }
        };

        // Sustained container problems become failures after the grace period.
        if let Some(problem) = &state.pod_problem {
            let since = *problem_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= PROBLEM_GRACE {
                report_status(
                    ctx,
                    peer,
                    &app.id,
                    RemoteAppStatus::Failed,
                    Some(problem.clone()),
                )
                .await;
                ctx.registry
                    .notify(
                        NotificationLevel::Error,
                        format!("Workload failed: {}", app.name),
                        format!("{:?}: {problem}", app.name),
                    )
                    .await;
                return;
            }
        } else {
            problem_since = None;
        }

        let mapped = map_rollout(&state);
        if mapped != last_reported {
            last_reported = mapped;
            report_status(ctx, peer, &app.id, mapped, None).await;
        }
        if mapped == RemoteAppStatus::Ready {
            return;
        }

        if started.elapsed() >= STARTUP_TIMEOUT {
            report_status(
                ctx,
                peer,
                &app.id,
                RemoteAppStatus::Timeout,
                Some("no rollout progress within 300s".into()),
            )
            .await;
            return;
        }
    }
}

/// Record a transition locally and push it to the submitter. A push that
/// fails with a dead channel marks the record dirty; the reconciler re-emits
/// it after reconnect.
pub async fn report_status(
    ctx: &SharedContext,
    peer: &str,
    app_id: &str,
    status: RemoteAppStatus,
    message: Option<String>,
) {
    let updated_at = Utc::now();
    let message_clone = message.clone();
    ctx.registry
        .update_executing(app_id, move |record| {
            record.status = status;
            record.message = message_clone;
        })
        .await;
    info!(app = %app_id, status = status.as_str(), "status transition");

    let push = StatusPush {
        id: app_id.to_string(),
        status,
        message,
        updated_at,
    };
    let payload = match serde_json::to_value(&push) {
        Ok(payload) => payload,
        Err(_) => return,
    };
    match ctx.channels.push(peer, methods::REMOTEAPP_STATUS, payload) {
        Ok(()) => ctx.registry.mark_executing_dirty(app_id, false).await,
        Err(_) => {
            // Deferred: the reconciler re-sends the current status when the
            // channel comes back.
            ctx.registry.mark_executing_dirty(app_id, true).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, test_context_with, MockCluster};
    use common::api::PodDetail;
    use serde_json::json;

    async fn wait_for_status(
        ctx: &SharedContext,
        id: &str,
        status: RemoteAppStatus,
    ) -> RemoteApp {
        for _ in 0..200 {
            if let Some(app) = ctx.registry.get_executing(id).await {
                if app.status == status {
                    return app;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("app {id} never reached {status:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn create_applies_deployment_and_reaches_ready() {
        let cluster = MockCluster::shared();
        let ctx = test_context_with("agent-b", cluster.clone()).await;

        let reply = handle_create(
            ctx.clone(),
            "agent-a".into(),
            json!({"id": "abcd1234", "name": "web", "spec": {"image": "nginx:1.25", "replicas": 2}}),
        )
        .await
        .expect("accepted");
        assert_eq!(reply["accepted"], json!(true));

        let app = wait_for_status(&ctx, "abcd1234", RemoteAppStatus::Ready).await;
        assert_eq!(app.source_peer.as_deref(), Some("agent-a"));
        assert_eq!(cluster.applied.lock().unwrap().len(), 1);
        // No channel is up, so the status push is deferred for the reconciler.
        assert!(!ctx.registry.dirty_executing().await.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_blocked_image_as_unaccepted_reply() {
        let ctx = test_context("agent-b").await;
        ctx.registry
            .merge_settings(common::api::SettingsPatch {
                blocked_images: Some("nginx".into()),
                ..Default::default()
            })
            .await
            .expect("settings");

        let reply = handle_create(
            ctx.clone(),
            "agent-a".into(),
            json!({"id": "ab", "name": "web", "spec": {"image": "nginx:1.25"}}),
        )
        .await
        .expect("reply, not transport error");
        assert_eq!(reply["accepted"], json!(false));
        assert!(reply["reason"].as_str().unwrap().contains("image_blocked"));
        assert!(ctx.registry.get_executing("ab").await.is_none());
    }

    #[tokio::test]
    async fn create_queues_for_approval_when_required() {
        let ctx = test_context("agent-b").await;
        ctx.registry
            .merge_settings(common::api::SettingsPatch {
                require_remoteapp_approval: Some(true),
                ..Default::default()
            })
            .await
            .expect("settings");

        let reply = handle_create(
            ctx.clone(),
            "agent-a".into(),
            json!({"id": "cd", "name": "web", "spec": {"image": "nginx:1.25"}}),
        )
        .await
        .expect("accepted");
        assert_eq!(reply["accepted"], json!(true));
        assert_eq!(reply["pending_approval"], json!(true));

        assert!(ctx.registry.get_executing("cd").await.is_none());
        assert_eq!(ctx.registry.approvals().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let ctx = test_context("agent-b").await;
        handle_delete(ctx.clone(), "agent-a".into(), json!({"id": "nope"}))
            .await
            .expect("deleting an unknown app succeeds");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_apply_errors_are_retried() {
        let cluster = MockCluster::shared();
        cluster.fail_transient.store(true, std::sync::atomic::Ordering::SeqCst);
        let ctx = test_context_with("agent-b", cluster.clone()).await;

        handle_create(
            ctx.clone(),
            "agent-a".into(),
            json!({"id": "ef", "name": "web", "spec": {"image": "nginx:1.25"}}),
        )
        .await
        .expect("accepted");

        wait_for_status(&ctx, "ef", RemoteAppStatus::Ready).await;
        assert_eq!(cluster.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scale_unknown_app_errors() {
        let ctx = test_context("agent-b").await;
        let err = handle_scale(ctx, "agent-a".into(), json!({"id": "zz", "replicas": 2}))
            .await
            .expect_err("unknown app");
        assert!(err.contains("not found"));
    }

    fn state(desired: u32, ready: u32, available: u32, pods_ready: bool) -> DeploymentState {
        DeploymentState {
            app_id: "a".into(),
            source_peer: Some("peer".into()),
            name: "ra-a-web".into(),
            desired,
            ready,
            available,
            updated: ready,
            generation_observed: true,
            pod_problem: None,
            pods: (0..desired)
                .map(|i| PodDetail {
                    name: format!("pod-{i}"),
                    phase: "Running".into(),
                    ready: pods_ready,
                    restarts: 0,
                    node: None,
                })
                .collect(),
        }
    }

    #[test]
    fn rollout_ready_when_all_replicas_ready() {
        assert_eq!(map_rollout(&state(2, 2, 2, true)), RemoteAppStatus::Ready);
    }

    #[test]
    fn rollout_running_when_partially_available() {
        assert_eq!(map_rollout(&state(2, 1, 1, false)), RemoteAppStatus::Running);
    }

    #[test]
    fn rollout_creating_when_nothing_available() {
        assert_eq!(map_rollout(&state(2, 0, 0, false)), RemoteAppStatus::Creating);
    }

    #[test]
    fn rollout_waits_for_observed_generation() {
        let mut s = state(1, 1, 1, true);
        s.generation_observed = false;
        assert_eq!(map_rollout(&s), RemoteAppStatus::Running);
    }

    #[test]
    fn rollout_ready_counts_need_ready_pods() {
        // Counters look done but a pod reports unready: not Ready yet.
        let s = state(2, 2, 2, false);
        assert_eq!(map_rollout(&s), RemoteAppStatus::Running);
    }
}
