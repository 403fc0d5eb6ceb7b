//! Reconciler (C10): the periodic sweep that keeps records and Deployments
//! convergent.
//!
//! Every tick it rebuilds executing apps from labeled Deployments (restart
//! recovery), marks records whose Deployment vanished, re-emits status
//! pushes that failed while a channel was down, and retries durable deletes
//! of submitted apps.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use common::api::{AppOrigin, ChannelState, RemoteApp, RemoteAppStatus};

use crate::cluster::DeploymentState;
use crate::context::SharedContext;
use crate::executor;

/// Periodic loop; also woken explicitly through `ctx.reconcile_wake`.
pub async fn reconcile_loop(
    ctx: SharedContext,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut interval =
        tokio::time::interval(Duration::from_secs(ctx.cfg.reconcile_interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
            _ = ctx.reconcile_wake.notified() => {}
        }
        if let Err(err) = reconcile_tick(&ctx).await {
            warn!(%err, "reconcile sweep failed; will retry next tick");
        }
    }
    Ok(())
}

/// One sweep. Errors are returned so the loop can log and retry; no error
/// leaves a record permanently inconsistent with its Deployment.
pub async fn reconcile_tick(ctx: &SharedContext) -> anyhow::Result<()> {
    let states = ctx.cluster.list_deployments().await?;

    let mut seen = HashSet::new();
    for state in &states {
        if state.app_id.is_empty() {
            continue;
        }
        seen.insert(state.app_id.clone());
        match ctx.registry.get_executing(&state.app_id).await {
            None => adopt_deployment(ctx, state).await,
            Some(app) => drive_status(ctx, &app, state).await,
        }
    }

    prune_vanished(ctx, &seen).await;
    flush_dirty_status(ctx).await;
    retry_pending_deletes(ctx).await;

    Ok(())
}

/// A Deployment with our label but no record: rebuild the record (agent
/// restart) and resume watching it if it is still rolling out.
async fn adopt_deployment(ctx: &SharedContext, state: &DeploymentState) {
    let name = state
        .name
        .strip_prefix(&format!("ra-{}-", state.app_id))
        .unwrap_or(&state.name)
        .to_string();
    let status = executor::map_rollout(state);

    let mut spec: common::api::RemoteAppSpec =
        serde_json::from_value(json!({ "image": "" })).expect("minimal spec");
    spec.replicas = state.desired;

    let app = RemoteApp {
        id: state.app_id.clone(),
        name,
        spec,
        status,
        origin: AppOrigin::Executing,
        target_peer: None,
        source_peer: state.source_peer.clone(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        message: None,
    };
    info!(app = %app.id, status = status.as_str(), "reconstructed executing app from deployment");
    ctx.registry.insert_executing(app.clone()).await;
    // The submitter may have missed transitions while we were down.
    ctx.registry.mark_executing_dirty(&app.id, true).await;

    if status != RemoteAppStatus::Ready {
        executor::spawn_watch_only(ctx.clone(), app);
    }
}

/// Nudge coarse status transitions between watcher runs. Failure and timeout
/// belong to the watcher, which tracks grace periods; the reconciler only
/// moves along the healthy path.
async fn drive_status(ctx: &SharedContext, app: &RemoteApp, state: &DeploymentState) {
    if app.status.is_terminal() {
        return;
    }
    let mapped = executor::map_rollout(state);
    if mapped != app.status
        && !matches!(app.status, RemoteAppStatus::Failed | RemoteAppStatus::Timeout)
    {
        let peer = app.source_peer.clone().unwrap_or_default();
        executor::report_status(ctx, &peer, &app.id, mapped, None).await;
    }
}

/// Records whose Deployment is gone transition to Deleted and drop out.
/// Apps still in Creating are skipped: their first apply may be in flight.
async fn prune_vanished(ctx: &SharedContext, seen: &HashSet<String>) {
    for app in ctx.registry.executing().await {
        if seen.contains(&app.id) || app.status == RemoteAppStatus::Creating {
            continue;
        }
        info!(app = %app.id, "deployment vanished; marking record deleted");
        let peer = app.source_peer.clone().unwrap_or_default();
        executor::report_status(ctx, &peer, &app.id, RemoteAppStatus::Deleted, None).await;
        ctx.registry.remove_executing(&app.id).await;
    }
}

/// Re-emit the current status of apps whose last push hit a dead channel.
async fn flush_dirty_status(ctx: &SharedContext) {
    for app in ctx.registry.dirty_executing().await {
        let Some(peer) = app.source_peer.clone() else {
            continue;
        };
        if !ctx.channels.is_connected(&peer) {
            continue;
        }
        executor::report_status(ctx, &peer, &app.id, app.status, app.message.clone()).await;
    }
}

/// Submitted apps marked Deleted are teardown intents the peer has not
/// acknowledged yet; keep retrying until the executor confirms.
async fn retry_pending_deletes(ctx: &SharedContext) {
    for app in ctx.registry.submitted().await {
        if app.status != RemoteAppStatus::Deleted {
            continue;
        }
        let Some(peer) = app.target_peer.clone() else {
            let _ = ctx.registry.remove_submitted(&app.id).await;
            continue;
        };
        if !ctx.channels.is_connected(&peer) {
            continue;
        }
        match ctx
            .channels
            .send(&peer, common::api::methods::REMOTEAPP_DELETE, json!({ "id": app.id }))
            .await
        {
            Ok(_) => {
                info!(app = %app.id, peer = %peer, "deferred delete confirmed by peer");
                let _ = ctx.registry.remove_submitted(&app.id).await;
            }
            Err(err) => {
                warn!(app = %app.id, peer = %peer, %err, "deferred delete still failing");
            }
        }
    }
}

/// Re-dial every persisted peer after a restart.
pub async fn redial_persisted_peers(ctx: &SharedContext) {
    for peer in ctx.registry.peers().await {
        if peer.channel == ChannelState::Disconnected {
            info!(peer = %peer.name, "re-opening channel to persisted peer");
            ctx.channels.spawn_outbound(&peer.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context_with, MockCluster};
    use chrono::Utc;
    use common::api::RemoteAppSpec;

    fn executing(id: &str, status: RemoteAppStatus) -> RemoteApp {
        let spec: RemoteAppSpec =
            serde_json::from_value(json!({"image": "nginx:1.25"})).expect("spec");
        RemoteApp {
            id: id.into(),
            name: format!("app-{id}"),
            spec,
            status,
            origin: AppOrigin::Executing,
            target_peer: None,
            source_peer: Some("agent-a".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            message: None,
        }
    }

    #[tokio::test]
    async fn adopts_labeled_deployments_after_restart() {
        let cluster = MockCluster::shared();
        cluster.insert_state(MockCluster::ready_state("abcd", "web", "agent-a", 2));
        let ctx = test_context_with("agent-b", cluster).await;

        reconcile_tick(&ctx).await.expect("tick");

        let app = ctx.registry.get_executing("abcd").await.expect("adopted");
        assert_eq!(app.name, "web");
        assert_eq!(app.status, RemoteAppStatus::Ready);
        assert_eq!(app.source_peer.as_deref(), Some("agent-a"));
        assert_eq!(app.spec.replicas, 2);
        // The submitter may have missed transitions; the record is dirty so
        // the next connected sweep re-emits its status.
        assert_eq!(ctx.registry.dirty_executing().await.len(), 1);
    }

    #[tokio::test]
    async fn prunes_records_whose_deployment_vanished() {
        let cluster = MockCluster::shared();
        let ctx = test_context_with("agent-b", cluster).await;
        ctx.registry
            .insert_executing(executing("gone", RemoteAppStatus::Running))
            .await;

        reconcile_tick(&ctx).await.expect("tick");
        assert!(ctx.registry.get_executing("gone").await.is_none());
    }

    #[tokio::test]
    async fn keeps_creating_records_during_first_apply() {
        let cluster = MockCluster::shared();
        let ctx = test_context_with("agent-b", cluster).await;
        ctx.registry
            .insert_executing(executing("fresh", RemoteAppStatus::Creating))
            .await;

        reconcile_tick(&ctx).await.expect("tick");
        assert!(
            ctx.registry.get_executing("fresh").await.is_some(),
            "apps whose first apply may be in flight are not pruned"
        );
    }

    #[tokio::test]
    async fn deferred_delete_waits_for_channel() {
        let cluster = MockCluster::shared();
        let ctx = test_context_with("agent-a", cluster).await;
        let spec: RemoteAppSpec =
            serde_json::from_value(json!({"image": "nginx:1.25"})).expect("spec");
        ctx.registry
            .insert_submitted(RemoteApp {
                id: "dddd".into(),
                name: "web".into(),
                spec,
                status: RemoteAppStatus::Deleted,
                origin: AppOrigin::Submitted,
                target_peer: Some("agent-b".into()),
                source_peer: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                message: None,
            })
            .await
            .expect("insert");

        reconcile_tick(&ctx).await.expect("tick");
        // Channel down: the teardown intent must survive the sweep.
        assert!(ctx.registry.get_submitted("dddd").await.is_some());
    }
}
