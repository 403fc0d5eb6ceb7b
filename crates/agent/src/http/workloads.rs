//! RemoteApp endpoints: submission, lifecycle, logs, the approval queue and
//! the HTTP tunnel entry point.

use std::collections::HashMap;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use common::api::{
    methods, AdmissionReply, AppOrigin, CreateAppRequest, DeleteAppRequest, LogOrder,
    LogsReply, LogsRequest, NotificationLevel, PendingApproval, RemoteApp, RemoteAppSpec,
    RemoteAppStatus, ScaleRequest, SpecUpdateRequest, StatusPush,
};

use crate::channel::ChannelError;
use crate::context::SharedContext;
use crate::{executor, tunnel};

use super::{ApiResult, AppError};

/// Cap on request bodies entering the tunnel.
const MAX_PROXY_BODY: usize = 16 * 1024 * 1024;

pub async fn list_apps(State(ctx): State<SharedContext>) -> Json<serde_json::Value> {
    Json(json!({
        "submitted": ctx.registry.submitted().await,
        "executing": ctx.registry.executing().await,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub name: String,
    pub spec: RemoteAppSpec,
    #[serde(default)]
    pub target_peer: Option<String>,
}

/// Submit an app to a peer. Send first, persist only on success: a failed
/// send leaves no local record behind.
pub async fn create_app(
    State(ctx): State<SharedContext>,
    Json(body): Json<CreateBody>,
) -> ApiResult<(StatusCode, Json<RemoteApp>)> {
    if body.name.trim().is_empty() {
        return Err(AppError::validation("name is required"));
    }
    body.spec
        .validate()
        .map_err(|err| AppError::validation(err.to_string()))?;

    let peers = ctx.registry.peers().await;
    let target = match body.target_peer {
        Some(name) => ctx
            .registry
            .peer(&name)
            .await
            .ok_or_else(|| AppError::not_found(format!("peer {name:?} not found")))?,
        None if peers.len() == 1 => peers.into_iter().next().expect("len checked"),
        None if peers.is_empty() => {
            return Err(AppError::validation("no peers connected"));
        }
        None => {
            return Err(AppError::validation(
                "target_peer is required when multiple peers exist",
            ));
        }
    };

    let id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let request = CreateAppRequest {
        id: id.clone(),
        name: body.name.clone(),
        spec: body.spec.clone(),
    };
    let payload = serde_json::to_value(&request).map_err(|err| AppError::internal(err.to_string()))?;

    let reply_value = ctx
        .channels
        .send(&target.name, methods::REMOTEAPP_CREATE, payload)
        .await?;
    let reply: AdmissionReply = serde_json::from_value(reply_value)
        .map_err(|err| AppError::bad_gateway(format!("bad reply from peer: {err}")))?;

    if !reply.accepted {
        let reason = reply.reason.unwrap_or_else(|| "rejected by peer".into());
        ctx.registry
            .notify(
                NotificationLevel::Info,
                format!("Workload rejected by {}", target.name),
                format!("{:?}: {reason}", body.name),
            )
            .await;
        return Err(AppError::admission(reason));
    }

    let app = RemoteApp {
        id,
        name: body.name,
        spec: body.spec,
        status: RemoteAppStatus::Pending,
        origin: AppOrigin::Submitted,
        target_peer: Some(target.name.clone()),
        source_peer: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        message: reply
            .pending_approval
            .then(|| "awaiting approval on the executing cluster".to_string()),
    };
    ctx.registry.insert_submitted(app.clone()).await?;
    info!(app = %app.id, peer = %target.name, "app submitted");
    Ok((StatusCode::CREATED, Json(app)))
}

pub async fn app_detail(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(app) = ctx.registry.get_submitted(&id).await {
        let remote = match &app.target_peer {
            Some(peer) => {
                match ctx
                    .channels
                    .send(peer, methods::REMOTEAPP_DETAIL, json!({ "id": id }))
                    .await
                {
                    Ok(detail) => detail,
                    Err(err) => json!({ "error": err.to_string() }),
                }
            }
            None => json!({ "error": "no target peer" }),
        };
        return Ok(Json(json!({ "app": app, "k8s": remote })));
    }

    if let Some(app) = ctx.registry.get_executing(&id).await {
        let detail = match ctx.cluster.deployment_state(&id).await {
            Ok(Some(state)) => json!({
                "deploy_name": state.name,
                "desired": state.desired,
                "ready": state.ready,
                "available": state.available,
                "updated": state.updated,
                "pods": state.pods,
            }),
            Ok(None) => json!({ "error": "deployment not found" }),
            Err(err) => json!({ "error": err.to_string() }),
        };
        return Ok(Json(json!({ "app": app, "k8s": detail })));
    }

    Err(AppError::not_found("app not found"))
}

#[derive(Debug, Deserialize)]
pub struct SpecBody {
    pub spec: RemoteAppSpec,
}

/// Replace the spec of a submitted app and re-apply on the executor.
pub async fn update_spec(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
    Json(body): Json<SpecBody>,
) -> ApiResult<Json<RemoteApp>> {
    body.spec
        .validate()
        .map_err(|err| AppError::validation(err.to_string()))?;

    let Some(app) = ctx.registry.get_submitted(&id).await else {
        return Err(AppError::not_found("app not found"));
    };
    let peer = app
        .target_peer
        .clone()
        .ok_or_else(|| AppError::internal("submitted app without target peer"))?;

    let request = SpecUpdateRequest {
        id: id.clone(),
        spec: body.spec.clone(),
    };
    let payload = serde_json::to_value(&request).map_err(|err| AppError::internal(err.to_string()))?;
    let reply: AdmissionReply = serde_json::from_value(
        ctx.channels.send(&peer, methods::REMOTEAPP_SPEC, payload).await?,
    )
    .map_err(|err| AppError::bad_gateway(format!("bad reply from peer: {err}")))?;

    if !reply.accepted {
        return Err(AppError::admission(
            reply.reason.unwrap_or_else(|| "rejected by peer".into()),
        ));
    }

    let new_spec = body.spec;
    ctx.registry
        .update_submitted(&id, move |record| {
            record.spec = new_spec;
            record.status = RemoteAppStatus::Pending;
        })
        .await?;
    let updated = ctx
        .registry
        .get_submitted(&id)
        .await
        .ok_or_else(|| AppError::internal("record vanished"))?;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct ScaleBody {
    pub replicas: u32,
}

pub async fn scale_app(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
    Json(body): Json<ScaleBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(app) = ctx.registry.get_submitted(&id).await {
        let peer = app
            .target_peer
            .clone()
            .ok_or_else(|| AppError::internal("submitted app without target peer"))?;
        let request = ScaleRequest {
            id: id.clone(),
            replicas: body.replicas,
        };
        let payload =
            serde_json::to_value(&request).map_err(|err| AppError::internal(err.to_string()))?;
        ctx.channels
            .send(&peer, methods::REMOTEAPP_SCALE, payload)
            .await?;
        ctx.registry
            .update_submitted(&id, |record| record.spec.replicas = body.replicas)
            .await?;
        return Ok(Json(json!({ "ok": true, "replicas": body.replicas })));
    }

    if ctx.registry.get_executing(&id).await.is_some() {
        ctx.cluster
            .scale_deployment(&id, body.replicas)
            .await
            .map_err(|err| AppError::bad_gateway(err.to_string()))?;
        ctx.registry
            .update_executing(&id, |record| record.spec.replicas = body.replicas)
            .await;
        return Ok(Json(json!({ "ok": true, "replicas": body.replicas })));
    }

    Err(AppError::not_found("app not found"))
}

/// Delete an app on both sides. A delete that cannot reach the executor is
/// durably marked and retried by the reconciler, never dropped.
pub async fn delete_app(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(app) = ctx.registry.get_submitted(&id).await {
        let Some(peer) = app.target_peer.clone() else {
            ctx.registry.remove_submitted(&id).await?;
            return Ok(Json(json!({ "ok": true })));
        };

        let request = DeleteAppRequest { id: id.clone() };
        let payload =
            serde_json::to_value(&request).map_err(|err| AppError::internal(err.to_string()))?;
        match ctx
            .channels
            .send(&peer, methods::REMOTEAPP_DELETE, payload)
            .await
        {
            Ok(_) => {
                ctx.registry.remove_submitted(&id).await?;
                info!(app = %id, "app deleted on both sides");
                return Ok(Json(json!({ "ok": true })));
            }
            Err(ChannelError::Remote(message)) => {
                return Err(AppError::bad_gateway(message));
            }
            Err(err) => {
                // Channel down or timed out: record the intent; the
                // reconciler re-sends it after reconnect.
                ctx.registry
                    .update_submitted(&id, |record| {
                        record.status = RemoteAppStatus::Deleted;
                        record.message =
                            Some("teardown pending; peer unreachable".to_string());
                    })
                    .await?;
                ctx.reconcile_wake.notify_one();
                info!(app = %id, %err, "delete deferred until peer reconnects");
                return Ok(Json(json!({ "ok": true, "deferred": true })));
            }
        }
    }

    if let Some(app) = ctx.registry.get_executing(&id).await {
        ctx.executor.cancel_watch(&id);
        ctx.registry.remove_executing(&id).await;
        ctx.cluster
            .delete_deployment(&id)
            .await
            .map_err(|err| AppError::bad_gateway(err.to_string()))?;
        if let Some(peer) = app.source_peer {
            let push = StatusPush {
                id: id.clone(),
                status: RemoteAppStatus::Deleted,
                message: None,
                updated_at: Utc::now(),
            };
            if let Ok(payload) = serde_json::to_value(&push) {
                let _ = ctx.channels.push(&peer, methods::REMOTEAPP_STATUS, payload);
            }
        }
        return Ok(Json(json!({ "ok": true })));
    }

    Err(AppError::not_found("app not found"))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: u32,
    #[serde(default)]
    pub order: LogOrder,
}

fn default_tail() -> u32 {
    200
}

pub async fn app_logs(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsReply>> {
    if let Some(app) = ctx.registry.get_submitted(&id).await {
        let peer = app
            .target_peer
            .clone()
            .ok_or_else(|| AppError::internal("submitted app without target peer"))?;
        let request = LogsRequest {
            id: id.clone(),
            tail: query.tail,
            order: query.order,
        };
        let payload =
            serde_json::to_value(&request).map_err(|err| AppError::internal(err.to_string()))?;
        let reply: LogsReply = serde_json::from_value(
            ctx.channels.send(&peer, methods::REMOTEAPP_LOGS, payload).await?,
        )
        .map_err(|err| AppError::bad_gateway(format!("bad reply from peer: {err}")))?;
        return Ok(Json(reply));
    }

    if ctx.registry.get_executing(&id).await.is_some() {
        let mut lines = ctx
            .cluster
            .pod_logs(&id, query.tail)
            .await
            .map_err(|err| AppError::bad_gateway(err.to_string()))?;
        executor::sort_log_lines(&mut lines, query.order);
        return Ok(Json(LogsReply { lines }));
    }

    Err(AppError::not_found("app not found"))
}

// ── Tunnel entry points ───────────────────────────────────────

pub async fn proxy_root(
    State(ctx): State<SharedContext>,
    Path((id, port)): Path<(String, u16)>,
    request: Request,
) -> Response {
    proxy_common(ctx, id, port, String::new(), request).await
}

pub async fn proxy_subpath(
    State(ctx): State<SharedContext>,
    Path((id, port, rest)): Path<(String, u16, String)>,
    request: Request,
) -> Response {
    proxy_common(ctx, id, port, rest, request).await
}

async fn proxy_common(
    ctx: SharedContext,
    id: String,
    port: u16,
    rest: String,
    request: Request,
) -> Response {
    let method = request.method().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let body = match axum::body::to_bytes(request.into_body(), MAX_PROXY_BODY).await {
        Ok(body) => body,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "request body too large", "kind": "validation" })),
            )
                .into_response();
        }
    };

    tunnel::proxy_dashboard_request(ctx, id, port, method, rest, query, headers, body).await
}

// ── Approval queue ────────────────────────────────────────────

pub async fn list_approvals(State(ctx): State<SharedContext>) -> Json<Vec<PendingApproval>> {
    Json(ctx.registry.approvals().await)
}

pub async fn approve_app(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(approval) = ctx.registry.take_approval(&id).await? else {
        return Err(AppError::not_found("approval not found"));
    };
    info!(app = %approval.id, peer = %approval.source_peer, "approval granted");
    executor::start_approved(ctx.clone(), approval).await;
    Ok(Json(json!({ "ok": true })))
}

pub async fn reject_approval(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(approval) = ctx.registry.take_approval(&id).await? else {
        return Err(AppError::not_found("approval not found"));
    };
    let push = StatusPush {
        id: approval.id.clone(),
        status: RemoteAppStatus::Rejected,
        message: Some("rejected by operator".into()),
        updated_at: Utc::now(),
    };
    if let Ok(payload) = serde_json::to_value(&push) {
        let _ = ctx
            .channels
            .push(&approval.source_peer, methods::REMOTEAPP_STATUS, payload);
    }
    info!(app = %approval.id, peer = %approval.source_peer, "approval rejected");
    Ok(Json(json!({ "ok": true })))
}
