//! Local dashboard API under `/api` (C3/C4 front door).
//!
//! Everything is JSON; errors use `{error, kind}` with the status code
//! carrying the taxonomy: 400 validation, 401 trust, 403 admission, 404
//! missing, 504 transport, 500 internal.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;

use common::api::{SettingsPatch, INVITE_TOKEN_HEADER};

use crate::channel::ChannelError;
use crate::context::SharedContext;
use crate::persist::PersistError;
use crate::quantity::{parse_cpu_millis, parse_memory_bytes};
use crate::telemetry;

mod peers;
mod workloads;

/// Application error for HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: String,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation".into(),
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found".into(),
            message: msg.into(),
        }
    }

    pub fn admission(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            kind: "admission".into(),
            message: msg.into(),
        }
    }

    pub fn trust(kind: &str, msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: kind.into(),
            message: msg.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            kind: "transport".into(),
            message: msg.into(),
        }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            kind: "peer_error".into(),
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind: "conflict".into(),
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal_error".into(),
            message: msg.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.message, "kind": self.kind })),
        )
            .into_response()
    }
}

impl From<PersistError> for AppError {
    fn from(err: PersistError) -> Self {
        tracing::error!(%err, "persistence failure in handler");
        AppError::internal("could not persist state")
    }
}

impl From<ChannelError> for AppError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Down => AppError::transport("channel down"),
            ChannelError::Timeout => AppError::transport("request timed out"),
            ChannelError::Cancelled => AppError::transport("request cancelled"),
            ChannelError::Remote(message) => AppError::bad_gateway(message),
        }
    }
}

pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/api/token", get(get_token))
        .route("/api/status", get(get_status))
        .route("/api/peers", get(peers::list_peers))
        .route("/api/peers/connect", post(peers::connect_peer))
        .route("/api/peers/{name}", delete(peers::remove_peer))
        .route("/api/peers/inbound", get(peers::list_inbound))
        .route("/api/peers/inbound/{id}/accept", post(peers::accept_inbound))
        .route("/api/peers/inbound/{id}", delete(peers::reject_inbound))
        .route("/api/remoteapps", get(workloads::list_apps))
        .route("/api/remoteapp", post(workloads::create_app))
        .route("/api/remoteapp/{id}/detail", get(workloads::app_detail))
        .route("/api/remoteapp/{id}/spec", axum::routing::put(workloads::update_spec))
        .route("/api/remoteapp/{id}/scale", post(workloads::scale_app))
        .route("/api/remoteapp/{id}", delete(workloads::delete_app))
        .route("/api/remoteapp/{id}/logs", get(workloads::app_logs))
        .route(
            "/api/remoteapp/{id}/proxy/{port}",
            axum::routing::any(workloads::proxy_root),
        )
        // The catch-all below does not match an empty tail, so the bare
        // trailing-slash form needs its own route.
        .route(
            "/api/remoteapp/{id}/proxy/{port}/",
            axum::routing::any(workloads::proxy_root),
        )
        .route(
            "/api/remoteapp/{id}/proxy/{port}/{*rest}",
            axum::routing::any(workloads::proxy_subpath),
        )
        .route("/api/approvals", get(workloads::list_approvals))
        .route("/api/approvals/{id}/approve", post(workloads::approve_app))
        .route("/api/approvals/{id}", delete(workloads::reject_approval))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/notifications", get(list_notifications).delete(clear_notifications))
        .route("/api/notifications/{id}/ack", post(ack_notification))
        .route("/api/metrics", get(get_metrics))
        .with_state(ctx)
}

async fn get_token(State(ctx): State<SharedContext>) -> Json<serde_json::Value> {
    Json(json!({
        "agent": ctx.cfg.agent_name,
        "invite_token": ctx.credentials.current_invite_token().await,
        "self_url": ctx.cfg.self_url,
        "ca_fingerprint": ctx.credentials.fingerprint(),
        "ca_pem": ctx.credentials.ca_pem(),
        // Paste target hint for the remote operator.
        "invite_header": INVITE_TOKEN_HEADER,
    }))
}

async fn get_status(State(ctx): State<SharedContext>) -> Json<serde_json::Value> {
    Json(json!({
        "agent": ctx.cfg.agent_name,
        "generation": ctx.registry.generation(),
        "peers": ctx.registry.peers().await.len(),
        "submitted": ctx.registry.submitted().await.len(),
        "executing": ctx.registry.executing().await.len(),
    }))
}

async fn get_settings(State(ctx): State<SharedContext>) -> Json<common::api::Settings> {
    Json(ctx.registry.settings().await)
}

const LOG_LEVELS: [&str; 4] = ["DEBUG", "INFO", "WARN", "ERROR"];

fn validate_patch(patch: &SettingsPatch) -> Result<(), AppError> {
    if let Some(level) = &patch.log_level {
        if !LOG_LEVELS.contains(&level.to_ascii_uppercase().as_str()) {
            return Err(AppError::validation(format!(
                "log_level must be one of {LOG_LEVELS:?}"
            )));
        }
    }

    let cpu_fields = [
        ("max_cpu_request_per_pod", &patch.max_cpu_request_per_pod),
        ("max_cpu_limit_per_pod", &patch.max_cpu_limit_per_pod),
        ("max_total_cpu_requests", &patch.max_total_cpu_requests),
    ];
    for (name, value) in cpu_fields {
        if let Some(raw) = value {
            if !raw.trim().is_empty() && parse_cpu_millis(raw).is_err() {
                return Err(AppError::validation(format!(
                    "{name} is not a valid cpu quantity"
                )));
            }
        }
    }

    let memory_fields = [
        ("max_memory_request_per_pod", &patch.max_memory_request_per_pod),
        ("max_memory_limit_per_pod", &patch.max_memory_limit_per_pod),
        ("max_total_memory_requests", &patch.max_total_memory_requests),
    ];
    for (name, value) in memory_fields {
        if let Some(raw) = value {
            if !raw.trim().is_empty() && parse_memory_bytes(raw).is_err() {
                return Err(AppError::validation(format!(
                    "{name} is not a valid memory quantity"
                )));
            }
        }
    }

    Ok(())
}

async fn update_settings(
    State(ctx): State<SharedContext>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<common::api::Settings>> {
    let patch: SettingsPatch = serde_json::from_value(body)
        .map_err(|err| AppError::validation(format!("bad settings: {err}")))?;
    validate_patch(&patch)?;

    let log_level = patch.log_level.clone();
    let merged = ctx.registry.merge_settings(patch).await?;
    if let Some(level) = log_level {
        telemetry::set_log_level(&level);
    }
    Ok(Json(merged))
}

async fn list_notifications(
    State(ctx): State<SharedContext>,
) -> Json<Vec<common::api::Notification>> {
    Json(ctx.registry.notifications().await)
}

async fn ack_notification(
    State(ctx): State<SharedContext>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !ctx.registry.ack_notification(&id).await? {
        return Err(AppError::not_found("notification not found"));
    }
    Ok(Json(json!({ "ok": true })))
}

async fn clear_notifications(
    State(ctx): State<SharedContext>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.registry.clear_notifications().await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_metrics() -> Response {
    match telemetry::metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_validation_checks_quantities() {
        let ok = SettingsPatch {
            max_cpu_request_per_pod: Some("500m".into()),
            max_memory_request_per_pod: Some("1Gi".into()),
            ..SettingsPatch::default()
        };
        validate_patch(&ok).expect("valid quantities pass");

        let bad = SettingsPatch {
            max_cpu_request_per_pod: Some("lots".into()),
            ..SettingsPatch::default()
        };
        assert!(validate_patch(&bad).is_err());

        let cleared = SettingsPatch {
            max_cpu_request_per_pod: Some(String::new()),
            ..SettingsPatch::default()
        };
        validate_patch(&cleared).expect("empty string clears a cap");
    }

    #[test]
    fn patch_validation_checks_log_level() {
        let ok = SettingsPatch {
            log_level: Some("debug".into()),
            ..SettingsPatch::default()
        };
        validate_patch(&ok).expect("case-insensitive level");

        let bad = SettingsPatch {
            log_level: Some("TRACE2".into()),
            ..SettingsPatch::default()
        };
        assert!(validate_patch(&bad).is_err());
    }
}
