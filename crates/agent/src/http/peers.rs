//! Peer management endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use common::api::{
    ChannelState, InboundHandshake, NotificationLevel, PeerInfo, PeerStatus,
};

use crate::context::SharedContext;
use crate::handshake::{self, HandshakeError};

use super::{ApiResult, AppError};

/// Known peers plus handshakes still in flight, one flat list for the UI.
pub async fn list_peers(State(ctx): State<SharedContext>) -> Json<Vec<PeerInfo>> {
    let mut list: Vec<PeerInfo> = ctx
        .registry
        .peers()
        .await
        .iter()
        .map(|peer| peer.to_info())
        .collect();

    for pending in ctx.registry.pending_outbound().await {
        list.push(PeerInfo {
            name: pending.name,
            url: pending.url,
            ca_fingerprint: String::new(),
            status: if pending.failed {
                PeerStatus::Failed
            } else {
                PeerStatus::Connecting
            },
            channel: ChannelState::Disconnected,
            connected_at: None,
            last_error: pending.error,
        });
    }
    Json(list)
}

#[derive(Debug, Deserialize)]
pub struct ConnectBody {
    pub name: String,
    pub url: String,
    pub invite_token: String,
    pub expected_fingerprint: String,
}

pub async fn connect_peer(
    State(ctx): State<SharedContext>,
    Json(body): Json<ConnectBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.name.trim().is_empty() {
        return Err(AppError::validation("name is required"));
    }
    if body.url.trim().is_empty() {
        return Err(AppError::validation("url is required"));
    }
    if body.invite_token.trim().is_empty() {
        return Err(AppError::validation("invite_token is required"));
    }
    if body.expected_fingerprint.trim().is_empty() {
        return Err(AppError::validation("expected_fingerprint is required"));
    }
    if ctx.registry.peer(&body.name).await.is_some() {
        return Err(AppError::conflict(format!(
            "a peer named {:?} already exists",
            body.name
        )));
    }

    handshake::connect(
        ctx.clone(),
        body.name.clone(),
        body.url,
        body.invite_token,
        body.expected_fingerprint,
    )
    .await
    .map_err(|err| match &err {
        HandshakeError::TokenInvalid | HandshakeError::FingerprintMismatch => {
            AppError::trust(err.kind(), err.to_string())
        }
        HandshakeError::Collision(_) => AppError::conflict(err.to_string()),
        HandshakeError::BadCa(_) => AppError::validation(err.to_string()),
        HandshakeError::Unreachable(_) => AppError::bad_gateway(err.to_string()),
        _ => AppError::internal(err.to_string()),
    })?;

    Ok(Json(json!({ "ok": true, "peer": body.name })))
}

/// Remove a peer: say goodbye, drop the channel, fail its submitted apps.
pub async fn remove_peer(
    State(ctx): State<SharedContext>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if ctx.registry.peer(&name).await.is_none() {
        // Cancelling a still-pending outbound handshake takes the same path.
        ctx.registry.clear_outbound(&name).await;
        return Err(AppError::not_found("peer not found"));
    }

    ctx.channels.push_goodbye(&name);
    ctx.channels.close_peer(&name);
    ctx.registry.remove_peer(&name).await?;

    let affected = ctx
        .registry
        .fail_submitted_for_peer(&name, "peer removed")
        .await?;
    if !affected.is_empty() {
        ctx.registry
            .notify(
                NotificationLevel::Warn,
                format!("Peer removed: {name}"),
                format!(
                    "{} workload(s) marked Failed: {}",
                    affected.len(),
                    affected.join(", ")
                ),
            )
            .await;
    }

    info!(peer = %name, "peer removed");
    Ok(Json(json!({ "ok": true, "removed": name })))
}

pub async fn list_inbound(State(ctx): State<SharedContext>) -> Json<Vec<InboundHandshake>> {
    Json(ctx.registry.inbound_list().await)
}

/// Confirm a pending inbound handshake: the CA is already pinned, so this
/// just promotes the record and makes sure a channel comes up.
pub async fn accept_inbound(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(entry) = ctx.registry.take_inbound(&id).await else {
        return Err(AppError::not_found("request not found"));
    };

    if ctx.registry.peer(&entry.name).await.is_some() {
        ctx.registry
            .set_peer_status(&entry.name, PeerStatus::Connecting)
            .await;
        ctx.channels.spawn_outbound(&entry.name);
    }
    info!(peer = %entry.name, "inbound handshake accepted");
    Ok(Json(json!({ "ok": true, "peer": entry.name })))
}

/// Reject a pending inbound handshake and unpin the peer it created.
pub async fn reject_inbound(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(entry) = ctx.registry.take_inbound(&id).await else {
        return Err(AppError::not_found("request not found"));
    };

    ctx.channels.close_peer(&entry.name);
    ctx.registry.remove_peer(&entry.name).await?;
    info!(peer = %entry.name, "inbound handshake rejected");
    Ok(Json(json!({ "ok": true })))
}
