//! Peer-facing HTTP surface: the handshake endpoint and the WebSocket
//! upgrade. Served on the peer port, which is the only thing exposed through
//! the Ingress; the dashboard API stays internal.

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde_json::json;
use tracing::warn;

use common::api::{HandshakeRequest, AGENT_CA_HEADER, AGENT_NAME_HEADER, INVITE_TOKEN_HEADER};

use crate::channel::WsTransport;
use crate::context::SharedContext;
use crate::credentials::fingerprint_pem;
use crate::handshake::{self, HandshakeError};
use crate::telemetry;

pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/peer", post(handshake_endpoint))
        .route("/ws", get(ws_upgrade))
        .with_state(ctx)
}

fn error_body(status: StatusCode, kind: &str, message: String) -> Response {
    (status, Json(json!({ "error": message, "kind": kind }))).into_response()
}

async fn handshake_endpoint(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    Json(request): Json<HandshakeRequest>,
) -> Response {
    let token = headers
        .get(INVITE_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match handshake::respond(&ctx, request, token).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            let status = match &err {
                HandshakeError::TokenInvalid | HandshakeError::FingerprintMismatch => {
                    StatusCode::UNAUTHORIZED
                }
                HandshakeError::Collision(_) => StatusCode::CONFLICT,
                HandshakeError::BadCa(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_body(status, err.kind(), err.to_string())
        }
    }
}

/// WebSocket upgrade, authenticated by the CA fingerprint in `x-agent-ca`.
/// The header carries base64 because raw PEM newlines do not survive HTTP
/// header framing.
async fn ws_upgrade(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let presented = headers
        .get(AGENT_CA_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|b64| {
            base64::engine::general_purpose::STANDARD
                .decode(b64)
                .ok()
        })
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default();

    let claimed_name = headers
        .get(AGENT_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("?")
        .to_string();

    let fingerprint = match fingerprint_pem(&presented) {
        Ok(fingerprint) => fingerprint,
        Err(_) => {
            telemetry::record_trust_error("unknown_ca");
            warn!(name = %claimed_name, "ws upgrade rejected: missing or unparsable CA header");
            return error_body(
                StatusCode::UNAUTHORIZED,
                "unknown_ca",
                "no pinned peer matches the presented CA".into(),
            );
        }
    };

    let Some(peer) = ctx.registry.peer_by_fingerprint(&fingerprint).await else {
        telemetry::record_trust_error("unknown_ca");
        warn!(name = %claimed_name, "ws upgrade rejected: CA not pinned for any peer");
        return error_body(
            StatusCode::UNAUTHORIZED,
            "unknown_ca",
            "no pinned peer matches the presented CA".into(),
        );
    };

    let peer_name = peer.name;
    ws.on_upgrade(move |socket| async move {
        ctx.channels
            .attach_inbound(&peer_name, WsTransport::Server(socket))
            .await;
    })
}
