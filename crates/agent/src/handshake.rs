//! Invite-token handshake (C4).
//!
//! The initiator posts its name, URL and CA to the responder's `/peer`
//! endpoint with the invite token in a header. The responder validates the
//! expected fingerprint against its own CA *before* consuming the token, so
//! a mistyped fingerprint never burns the invite; the initiator then
//! independently verifies the returned CA against the fingerprint the
//! operator copied out-of-band. A man-in-the-middle fails on both ends.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use common::api::{
    ChannelState, HandshakeRequest, HandshakeResponse, NotificationLevel, PeerStatus,
    INVITE_TOKEN_HEADER,
};

use crate::context::SharedContext;
use crate::credentials::{fingerprint_pem, RedeemError};
use crate::state::{InboundEntry, PeerEntry};
use crate::telemetry;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("invite_token_invalid")]
    TokenInvalid,
    #[error("fingerprint_mismatch")]
    FingerprintMismatch,
    #[error("fingerprint_collision: CA already pinned for peer {0:?}")]
    Collision(String),
    #[error("invalid CA certificate: {0}")]
    BadCa(String),
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("handshake rejected by peer: {0}")]
    Rejected(String),
    #[error("could not persist peer: {0}")]
    Persist(String),
}

impl HandshakeError {
    /// Stable kind for the `{error, kind}` wire shape.
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeError::TokenInvalid => "invite_token_invalid",
            HandshakeError::FingerprintMismatch => "fingerprint_mismatch",
            HandshakeError::Collision(_) => "fingerprint_collision",
            HandshakeError::BadCa(_) => "bad_ca",
            HandshakeError::Unreachable(_) => "peer_unreachable",
            HandshakeError::Rejected(_) => "handshake_rejected",
            HandshakeError::Persist(_) => "persist_failed",
        }
    }
}

/// Responder side of `POST /peer`.
pub async fn respond(
    ctx: &SharedContext,
    request: HandshakeRequest,
    presented_token: &str,
) -> Result<HandshakeResponse, HandshakeError> {
    // The initiator tells us which fingerprint its operator expects. If it is
    // not ours, someone is talking to the wrong agent (or through an
    // interceptor); refuse without consuming the token.
    if request.expected_fingerprint.to_lowercase() != ctx.credentials.fingerprint() {
        telemetry::record_trust_error("fingerprint_mismatch");
        telemetry::record_handshake("fingerprint_mismatch");
        ctx.registry
            .notify(
                NotificationLevel::Warn,
                "Handshake fingerprint_mismatch",
                format!(
                    "{:?} ({}) presented an expected fingerprint that is not ours.",
                    request.name, request.self_url
                ),
            )
            .await;
        return Err(HandshakeError::FingerprintMismatch);
    }

    match ctx.credentials.redeem(presented_token).await {
        Ok(()) => {}
        Err(RedeemError::Invalid) => {
            telemetry::record_trust_error("invite_token_invalid");
            telemetry::record_handshake("invite_token_invalid");
            ctx.registry
                .notify(
                    NotificationLevel::Warn,
                    "Handshake rejected",
                    format!(
                        "{:?} ({}) presented an invalid invite token.",
                        request.name, request.self_url
                    ),
                )
                .await;
            return Err(HandshakeError::TokenInvalid);
        }
        Err(RedeemError::Persist(err)) => {
            return Err(HandshakeError::Persist(err.to_string()));
        }
    }

    let fingerprint =
        fingerprint_pem(&request.ca_pem).map_err(|err| HandshakeError::BadCa(err.to_string()))?;

    if let Some(existing) = ctx.registry.peer_by_fingerprint(&fingerprint).await {
        if existing.name != request.name {
            telemetry::record_handshake("fingerprint_collision");
            return Err(HandshakeError::Collision(existing.name));
        }
    }

    let peer = PeerEntry {
        name: request.name.clone(),
        url: request.self_url.trim_end_matches('/').to_string(),
        ca_pem: request.ca_pem.clone(),
        ca_fingerprint: fingerprint.clone(),
        status: PeerStatus::AwaitingConfirmation,
        channel: ChannelState::Disconnected,
        connected_at: None,
        last_error: None,
    };
    ctx.registry
        .insert_peer(peer)
        .await
        .map_err(|err| HandshakeError::Persist(err.to_string()))?;

    ctx.registry
        .add_inbound(InboundEntry {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            name: request.name.clone(),
            url: request.self_url.clone(),
            ca_pem: request.ca_pem,
            ca_fingerprint: fingerprint,
            arrived_at: Utc::now(),
        })
        .await;

    // Dial back as well; whichever direction wins, newer-wins dedupe keeps
    // exactly one channel.
    ctx.channels.spawn_outbound(&request.name);

    telemetry::record_handshake("accepted");
    info!(peer = %request.name, url = %request.self_url, "handshake accepted; peer pinned");

    Ok(HandshakeResponse {
        name: ctx.cfg.agent_name.clone(),
        self_url: ctx.cfg.self_url.clone(),
        ca_pem: ctx.credentials.ca_pem().to_string(),
    })
}

/// Wire shape of a handshake rejection.
#[derive(serde::Deserialize)]
struct WireError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    kind: String,
}

/// Initiator side: redeem an invite at `url` and pin the result as `name`.
pub async fn connect(
    ctx: SharedContext,
    name: String,
    url: String,
    invite_token: String,
    expected_fingerprint: String,
) -> Result<(), HandshakeError> {
    let url = url.trim_end_matches('/').to_string();
    let expected_fingerprint = expected_fingerprint.to_lowercase();
    ctx.registry.begin_outbound(&name, &url).await;

    let result = exchange(&ctx, &name, &url, &invite_token, &expected_fingerprint).await;
    match &result {
        Ok(()) => {}
        Err(err) => {
            telemetry::record_handshake(err.kind());
            ctx.registry.fail_outbound(&name, err.to_string()).await;
            if matches!(err, HandshakeError::FingerprintMismatch) {
                telemetry::record_trust_error("fingerprint_mismatch");
                ctx.registry
                    .notify(
                        NotificationLevel::Warn,
                        "Handshake fingerprint_mismatch",
                        format!(
                            "The CA presented by {url} does not match the expected fingerprint. \
                             Possible interception; no peer was stored."
                        ),
                    )
                    .await;
            }
            warn!(peer = %name, %url, %err, "handshake failed");
        }
    }
    result
}

async fn exchange(
    ctx: &SharedContext,
    name: &str,
    url: &str,
    invite_token: &str,
    expected_fingerprint: &str,
) -> Result<(), HandshakeError> {
    // Bootstrap client: there is no pinned CA yet, and the peer commonly sits
    // behind an ingress with a private certificate. Authenticity comes from
    // the fingerprint check below, not from this TLS hop.
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(ctx.cfg.handshake_timeout_secs))
        .build()
        .map_err(|err| HandshakeError::Unreachable(err.to_string()))?;

    let request = HandshakeRequest {
        name: ctx.cfg.agent_name.clone(),
        self_url: ctx.cfg.self_url.clone(),
        ca_pem: ctx.credentials.ca_pem().to_string(),
        expected_fingerprint: expected_fingerprint.to_string(),
    };

    let response = client
        .post(format!("{url}/peer"))
        .header(INVITE_TOKEN_HEADER, invite_token)
        .json(&request)
        .send()
        .await
        .map_err(|err| HandshakeError::Unreachable(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let wire: WireError = response.json().await.unwrap_or(WireError {
            error: format!("peer returned {status}"),
            kind: String::new(),
        });
        return Err(match wire.kind.as_str() {
            "invite_token_invalid" => HandshakeError::TokenInvalid,
            "fingerprint_mismatch" => HandshakeError::FingerprintMismatch,
            "fingerprint_collision" => HandshakeError::Collision(wire.error),
            _ => HandshakeError::Rejected(if wire.error.is_empty() {
                format!("peer returned {status}")
            } else {
                wire.error
            }),
        });
    }

    let body: HandshakeResponse = response
        .json()
        .await
        .map_err(|err| HandshakeError::Rejected(format!("bad handshake response: {err}")))?;

    // Pin check: the CA we got must hash to the fingerprint the operator
    // copied out-of-band. On mismatch nothing is stored.
    let fingerprint =
        fingerprint_pem(&body.ca_pem).map_err(|err| HandshakeError::BadCa(err.to_string()))?;
    if fingerprint != expected_fingerprint {
        return Err(HandshakeError::FingerprintMismatch);
    }

    let peer = PeerEntry {
        name: name.to_string(),
        url: url.to_string(),
        ca_pem: body.ca_pem,
        ca_fingerprint: fingerprint,
        status: PeerStatus::Connecting,
        channel: ChannelState::Disconnected,
        connected_at: None,
        last_error: None,
    };
    ctx.registry
        .insert_peer(peer)
        .await
        .map_err(|err| HandshakeError::Persist(err.to_string()))?;

    telemetry::record_handshake("initiated");
    info!(peer = %name, %url, "peer pinned; dialing channel");
    ctx.channels.spawn_outbound(name);
    Ok(())
}
