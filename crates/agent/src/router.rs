//! Typed dispatch of channel frames (C6).
//!
//! Request methods return a payload or an error string that travels back as
//! the reply; push events return nothing. Unknown request types produce a
//! structured error reply; unknown pushes are dropped with a warning.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{info, warn};

use common::api::{methods, ChannelState, NotificationLevel, RemoteAppStatus, StatusPush};

use crate::context::SharedContext;
use crate::{executor, tunnel};

type RequestHandler =
    Arc<dyn Fn(SharedContext, String, Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
type PushHandler = Arc<dyn Fn(SharedContext, String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
pub struct Router {
    requests: HashMap<&'static str, RequestHandler>,
    pushes: HashMap<&'static str, PushHandler>,
}

impl Router {
    pub fn on_request<F>(&mut self, kind: &'static str, handler: F)
    where
        F: Fn(SharedContext, String, Value) -> BoxFuture<'static, Result<Value, String>>
            + Send
            + Sync
            + 'static,
    {
        self.requests.insert(kind, Arc::new(handler));
    }

    pub fn on_push<F>(&mut self, kind: &'static str, handler: F)
    where
        F: Fn(SharedContext, String, Value) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.pushes.insert(kind, Arc::new(handler));
    }

    pub async fn dispatch_request(
        &self,
        ctx: SharedContext,
        peer: &str,
        kind: &str,
        payload: Value,
    ) -> Result<Value, String> {
        match self.requests.get(kind) {
            Some(handler) => handler(ctx, peer.to_string(), payload).await,
            None => {
                warn!(peer, kind, "request with unknown type");
                Err(format!("unknown type: {kind}"))
            }
        }
    }

    pub async fn dispatch_push(&self, ctx: SharedContext, peer: &str, kind: &str, payload: Value) {
        match self.pushes.get(kind) {
            Some(handler) => handler(ctx, peer.to_string(), payload).await,
            None => {
                warn!(peer, kind, "push with unknown type; dropping");
            }
        }
    }

    /// The full method table of the agent.
    pub fn standard() -> Self {
        let mut router = Router::default();

        router.on_request(methods::PEER_PING, |_ctx, _peer, _payload| {
            Box::pin(async move { Ok(json!({ "pong": true })) })
        });
        router.on_request(methods::REMOTEAPP_CREATE, |ctx, peer, payload| {
            Box::pin(executor::handle_create(ctx, peer, payload))
        });
        router.on_request(methods::REMOTEAPP_DELETE, |ctx, peer, payload| {
            Box::pin(executor::handle_delete(ctx, peer, payload))
        });
        router.on_request(methods::REMOTEAPP_SPEC, |ctx, peer, payload| {
            Box::pin(executor::handle_spec(ctx, peer, payload))
        });
        router.on_request(methods::REMOTEAPP_SCALE, |ctx, peer, payload| {
            Box::pin(executor::handle_scale(ctx, peer, payload))
        });
        router.on_request(methods::REMOTEAPP_DETAIL, |ctx, peer, payload| {
            Box::pin(executor::handle_detail(ctx, peer, payload))
        });
        router.on_request(methods::REMOTEAPP_LOGS, |ctx, peer, payload| {
            Box::pin(executor::handle_logs(ctx, peer, payload))
        });
        router.on_request(methods::PROXY_HTTP, |ctx, peer, payload| {
            Box::pin(tunnel::handle_proxy_request(ctx, peer, payload))
        });

        router.on_push(methods::REMOTEAPP_STATUS, |ctx, peer, payload| {
            Box::pin(handle_status_push(ctx, peer, payload))
        });
        router.on_push(methods::PEER_GOODBYE, |ctx, peer, payload| {
            Box::pin(handle_goodbye(ctx, peer, payload))
        });
        router.on_push(methods::PROXY_CHUNK, |ctx, _peer, payload| {
            Box::pin(async move {
                match serde_json::from_value(payload) {
                    Ok(chunk) => ctx.tunnel_streams.deliver(&ctx, chunk),
                    Err(err) => warn!(%err, "bad proxy chunk; dropping"),
                }
            })
        });

        router
    }
}

/// `remoteapp/status`: the executor reports a transition for an app we
/// submitted.
async fn handle_status_push(ctx: SharedContext, peer: String, payload: Value) {
    let push: StatusPush = match serde_json::from_value(payload) {
        Ok(push) => push,
        Err(err) => {
            warn!(peer, %err, "bad status push; dropping");
            return;
        }
    };

    let Some(app) = ctx.registry.get_submitted(&push.id).await else {
        warn!(peer, app = %push.id, "status push for unknown submitted app");
        return;
    };
    if app.target_peer.as_deref() != Some(peer.as_str()) {
        warn!(peer, app = %push.id, "status push from a peer that does not execute this app");
        return;
    }

    let status = push.status;
    let message = push.message.clone();
    let _ = ctx
        .registry
        .update_submitted(&push.id, move |record| {
            record.status = status;
            record.message = message;
        })
        .await;
    info!(app = %push.id, status = status.as_str(), peer, "status update from executor");

    if matches!(status, RemoteAppStatus::Failed | RemoteAppStatus::Timeout) {
        ctx.registry
            .notify(
                NotificationLevel::Error,
                format!("Workload failed: {}", app.name),
                format!(
                    "{:?} on {peer} is now {}{}",
                    app.name,
                    status.as_str(),
                    push.message
                        .as_deref()
                        .map(|m| format!(": {m}"))
                        .unwrap_or_default()
                ),
            )
            .await;
    }
}

/// `peer/goodbye`: the peer is shutting down cleanly. The channel goes
/// disconnected; the peer record stays.
async fn handle_goodbye(ctx: SharedContext, peer: String, _payload: Value) {
    info!(peer, "peer said goodbye");
    let _ = ctx
        .registry
        .set_peer_channel(&peer, ChannelState::Disconnected)
        .await;
    ctx.registry
        .notify(
            NotificationLevel::Warn,
            format!("Peer disconnected: {peer}"),
            format!("{peer:?} shut down cleanly. The channel will reconnect when it returns."),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_context;
    use chrono::Utc;
    use common::api::{AppOrigin, RemoteApp, RemoteAppSpec};

    #[tokio::test]
    async fn ping_answers_pong() {
        let ctx = test_context("agent-b").await;
        let reply = ctx
            .router
            .dispatch_request(ctx.clone(), "agent-a", methods::PEER_PING, json!({}))
            .await
            .expect("pong");
        assert_eq!(reply, json!({ "pong": true }));
    }

    #[tokio::test]
    async fn unknown_request_type_is_a_structured_error() {
        let ctx = test_context("agent-b").await;
        let err = ctx
            .router
            .dispatch_request(ctx.clone(), "agent-a", "remoteapp/explode", json!({}))
            .await
            .expect_err("unknown type");
        assert_eq!(err, "unknown type: remoteapp/explode");
    }

    #[tokio::test]
    async fn status_push_updates_submitted_record() {
        let ctx = test_context("agent-a").await;
        let spec: RemoteAppSpec =
            serde_json::from_value(json!({"image": "nginx:1.25"})).expect("spec");
        ctx.registry
            .insert_submitted(RemoteApp {
                id: "abcd".into(),
                name: "web".into(),
                spec,
                status: common::api::RemoteAppStatus::Pending,
                origin: AppOrigin::Submitted,
                target_peer: Some("agent-b".into()),
                source_peer: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                message: None,
            })
            .await
            .expect("insert");

        ctx.router
            .dispatch_push(
                ctx.clone(),
                "agent-b",
                methods::REMOTEAPP_STATUS,
                json!({"id": "abcd", "status": "Ready", "updated_at": Utc::now()}),
            )
            .await;
        assert_eq!(
            ctx.registry.get_submitted("abcd").await.unwrap().status,
            common::api::RemoteAppStatus::Ready
        );

        // A push from the wrong peer is ignored.
        ctx.router
            .dispatch_push(
                ctx.clone(),
                "agent-x",
                methods::REMOTEAPP_STATUS,
                json!({"id": "abcd", "status": "Failed", "updated_at": Utc::now()}),
            )
            .await;
        assert_eq!(
            ctx.registry.get_submitted("abcd").await.unwrap().status,
            common::api::RemoteAppStatus::Ready
        );
    }

    #[tokio::test]
    async fn goodbye_keeps_the_peer_record() {
        let ctx = test_context("agent-a").await;
        ctx.registry
            .insert_peer(crate::state::PeerEntry {
                name: "agent-b".into(),
                url: "http://127.0.0.1:1".into(),
                ca_pem: "pem".into(),
                ca_fingerprint: "fp".into(),
                status: common::api::PeerStatus::Connected,
                channel: ChannelState::Connected,
                connected_at: Some(Utc::now()),
                last_error: None,
            })
            .await
            .expect("insert");

        ctx.router
            .dispatch_push(ctx.clone(), "agent-b", methods::PEER_GOODBYE, json!({}))
            .await;

        let peer = ctx.registry.peer("agent-b").await.expect("still known");
        assert_eq!(peer.channel, ChannelState::Disconnected);
    }
}
