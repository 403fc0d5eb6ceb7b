//! Cross-cluster HTTP reverse proxy (C9).
//!
//! A dashboard request for `/remoteapp/<id>/proxy/<port>/...` either proxies
//! straight to a local pod (executing apps) or crosses the peer channel as a
//! `proxy/http` request whose response streams back as `proxy/chunk` pushes.
//! Pods are only ever resolved through the workload label, so nothing outside
//! porpulsion-managed Deployments is reachable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use base64::Engine;
use bytes::Bytes;
use futures_util::StreamExt;
use rand::Rng;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use common::api::{methods, ProxyChunkPush, ProxyHttpRequest, Settings};

use crate::channel::ChannelError;
use crate::context::SharedContext;
use crate::telemetry;

/// Abort a stream when no chunk arrives for this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Hard ceiling on one proxied request.
const TOTAL_TIMEOUT: Duration = Duration::from_secs(300);
/// Buffered chunks per stream on the submitter side.
const STREAM_BUFFER: usize = 64;

const B64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

/// Headers never forwarded in either direction.
const HOP_BY_HOP: [&str; 10] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str()) || lower.starts_with("proxy-")
}

fn filter_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Submitter-side bookkeeping for in-flight response streams, executor-side
/// cancel flags, and per-app round-robin cursors.
#[derive(Default)]
pub struct StreamRegistry {
    /// stream_id → (peer, chunk sink). Submitter side.
    streams: Mutex<HashMap<String, (String, mpsc::Sender<ProxyChunkPush>)>>,
    /// stream_id → cancel flag. Executor side.
    active: Mutex<HashMap<String, watch::Sender<bool>>>,
    /// Round-robin cursor per app for pod selection.
    cursors: Mutex<HashMap<String, usize>>,
}

impl StreamRegistry {
    fn register(&self, stream_id: &str, peer: &str) -> mpsc::Receiver<ProxyChunkPush> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.streams
            .lock()
            .expect("stream map poisoned")
            .insert(stream_id.to_string(), (peer.to_string(), tx));
        rx
    }

    fn remove(&self, stream_id: &str) {
        self.streams
            .lock()
            .expect("stream map poisoned")
            .remove(stream_id);
    }

    /// Route an inbound `proxy/chunk` push to its waiting stream. A chunk for
    /// a stream whose reader went away cancels the remote request.
    pub fn deliver(&self, ctx: &SharedContext, push: ProxyChunkPush) {
        let entry = {
            let streams = self.streams.lock().expect("stream map poisoned");
            streams.get(&push.stream_id).cloned()
        };
        let Some((peer, tx)) = entry else {
            debug!(stream = %push.stream_id, "chunk for unknown stream; dropping");
            return;
        };
        let is_final = push.is_final;
        let stream_id = push.stream_id.clone();
        if tx.try_send(push).is_err() {
            // Reader gone or hopelessly behind: stop the remote side early.
            self.remove(&stream_id);
            let _ = ctx
                .channels
                .push(&peer, methods::CANCEL, json!({ "id": stream_id }));
            return;
        }
        if is_final {
            self.remove(&stream_id);
        }
    }

    /// Executor side: register a cancellable stream.
    fn begin_stream(&self, stream_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.active
            .lock()
            .expect("active map poisoned")
            .insert(stream_id.to_string(), tx);
        rx
    }

    fn end_stream(&self, stream_id: &str) {
        self.active
            .lock()
            .expect("active map poisoned")
            .remove(stream_id);
    }

    /// A `cancel` push names either a request id or a stream id; stop the
    /// stream when it is one of ours.
    pub fn cancel(&self, id: &str) {
        if let Some(flag) = self.active.lock().expect("active map poisoned").get(id) {
            let _ = flag.send(true);
        }
    }

    fn next_pod(&self, app_id: &str, total: usize) -> usize {
        let mut cursors = self.cursors.lock().expect("cursor map poisoned");
        let cursor = cursors.entry(app_id.to_string()).or_insert(0);
        let chosen = *cursor % total;
        *cursor = cursor.wrapping_add(1);
        chosen
    }
}

fn stream_id() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "error": message, "kind": "transport" }).to_string(),
        ))
        .unwrap_or_default()
}

// ── Submitter side ────────────────────────────────────────────

/// Handle a dashboard proxy request end to end.
#[allow(clippy::too_many_arguments)]
pub async fn proxy_dashboard_request(
    ctx: SharedContext,
    app_id: String,
    port: u16,
    method: String,
    path: String,
    query: String,
    headers: HashMap<String, String>,
    body: Bytes,
) -> Response {
    if let Some(app) = ctx.registry.get_submitted(&app_id).await {
        let Some(peer) = app.target_peer.clone() else {
            return error_response(StatusCode::BAD_GATEWAY, "app has no target peer");
        };
        return proxy_via_peer(ctx, peer, app_id, port, method, path, query, headers, body).await;
    }

    if ctx.registry.get_executing(&app_id).await.is_some() {
        // Local app: no peer hop, straight to the pod.
        return proxy_to_local_pod(&ctx, &app_id, port, &method, &path, &query, headers, body)
            .await;
    }

    error_response(StatusCode::NOT_FOUND, "app not found")
}

#[allow(clippy::too_many_arguments)]
async fn proxy_via_peer(
    ctx: SharedContext,
    peer: String,
    app_id: String,
    port: u16,
    method: String,
    path: String,
    query: String,
    headers: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let stream_id = stream_id();
    let mut rx = ctx.tunnel_streams.register(&stream_id, &peer);

    let request = ProxyHttpRequest {
        id: app_id,
        port,
        method,
        path,
        query,
        headers: filter_headers(&headers),
        body_b64: if body.is_empty() {
            String::new()
        } else {
            B64.encode(&body)
        },
        stream_id: stream_id.clone(),
    };
    let payload = match serde_json::to_value(&request) {
        Ok(payload) => payload,
        Err(err) => {
            ctx.tunnel_streams.remove(&stream_id);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
        }
    };

    if let Err(err) = ctx
        .channels
        .send(&peer, methods::PROXY_HTTP, payload)
        .await
    {
        ctx.tunnel_streams.remove(&stream_id);
        telemetry::record_tunnel_request("send_failed");
        return match err {
            ChannelError::Remote(message) if message.contains("tunnel_denied") => {
                error_response(StatusCode::FORBIDDEN, &message)
            }
            ChannelError::Remote(message) => {
                error_response(StatusCode::BAD_GATEWAY, &message)
            }
            ChannelError::Down => {
                error_response(StatusCode::GATEWAY_TIMEOUT, "channel down")
            }
            ChannelError::Timeout | ChannelError::Cancelled => {
                error_response(StatusCode::GATEWAY_TIMEOUT, &err.to_string())
            }
        };
    }

    let deadline = Instant::now() + TOTAL_TIMEOUT;

    // First chunk carries status and headers.
    let first = match tokio::time::timeout(IDLE_TIMEOUT, rx.recv()).await {
        Ok(Some(chunk)) => chunk,
        _ => {
            ctx.tunnel_streams.remove(&stream_id);
            telemetry::record_tunnel_request("idle_timeout");
            return error_response(StatusCode::GATEWAY_TIMEOUT, "tunnel idle timeout");
        }
    };

    let status = StatusCode::from_u16(first.status.unwrap_or(502))
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    if let Some(headers) = &first.headers {
        for (name, value) in filter_headers(headers) {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(&value),
            ) {
                response_headers.insert(name, value);
            }
        }
    }

    let first_bytes = Bytes::from(B64.decode(first.chunk_b64.as_bytes()).unwrap_or_default());
    let finished = first.is_final;
    if finished {
        ctx.tunnel_streams.remove(&stream_id);
    }

    let registry_ctx = ctx.clone();
    let cleanup_id = stream_id.clone();
    let stream = futures_util::stream::unfold(
        (Some(rx), Some(first_bytes), finished),
        move |(rx, pending, done)| {
            let ctx = registry_ctx.clone();
            let cleanup_id = cleanup_id.clone();
            async move {
                if let Some(bytes) = pending {
                    return Some((Ok::<Bytes, std::io::Error>(bytes), (rx, None, done)));
                }
                if done {
                    return None;
                }
                let mut rx = rx?;
                let remaining = deadline
                    .checked_duration_since(Instant::now())
                    .unwrap_or(Duration::ZERO)
                    .min(IDLE_TIMEOUT);
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some(chunk)) => {
                        let bytes =
                            Bytes::from(B64.decode(chunk.chunk_b64.as_bytes()).unwrap_or_default());
                        Some((Ok(bytes), (Some(rx), None, chunk.is_final)))
                    }
                    _ => {
                        ctx.tunnel_streams.remove(&cleanup_id);
                        Some((
                            Err(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "tunnel stream timed out",
                            )),
                            (None, None, true),
                        ))
                    }
                }
            }
        },
    );

    telemetry::record_tunnel_request("proxied");
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response_headers;
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "bad response"))
}

/// Proxy directly to a ready local pod (executing-origin apps).
#[allow(clippy::too_many_arguments)]
async fn proxy_to_local_pod(
    ctx: &SharedContext,
    app_id: &str,
    port: u16,
    method: &str,
    path: &str,
    query: &str,
    headers: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let ips = match ctx.cluster.ready_pod_ips(app_id).await {
        Ok(ips) => ips,
        Err(err) => return error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    };
    if ips.is_empty() {
        return error_response(StatusCode::BAD_GATEWAY, "no ready pods");
    }
    let target = &ips[ctx.tunnel_streams.next_pod(app_id, ips.len())];

    let upstream =
        match forward_to_pod(ctx, target, port, method, path, query, &headers, body).await {
            Ok(response) => response,
            Err(err) => return error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
        };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            response_headers.insert(name.clone(), value.clone());
        }
    }

    let stream = upstream
        .bytes_stream()
        .map(|chunk| chunk.map_err(|err| std::io::Error::other(err.to_string())));
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response_headers;
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "bad response"))
}

async fn forward_to_pod(
    ctx: &SharedContext,
    ip: &str,
    port: u16,
    method: &str,
    path: &str,
    query: &str,
    headers: &HashMap<String, String>,
    body: Bytes,
) -> anyhow::Result<reqwest::Response> {
    let method = reqwest::Method::from_bytes(method.as_bytes())?;
    let mut url = format!("http://{ip}:{port}/{}", path.trim_start_matches('/'));
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }

    let mut request = ctx.http.request(method, &url).timeout(TOTAL_TIMEOUT);
    for (name, value) in filter_headers(headers) {
        request = request.header(name, value);
    }
    if !body.is_empty() {
        request = request.body(body);
    }
    Ok(request.send().await?)
}

// ── Executor side ─────────────────────────────────────────────

fn tunnel_allowed(settings: &Settings, peer: &str, app_id: &str) -> Result<(), String> {
    if !settings.allow_inbound_tunnels {
        return Err("tunnel_denied: inbound tunnels are disabled on this agent".into());
    }
    let allowed = Settings::split_list(&settings.allowed_tunnel_peers);
    if allowed.is_empty() {
        return Ok(());
    }
    let scoped = format!("{peer}/{app_id}");
    if allowed.contains(&peer) || allowed.iter().any(|entry| *entry == scoped) {
        return Ok(());
    }
    Err(format!("tunnel_denied: peer {peer:?} may not tunnel here"))
}

/// `proxy/http` channel handler: validate, pick a pod, stream the response
/// back as `proxy/chunk` pushes. The reply confirms acceptance only.
pub async fn handle_proxy_request(
    ctx: SharedContext,
    peer: String,
    payload: serde_json::Value,
) -> Result<serde_json::Value, String> {
    let request: ProxyHttpRequest =
        serde_json::from_value(payload).map_err(|err| format!("bad payload: {err}"))?;

    let settings = ctx.registry.settings().await;
    tunnel_allowed(&settings, &peer, &request.id)?;

    if ctx.registry.get_executing(&request.id).await.is_none() {
        return Err("app not found".into());
    }

    let ips = ctx
        .cluster
        .ready_pod_ips(&request.id)
        .await
        .map_err(|err| err.to_string())?;
    if ips.is_empty() {
        return Err("no ready pods".into());
    }
    let target = ips[ctx.tunnel_streams.next_pod(&request.id, ips.len())].clone();

    let cancel = ctx.tunnel_streams.begin_stream(&request.stream_id);
    let stream_ctx = ctx.clone();
    tokio::spawn(async move {
        stream_response(stream_ctx, peer, target, request, cancel).await;
    });

    Ok(json!({ "accepted": true }))
}

fn push_chunk(ctx: &SharedContext, peer: &str, chunk: ProxyChunkPush) -> bool {
    match serde_json::to_value(&chunk) {
        Ok(payload) => ctx.channels.push(peer, methods::PROXY_CHUNK, payload).is_ok(),
        Err(_) => false,
    }
}

async fn stream_response(
    ctx: SharedContext,
    peer: String,
    pod_ip: String,
    request: ProxyHttpRequest,
    mut cancel: watch::Receiver<bool>,
) {
    let stream_id = request.stream_id.clone();
    let body = Bytes::from(B64.decode(request.body_b64.as_bytes()).unwrap_or_default());

    let upstream = forward_to_pod(
        &ctx,
        &pod_ip,
        request.port,
        &request.method,
        &request.path,
        &request.query,
        &request.headers,
        body,
    )
    .await;

    let response = match upstream {
        Ok(response) => response,
        Err(err) => {
            warn!(app = %request.id, %err, "tunnel target unreachable");
            telemetry::record_tunnel_request("upstream_error");
            push_chunk(
                &ctx,
                &peer,
                ProxyChunkPush {
                    stream_id: stream_id.clone(),
                    chunk_b64: B64.encode(err.to_string()),
                    is_final: true,
                    status: Some(502),
                    headers: Some(HashMap::new()),
                },
            );
            ctx.tunnel_streams.end_stream(&stream_id);
            return;
        }
    };

    let status = response.status().as_u16();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let mut first = Some((status, headers));
    let mut body_stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.changed() => {
                debug!(stream = %stream_id, "tunnel stream cancelled by submitter");
                break;
            }
            next = tokio::time::timeout(IDLE_TIMEOUT, body_stream.next()) => match next {
                Ok(Some(Ok(bytes))) => Some(bytes),
                Ok(Some(Err(err))) => {
                    debug!(stream = %stream_id, %err, "upstream read error");
                    None
                }
                Ok(None) => None,
                Err(_) => {
                    debug!(stream = %stream_id, "upstream idle timeout");
                    None
                }
            },
        };

        let (meta_status, meta_headers) = match first.take() {
            Some((s, h)) => (Some(s), Some(h)),
            None => (None, None),
        };
        let is_final = chunk.is_none();
        let delivered = push_chunk(
            &ctx,
            &peer,
            ProxyChunkPush {
                stream_id: stream_id.clone(),
                chunk_b64: chunk.map(|b| B64.encode(&b)).unwrap_or_default(),
                is_final,
                status: meta_status,
                headers: meta_headers,
            },
        );
        if is_final || !delivered {
            break;
        }
    }

    ctx.tunnel_streams.end_stream(&stream_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        for name in [
            "Host",
            "Connection",
            "Keep-Alive",
            "Proxy-Authorization",
            "Proxy-Anything",
            "TE",
            "Transfer-Encoding",
            "Upgrade",
            "Content-Length",
        ] {
            assert!(is_hop_by_hop(name), "{name} must be stripped");
        }
        for name in ["Accept", "Content-Type", "Authorization", "X-Request-Id"] {
            assert!(!is_hop_by_hop(name), "{name} must pass through");
        }
    }

    #[test]
    fn tunnel_allowlist_supports_peer_and_app_scopes() {
        let mut settings = Settings::default();
        tunnel_allowed(&settings, "alpha", "app1").expect("empty list allows all");

        settings.allowed_tunnel_peers = "alpha, beta/app2".into();
        tunnel_allowed(&settings, "alpha", "anything").expect("peer-wide entry");
        tunnel_allowed(&settings, "beta", "app2").expect("scoped entry");
        let err = tunnel_allowed(&settings, "beta", "app3").expect_err("other app denied");
        assert!(err.contains("tunnel_denied"));

        settings.allow_inbound_tunnels = false;
        let err = tunnel_allowed(&settings, "alpha", "app1").expect_err("switch off");
        assert!(err.contains("tunnel_denied"));
    }

    #[test]
    fn round_robin_cursor_cycles() {
        let registry = StreamRegistry::default();
        let picks: Vec<usize> = (0..4).map(|_| registry.next_pod("app", 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn filter_headers_removes_proxy_prefix() {
        let headers = HashMap::from([
            ("Proxy-Connection".to_string(), "keep-alive".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ]);
        let filtered = filter_headers(&headers);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("Accept"));
    }
}
