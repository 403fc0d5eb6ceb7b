//! Per-peer persistent channel manager (C5).
//!
//! One authenticated WebSocket per peer carries every inter-agent
//! interaction. The manager owns the live connections, the outbound dial
//! loops with exponential backoff, request/reply correlation and the
//! newer-wins duplicate-connection rule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use base64::Engine;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{info, warn};

use common::api::{methods, ChannelState, Frame, AGENT_CA_HEADER, AGENT_NAME_HEADER};

use crate::context::AgentContext;
use crate::telemetry;

mod connection;

pub(crate) use connection::WsTransport;
use connection::ChannelCore;

/// Reconnect ladder in seconds; the last entry repeats.
const RECONNECT_LADDER: [u64; 5] = [2, 4, 8, 16, 30];
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// No live channel to the peer.
    #[error("channel down")]
    Down,
    /// The request deadline elapsed.
    #[error("request timed out")]
    Timeout,
    /// The peer replied with an error.
    #[error("remote error: {0}")]
    Remote(String),
    /// The caller gave up before a reply arrived.
    #[error("request cancelled")]
    Cancelled,
}

/// Removes the correlation entry if the request never completed, and lets the
/// peer know it can stop working on it.
struct PendingGuard {
    core: Arc<ChannelCore>,
    id: String,
    armed: bool,
}

impl PendingGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = self
            .core
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&self.id)
            .is_some();
        if removed {
            self.core
                .enqueue_push(Frame::push(methods::CANCEL, serde_json::json!({ "id": self.id })));
        }
    }
}

/// The channel manager. One per agent, shared via [`AgentContext`].
pub struct ChannelManager {
    channels: Mutex<HashMap<String, Arc<ChannelCore>>>,
    dials: Mutex<HashMap<String, watch::Sender<bool>>>,
    ctx: OnceLock<Weak<AgentContext>>,
    default_timeout: Duration,
}

impl ChannelManager {
    pub fn new(request_timeout_secs: u64) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            dials: Mutex::new(HashMap::new()),
            ctx: OnceLock::new(),
            default_timeout: Duration::from_secs(request_timeout_secs),
        }
    }

    /// Late-bind the context; the manager is constructed before the context
    /// that contains it.
    pub fn bind(&self, ctx: Weak<AgentContext>) {
        let _ = self.ctx.set(ctx);
    }

    fn context(&self) -> Option<Arc<AgentContext>> {
        self.ctx.get().and_then(Weak::upgrade)
    }

    pub fn is_connected(&self, peer: &str) -> bool {
        self.channels
            .lock()
            .expect("channel map poisoned")
            .contains_key(peer)
    }

    fn live(&self, peer: &str) -> Option<Arc<ChannelCore>> {
        self.channels
            .lock()
            .expect("channel map poisoned")
            .get(peer)
            .cloned()
    }

    /// Send a request and await the reply with the default deadline.
    pub async fn send(
        &self,
        peer: &str,
        kind: &str,
        payload: Value,
    ) -> Result<Value, ChannelError> {
        self.send_with_timeout(peer, kind, payload, self.default_timeout)
            .await
    }

    /// Send a request with an explicit deadline (the tunnel overrides it).
    ///
    /// Dropping the returned future removes the correlation entry and emits a
    /// `cancel` push so the remote handler can stop early; a request already
    /// committed to a side effect is not rolled back.
    pub async fn send_with_timeout(
        &self,
        peer: &str,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let core = self.live(peer).ok_or(ChannelError::Down)?;

        let id = request_id();
        let (tx, rx) = oneshot::channel();
        core.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id.clone(), tx);
        let guard = PendingGuard {
            core: core.clone(),
            id: id.clone(),
            armed: true,
        };

        let frame = Frame::request(&id, kind, payload);
        if core.out_tx.send(frame).await.is_err() {
            return Err(ChannelError::Down);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ChannelError::Timeout),
            Ok(Err(_)) => {
                guard.disarm();
                Err(ChannelError::Down)
            }
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
        }
    }

    /// Fire-and-forget push. Fails only when no channel is live.
    pub fn push(&self, peer: &str, kind: &str, payload: Value) -> Result<(), ChannelError> {
        let core = self.live(peer).ok_or(ChannelError::Down)?;
        core.enqueue_push(Frame::push(kind, payload));
        Ok(())
    }

    /// Install a connection as the live channel for `peer`, replacing (and
    /// closing) any older one. Newer wins on both sides, which converges in
    /// one round because the loser's close drops its remote end too.
    fn install(&self, peer: &str, core: Arc<ChannelCore>) {
        let old = self
            .channels
            .lock()
            .expect("channel map poisoned")
            .insert(peer.to_string(), core);
        if let Some(old) = old {
            info!(peer, "replacing existing channel with newer connection");
            old.signal_close();
            old.drain_pending(|| ChannelError::Down);
        }
    }

    /// Drop the map entry if `epoch` still owns it. Returns true when removed.
    fn remove_if_current(&self, peer: &str, epoch: u64) -> bool {
        let mut channels = self.channels.lock().expect("channel map poisoned");
        match channels.get(peer) {
            Some(current) if current.epoch == epoch => {
                channels.remove(peer);
                true
            }
            _ => false,
        }
    }

    /// Hand an authenticated inbound socket to the channel layer. Blocks the
    /// calling task (the WS handler) until the connection closes.
    pub(crate) async fn attach_inbound(&self, peer: &str, transport: WsTransport) {
        let Some(ctx) = self.context() else { return };
        let (core, out_rx, close_rx) = ChannelCore::new(peer.to_string());
        let epoch = core.epoch;
        self.install(peer, core.clone());
        telemetry::record_channel_connect("inbound");
        let _ = ctx
            .registry
            .set_peer_channel(peer, ChannelState::Connected)
            .await;

        connection::run_pump(transport, core, out_rx, close_rx, Arc::downgrade(&ctx)).await;

        if self.remove_if_current(peer, epoch) {
            let _ = ctx
                .registry
                .set_peer_channel(peer, ChannelState::Disconnected)
                .await;
        }
    }

    /// Start (or restart) the outbound dial loop for a peer.
    pub fn spawn_outbound(&self, peer: &str) {
        let Some(ctx) = self.context() else { return };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Some(old) = self
            .dials
            .lock()
            .expect("dial map poisoned")
            .insert(peer.to_string(), cancel_tx)
        {
            let _ = old.send(true);
        }
        let peer = peer.to_string();
        let weak = Arc::downgrade(&ctx);
        tokio::spawn(async move {
            dial_loop(weak, peer, cancel_rx).await;
        });
    }

    /// Tear down the channel and dial loop for a removed peer. Outstanding
    /// sends complete with `channel_down`.
    pub fn close_peer(&self, peer: &str) {
        if let Some(cancel) = self.dials.lock().expect("dial map poisoned").remove(peer) {
            let _ = cancel.send(true);
        }
        let removed = self
            .channels
            .lock()
            .expect("channel map poisoned")
            .remove(peer);
        if let Some(core) = removed {
            core.signal_close();
            core.drain_pending(|| ChannelError::Down);
        }
    }

    /// Best-effort goodbye push before a deliberate close.
    pub fn push_goodbye(&self, peer: &str) {
        let _ = self.push(peer, methods::PEER_GOODBYE, serde_json::json!({}));
    }
}

/// 128-bit random hex request id, unique per channel per outstanding request.
fn request_id() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

/// Map a peer base URL to its WebSocket endpoint.
fn ws_url(peer_url: &str) -> String {
    let base = peer_url.trim_end_matches('/');
    let swapped = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{swapped}/ws")
}

/// Outbound connect loop: dial, pump, back off, repeat. Exits when the peer
/// is removed or the loop is cancelled. Backoff resets to the bottom of the
/// ladder on every successful upgrade.
async fn dial_loop(weak: Weak<AgentContext>, peer: String, mut cancel: watch::Receiver<bool>) {
    let mut attempt: usize = 0;
    let mut outage_notified = false;

    loop {
        if *cancel.borrow() {
            return;
        }
        let Some(ctx) = weak.upgrade() else { return };

        let Some(record) = ctx.registry.peer(&peer).await else {
            // Peer removed; reconnection is cancelled.
            return;
        };

        // An inbound connection already serves this peer; don't fight it.
        if ctx.channels.is_connected(&peer) {
            drop(ctx);
            tokio::select! {
                _ = cancel.changed() => return,
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
            continue;
        }

        let url = ws_url(&record.url);
        match dial_once(&ctx, &url).await {
            Ok(transport) => {
                attempt = 0;
                outage_notified = false;
                info!(peer = %peer, "channel connected");
                telemetry::record_channel_connect("outbound");

                let (core, out_rx, close_rx) = ChannelCore::new(peer.clone());
                let epoch = core.epoch;
                ctx.channels.install(&peer, core.clone());
                let _ = ctx
                    .registry
                    .set_peer_channel(&peer, ChannelState::Connected)
                    .await;
                drop(ctx);

                connection::run_pump(transport, core, out_rx, close_rx, weak.clone()).await;

                if let Some(ctx) = weak.upgrade() {
                    if ctx.channels.remove_if_current(&peer, epoch) {
                        let _ = ctx
                            .registry
                            .set_peer_channel(&peer, ChannelState::Disconnected)
                            .await;
                    }
                }
            }
            Err(err) => {
                drop(ctx);
                warn!(peer = %peer, %err, "channel connect failed");
            }
        }

        if *cancel.borrow() {
            return;
        }

        let delay = RECONNECT_LADDER[attempt.min(RECONNECT_LADDER.len() - 1)];
        attempt += 1;
        telemetry::record_channel_reconnect(&peer);
        if attempt == RECONNECT_LADDER.len() && !outage_notified {
            // Fast retries exhausted; tell the operator once per outage.
            outage_notified = true;
            if let Some(ctx) = weak.upgrade() {
                ctx.registry
                    .notify(
                        common::api::NotificationLevel::Error,
                        format!("Channel unreachable: {peer}"),
                        format!(
                            "Lost connection to {peer:?} and repeated reconnects are failing. \
                             Will keep retrying."
                        ),
                    )
                    .await;
            }
        }
        tokio::select! {
            _ = cancel.changed() => return,
            _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
        }
    }
}

/// One connection attempt with the CA auth header.
async fn dial_once(ctx: &Arc<AgentContext>, url: &str) -> anyhow::Result<WsTransport> {
    let mut request = url.into_client_request()?;
    let ca_b64 = base64::engine::general_purpose::STANDARD.encode(ctx.credentials.ca_pem());
    request
        .headers_mut()
        .insert(AGENT_CA_HEADER, ca_b64.parse()?);
    request
        .headers_mut()
        .insert(AGENT_NAME_HEADER, ctx.cfg.agent_name.parse()?);

    let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| anyhow::anyhow!("websocket connect timed out"))??;
    Ok(WsTransport::Client(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_swaps_schemes_and_appends_path() {
        assert_eq!(ws_url("https://b.example"), "wss://b.example/ws");
        assert_eq!(ws_url("http://10.0.0.5:8001/"), "ws://10.0.0.5:8001/ws");
    }

    #[test]
    fn request_ids_are_128_bit_hex() {
        let id = request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, request_id());
    }

    #[test]
    fn reconnect_ladder_caps_at_thirty() {
        assert_eq!(RECONNECT_LADDER.last(), Some(&30));
        let idx = |attempt: usize| RECONNECT_LADDER[attempt.min(RECONNECT_LADDER.len() - 1)];
        assert_eq!(idx(0), 2);
        assert_eq!(idx(4), 30);
        assert_eq!(idx(99), 30);
    }
}
