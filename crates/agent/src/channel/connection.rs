//! One live WebSocket connection: the frame pump.
//!
//! A single task owns the socket and multiplexes reads, queued writes, the
//! push queue and the keepalive timer. Incoming requests are dispatched on
//! their own tasks so a slow handler never stalls the channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use common::api::{methods, Frame};

use crate::context::AgentContext;
use crate::telemetry;

use super::ChannelError;

/// App-level ping cadence.
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Two missed pongs: treat the transport as dead.
pub(crate) const PONG_DEADLINE: Duration = Duration::from_secs(45);
/// Push queue bound; overflow drops the oldest push.
pub(crate) const PUSH_QUEUE_BOUND: usize = 1024;
/// Request/reply write queue depth.
pub(crate) const REQUEST_QUEUE_BOUND: usize = 64;

static EPOCH: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_epoch() -> u64 {
    EPOCH.fetch_add(1, Ordering::Relaxed)
}

type Waiter = oneshot::Sender<Result<Value, ChannelError>>;

/// Shared state of one live channel, owned by the manager's map.
pub(crate) struct ChannelCore {
    pub peer: String,
    pub epoch: u64,
    /// Correlation map: request id → waiter.
    pub pending: Mutex<std::collections::HashMap<String, Waiter>>,
    /// Request/reply write lane.
    pub out_tx: mpsc::Sender<Frame>,
    /// Push lane: bounded, drop-oldest.
    pub pushes: Mutex<VecDeque<Frame>>,
    pub push_notify: Notify,
    pub close: watch::Sender<bool>,
}

impl ChannelCore {
    pub fn new(peer: String) -> (Arc<Self>, mpsc::Receiver<Frame>, watch::Receiver<bool>) {
        let (out_tx, out_rx) = mpsc::channel(REQUEST_QUEUE_BOUND);
        let (close, close_rx) = watch::channel(false);
        (
            Arc::new(Self {
                peer,
                epoch: next_epoch(),
                pending: Mutex::new(std::collections::HashMap::new()),
                out_tx,
                pushes: Mutex::new(VecDeque::new()),
                push_notify: Notify::new(),
                close,
            }),
            out_rx,
            close_rx,
        )
    }

    /// Queue a push, dropping the oldest one past the bound.
    pub fn enqueue_push(&self, frame: Frame) {
        let mut pushes = self.pushes.lock().expect("push queue poisoned");
        if pushes.len() >= PUSH_QUEUE_BOUND {
            pushes.pop_front();
            warn!(peer = %self.peer, "push queue full; dropping oldest push");
            telemetry::record_push_dropped(&self.peer);
        }
        pushes.push_back(frame);
        drop(pushes);
        self.push_notify.notify_one();
    }

    /// Fail every outstanding request. Called when the connection dies.
    pub fn drain_pending(&self, error: fn() -> ChannelError) {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        for (_, waiter) in pending.drain() {
            let _ = waiter.send(Err(error()));
        }
    }

    pub fn signal_close(&self) {
        let _ = self.close.send(true);
    }
}

/// Inbound WebSocket event, normalized across the two transports.
pub(crate) enum Incoming {
    Text(String),
    /// Ping/pong or binary; only refreshes the liveness clock.
    Control,
    Closed,
}

/// A WebSocket, either dialed out with tungstenite or accepted by axum.
pub(crate) enum WsTransport {
    Client(WebSocketStream<MaybeTlsStream<TcpStream>>),
    Server(axum::extract::ws::WebSocket),
}

impl WsTransport {
    pub async fn recv(&mut self) -> Incoming {
        match self {
            WsTransport::Client(ws) => match ws.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                    Incoming::Text(text.as_str().to_owned())
                }
                Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                    Incoming::Closed
                }
                Some(Ok(_)) => Incoming::Control,
                Some(Err(err)) => {
                    debug!(?err, "websocket read error");
                    Incoming::Closed
                }
            },
            WsTransport::Server(ws) => match ws.recv().await {
                Some(Ok(axum::extract::ws::Message::Text(text))) => {
                    Incoming::Text(text.as_str().to_owned())
                }
                Some(Ok(axum::extract::ws::Message::Close(_))) | None => Incoming::Closed,
                Some(Ok(_)) => Incoming::Control,
                Some(Err(err)) => {
                    debug!(?err, "websocket read error");
                    Incoming::Closed
                }
            },
        }
    }

    pub async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        match self {
            WsTransport::Client(ws) => ws
                .send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
                .await
                .map_err(Into::into),
            WsTransport::Server(ws) => ws
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .map_err(Into::into),
        }
    }

    pub async fn send_ping(&mut self) -> anyhow::Result<()> {
        match self {
            WsTransport::Client(ws) => ws
                .send(tokio_tungstenite::tungstenite::Message::Ping(Vec::new().into()))
                .await
                .map_err(Into::into),
            WsTransport::Server(ws) => ws
                .send(axum::extract::ws::Message::Ping(Vec::new().into()))
                .await
                .map_err(Into::into),
        }
    }

    pub async fn close(&mut self) {
        match self {
            WsTransport::Client(ws) => {
                let _ = ws.close(None).await;
            }
            WsTransport::Server(ws) => {
                let _ = ws.send(axum::extract::ws::Message::Close(None)).await;
            }
        }
    }
}

/// Run the frame pump until the connection dies or is replaced.
///
/// Frames are written in the order queued; replies to concurrent requests may
/// still complete out of order at the sender, which the correlation map
/// absorbs.
pub(crate) async fn run_pump(
    mut transport: WsTransport,
    core: Arc<ChannelCore>,
    mut out_rx: mpsc::Receiver<Frame>,
    mut close_rx: watch::Receiver<bool>,
    ctx: Weak<AgentContext>,
) {
    let mut last_rx = Instant::now();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.reset();

    loop {
        tokio::select! {
            _ = close_rx.changed() => {
                transport.close().await;
                break;
            }
            incoming = transport.recv() => {
                last_rx = Instant::now();
                match incoming {
                    Incoming::Text(text) => {
                        if let Some(frame) = parse_frame(&core.peer, &text) {
                            handle_frame(&core, &ctx, frame);
                        }
                    }
                    Incoming::Control => {}
                    Incoming::Closed => break,
                }
            }
            maybe = out_rx.recv() => {
                let Some(frame) = maybe else { break };
                if write_frame(&mut transport, &core.peer, frame).await.is_err() {
                    break;
                }
            }
            _ = core.push_notify.notified() => {
                let mut failed = false;
                while let Some(frame) = pop_push(&core) {
                    if write_frame(&mut transport, &core.peer, frame).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
            _ = ping.tick() => {
                if last_rx.elapsed() > PONG_DEADLINE {
                    info!(peer = %core.peer, "no traffic within pong deadline; dropping channel");
                    break;
                }
                if transport.send_ping().await.is_err() {
                    break;
                }
            }
        }
    }

    core.drain_pending(|| ChannelError::Down);
}

fn pop_push(core: &ChannelCore) -> Option<Frame> {
    core.pushes.lock().expect("push queue poisoned").pop_front()
}

async fn write_frame(
    transport: &mut WsTransport,
    peer: &str,
    frame: Frame,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(&frame)?;
    transport.send_text(text).await.map_err(|err| {
        debug!(peer, ?err, "websocket write failed");
        err
    })
}

fn parse_frame(peer: &str, text: &str) -> Option<Frame> {
    match serde_json::from_str::<Frame>(text) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(peer, %err, "bad frame on channel; dropping");
            None
        }
    }
}

/// Route one inbound frame: reply completion, request dispatch, or push.
fn handle_frame(core: &Arc<ChannelCore>, ctx: &Weak<AgentContext>, frame: Frame) {
    if frame.is_reply() {
        let Some(id) = frame.id.clone() else {
            warn!(peer = %core.peer, "reply without id; dropping");
            return;
        };
        let waiter = core.pending.lock().expect("pending map poisoned").remove(&id);
        match waiter {
            Some(waiter) => {
                let result = if frame.ok == Some(true) {
                    Ok(frame.payload)
                } else {
                    Err(ChannelError::Remote(
                        frame.error.unwrap_or_else(|| "peer error".into()),
                    ))
                };
                let _ = waiter.send(result);
            }
            None => {
                warn!(peer = %core.peer, id, "reply with no matching request; dropping");
            }
        }
        return;
    }

    let Some(ctx) = ctx.upgrade() else {
        return;
    };
    let peer = core.peer.clone();

    if let Some(id) = frame.id.clone() {
        // Request: handler runs on its own task; the reply goes through the
        // ordered write lane.
        let out = core.out_tx.clone();
        tokio::spawn(async move {
            let reply = match ctx
                .router
                .dispatch_request(ctx.clone(), &peer, &frame.kind, frame.payload)
                .await
            {
                Ok(payload) => Frame::reply_ok(id, payload),
                Err(err) => Frame::reply_err(id, err),
            };
            let _ = out.send(reply).await;
        });
        return;
    }

    if frame.kind == methods::CANCEL {
        // Best-effort: a request already committed to a side effect is not
        // rolled back, but an in-flight tunnel stream can stop early.
        if let Some(id) = frame.payload.get("id").and_then(|v| v.as_str()) {
            debug!(peer = %core.peer, id, "peer cancelled a request");
            ctx.tunnel_streams.cancel(id);
        }
        return;
    }

    tokio::spawn(async move {
        ctx.router
            .dispatch_push(ctx.clone(), &peer, &frame.kind, frame.payload)
            .await;
    });
}
