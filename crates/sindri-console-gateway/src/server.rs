use crate::auth::{authenticate, Admission, AuthError, ClientKind};
use crate::backend::KvStore;
use crate::gateway::Gateway;
use crate::registry::{AgentConnection, BrowserConnection, CloseSignal, ConnHandle, UNAUTHORIZED_CLOSE_CODE};
use crate::streams;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sindri_console_core::protocol::{decode_envelope, Envelope};
use sindri_console_core::topics::ACTIVE_AGENTS_KEY;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const GOING_AWAY_CLOSE_CODE: u16 = 1001;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ws/metrics/stream", get(streams::metrics_stream_handler))
        .route("/ws/deployments/:id", get(streams::deployment_stream_handler))
        .route("/health", get(health))
        .with_state(gateway)
}

/// Local connection counts plus the cluster-wide active agent count, `null` when the kv store
/// cannot be read.
async fn health(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let (agents, browsers) = gateway.registry.counts().await;
    let active = match gateway.backends.kv.set_members(ACTIVE_AGENTS_KEY).await {
        Ok(members) => Some(members.len()),
        Err(err) => {
            warn!(event = "health_kv_error", error = %err);
            None
        }
    };
    Json(json!({
        "status": "ok",
        "agents": agents,
        "browsers": browsers,
        "activeAgents": active,
    }))
}

/// Caps what the transport buffers for one frame. Frames above `max_message_bytes` but under
/// the cap are still read and then dropped by the codec; larger ones end the connection.
pub(crate) fn limit_upgrade(ws: WebSocketUpgrade, gateway: &Gateway) -> WebSocketUpgrade {
    let cap = gateway.frame_cap();
    ws.max_message_size(cap).max_frame_size(cap)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let ws = limit_upgrade(ws, &gateway);
    match authenticate(gateway.backends.credentials.as_ref(), &headers, &query, Utc::now()).await {
        Ok(admission) => ws.on_upgrade(move |socket| async move {
            handle_socket(gateway, socket, admission, remote).await;
        }),
        Err(err) => reject(ws, "/ws", remote, err),
    }
}

/// Completes the upgrade only to close it with 4001, so clients see a WebSocket close code rather
/// than an HTTP status.
pub(crate) fn reject(ws: WebSocketUpgrade, path: &'static str, remote: SocketAddr, err: AuthError) -> Response {
    warn!(event = "auth_rejected", path = path, remote = %remote, error = %err);
    ws.on_upgrade(|mut socket| async move {
        let frame = CloseFrame {
            code: UNAUTHORIZED_CLOSE_CODE,
            reason: "unauthorized".into(),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
    })
    .into_response()
}

/// Socket plumbing shared by every endpoint: a bounded outbound queue drained by a writer task
/// with a per-write timeout, protocol pings, and close signalling.
pub(crate) struct Session {
    pub(crate) handle: ConnHandle,
    incoming: SplitStream<WebSocket>,
    close_rx: watch::Receiver<Option<CloseSignal>>,
    closing: watch::Receiver<bool>,
    writer: JoinHandle<()>,
    pinger: Option<JoinHandle<()>>,
    write_timeout: Duration,
}

impl Session {
    pub(crate) fn start(gateway: &Gateway, socket: WebSocket, conn_id: String) -> Self {
        let (sink, incoming) = socket.split();
        let (tx, rx) = mpsc::channel::<Message>(gateway.config.outbound_queue);
        let (closer, close_rx) = watch::channel(None);
        let handle = ConnHandle::new(conn_id.clone(), tx, closer);
        let write_timeout = gateway.config.write_timeout;
        let writer = tokio::spawn(writer_loop(sink, rx, close_rx.clone(), write_timeout, conn_id));
        let pinger = start_ping(handle.clone(), gateway.config.ping_interval);
        let closing = gateway.closing();
        if *closing.borrow() {
            handle.close(GOING_AWAY_CLOSE_CODE, "server shutdown");
        }
        Self {
            handle,
            incoming,
            close_rx,
            closing,
            writer,
            pinger,
            write_timeout,
        }
    }

    /// Next data frame from the peer. `None` once the peer closes, the read fails, a close was
    /// requested for this connection, or the gateway is shutting down.
    pub(crate) async fn next_frame(&mut self) -> Option<String> {
        loop {
            tokio::select! {
                biased;
                changed = self.close_rx.changed() => {
                    if changed.is_err() || self.close_rx.borrow().is_some() {
                        return None;
                    }
                }
                changed = self.closing.changed() => {
                    if changed.is_err() || *self.closing.borrow() {
                        self.handle.close(GOING_AWAY_CLOSE_CODE, "server shutdown");
                        return None;
                    }
                }
                frame = self.incoming.next() => match frame {
                    Some(Ok(Message::Text(text))) => return Some(text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => return Some(text),
                        Err(_) => {
                            warn!(event = "protocol_error", conn_id = %self.handle.conn_id, error = "binary frame is not utf-8");
                        }
                    },
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Err(err)) => {
                        debug!(event = "read_error", conn_id = %self.handle.conn_id, error = %err);
                        return None;
                    }
                },
            }
        }
    }

    pub(crate) async fn finish(self) {
        let Session {
            handle,
            mut writer,
            pinger,
            write_timeout,
            ..
        } = self;
        if let Some(pinger) = pinger {
            pinger.abort();
            let _ = pinger.await;
        }
        let conn_id = handle.conn_id.clone();
        drop(handle);
        if tokio::time::timeout(write_timeout, &mut writer).await.is_err() {
            debug!(event = "writer_abandoned", conn_id = %conn_id);
            writer.abort();
        }
    }
}

async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    mut close_rx: watch::Receiver<Option<CloseSignal>>,
    write_timeout: Duration,
    conn_id: String,
) {
    let mut close_open = true;
    loop {
        tokio::select! {
            biased;
            changed = close_rx.changed(), if close_open => {
                if changed.is_err() {
                    close_open = false;
                    continue;
                }
                let signal = close_rx.borrow().clone();
                if let Some(signal) = signal {
                    let frame = CloseFrame {
                        code: signal.code,
                        reason: signal.reason.into(),
                    };
                    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(Some(frame)))).await;
                    debug!(event = "close_sent", conn_id = %conn_id, code = signal.code);
                    return;
                }
            }
            maybe = rx.recv() => {
                let Some(msg) = maybe else {
                    break;
                };
                match tokio::time::timeout(write_timeout, sink.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(event = "write_error", conn_id = %conn_id, error = %err);
                        return;
                    }
                    Err(_) => {
                        warn!(event = "write_timeout", conn_id = %conn_id);
                        return;
                    }
                }
            }
        }
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

fn start_ping(handle: ConnHandle, every: Duration) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if handle.is_closed() {
                return;
            }
            handle.send_message(Message::Ping(Vec::new()));
        }
    }))
}

fn decode_frame(gateway: &Gateway, conn_id: &str, raw: &str) -> Option<Envelope> {
    match decode_envelope(raw.as_bytes(), gateway.config.max_message_bytes) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(event = "protocol_error", conn_id = %conn_id, error = %err);
            None
        }
    }
}

async fn handle_socket(gateway: Arc<Gateway>, socket: WebSocket, admission: Admission, remote: SocketAddr) {
    let conn_id = gateway.next_conn_id();
    let mut session = Session::start(&gateway, socket, conn_id.clone());
    let Admission { principal, kind } = admission;

    match kind {
        ClientKind::Agent { instance_id } => {
            info!(
                event = "agent_connected",
                conn_id = %conn_id,
                instance_id = %instance_id,
                remote = %remote
            );
            gateway
                .registry
                .register_agent(AgentConnection {
                    handle: session.handle.clone(),
                    instance_id: instance_id.clone(),
                    user_id: principal.user_id,
                    api_key_id: principal.api_key_id,
                    connected_at: Utc::now(),
                })
                .await;
            gateway.heartbeat.agent_connected(&instance_id).await;

            while let Some(raw) = session.next_frame().await {
                if gateway.config.debug {
                    debug!(event = "message_received", conn_id = %conn_id, raw = %raw);
                }
                if let Some(envelope) = decode_frame(&gateway, &conn_id, &raw) {
                    gateway.route_agent(&session.handle, &instance_id, envelope).await;
                }
            }

            let owned = gateway.registry.unregister_agent(&instance_id, &conn_id).await;
            let cleaned = if owned {
                gateway.agent_gone(&instance_id).await
            } else {
                true
            };
            info!(
                event = "agent_disconnected",
                conn_id = %conn_id,
                instance_id = %instance_id,
                superseded = !owned,
                cleaned = cleaned
            );
        }
        ClientKind::Browser => {
            info!(
                event = "browser_connected",
                conn_id = %conn_id,
                user_id = %principal.user_id,
                remote = %remote
            );
            gateway
                .registry
                .register_browser(BrowserConnection {
                    handle: session.handle.clone(),
                    user_id: principal.user_id,
                    api_key_id: principal.api_key_id,
                    connected_at: Utc::now(),
                    subscriptions: HashSet::new(),
                })
                .await;

            while let Some(raw) = session.next_frame().await {
                if gateway.config.debug {
                    debug!(event = "message_received", conn_id = %conn_id, raw = %raw);
                }
                if let Some(envelope) = decode_frame(&gateway, &conn_id, &raw) {
                    gateway.route_browser(&session.handle, envelope, &raw).await;
                }
            }

            gateway.registry.unregister_browser(&conn_id).await;
            info!(event = "browser_disconnected", conn_id = %conn_id);
        }
    }

    session.finish().await;
}
