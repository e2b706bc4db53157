//! Connection handlers for the Parley server.
//!
//! Session channels speak frames over `/ws`: binary frames are
//! length-prefixed MessagePack, text frames are JSON. Replies use the
//! encoding of the last frame the session sent. A small REST surface
//! exposes history, backend switching and status.

use crate::config::Config;
use crate::metrics::{self, SessionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::{Hub, HubError, HubStatus};
use parley_protocol::frames::MessageFrame;
use parley_protocol::{
    codec, generate_message_id, Frame, ENVELOPE_VERSION, PROTOCOL_VERSION,
};
use parley_transport::BackendKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Error codes carried in `error` frames.
pub mod codes {
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_JOINED: u16 = 401;
    pub const TOO_LARGE: u16 = 413;
    pub const INTERNAL: u16 = 500;
    pub const BACKEND: u16 = 502;
}

/// Shared server state.
pub struct AppState {
    pub hub: Hub,
    pub config: Config,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the hub cannot be opened or the server fails to
/// start.
pub async fn run_server(config: Config) -> Result<()> {
    let hub = Hub::open(config.data_dir(), config.hub_settings()).await?;
    hub.on_inbound_message(|_| metrics::record_message("delivered"));
    hub.on_presence_change(|users| metrics::record_presence(users.len()));
    info!(backend = %hub.status().backend, "Hub ready");

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState {
        hub,
        config: config.clone(),
    });
    let app = router(Arc::clone(&state));
    let pruner = config
        .idle_timeout()
        .map(|timeout| tokio::spawn(prune_idle_sessions(Arc::clone(&state), timeout)));

    let listener = TcpListener::bind(addr).await?;
    info!("Parley server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(pruner) = pruner {
        pruner.abort();
    }
    state.hub.disconnect().await;
    info!("Parley server stopped");
    Ok(())
}

async fn prune_idle_sessions(state: Arc<AppState>, timeout: Duration) {
    let mut ticker = tokio::time::interval(timeout / 2);
    loop {
        ticker.tick().await;
        let evicted = state.hub.prune_idle(timeout);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Idle sessions left presence");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/chat/history", get(history_handler))
        .route("/api/chat/switch", post(switch_handler))
        .route("/api/chat/status", get(status_handler))
        .route("/api/config/info", get(info_handler))
        .with_state(state)
}

/// JSON error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        let status = match &e {
            HubError::Connection(_) | HubError::Send(_) | HubError::Backend(_) => {
                StatusCode::BAD_GATEWAY
            }
            HubError::MissingCredentials(_) => StatusCode::BAD_REQUEST,
            HubError::Store(_) | HubError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.message,
        }));
        (self.status, body).into_response()
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn info_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "envelope": ENVELOPE_VERSION.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub username: String,
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<parley_protocol::Message>>, ApiError> {
    let history = state.hub.history(&query.username).await?;
    debug!(user = %query.username, messages = history.len(), "History served");
    Ok(Json(history))
}

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub backend: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SwitchResponse {
    pub success: bool,
    pub backend: BackendKind,
}

async fn switch_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SwitchRequest>,
) -> Result<Json<SwitchResponse>, ApiError> {
    let kind: BackendKind = request
        .backend
        .parse()
        .map_err(|e: parley_transport::BackendError| {
            ApiError::new(StatusCode::BAD_REQUEST, e.to_string())
        })?;

    match state.hub.switch_backend(kind).await {
        Ok(()) => {
            metrics::record_backend_switch(kind.as_str(), "ok");
            Ok(Json(SwitchResponse {
                success: true,
                backend: kind,
            }))
        }
        Err(e) => {
            warn!(backend = %kind, error = %e, "Backend switch failed");
            metrics::record_backend_switch(kind.as_str(), "failed");
            let mut err = ApiError::from(e);
            if err.status == StatusCode::BAD_REQUEST {
                err.status = StatusCode::BAD_GATEWAY;
            }
            Err(err)
        }
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<HubStatus> {
    Json(state.hub.status())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max = state.config.max_message_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Encoding a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Binary,
    Text,
}

/// Per-session state.
struct Connection {
    session_id: String,
    username: Option<String>,
    wire: Wire,
    outbound: Option<mpsc::UnboundedReceiver<Frame>>,
}

impl Connection {
    fn new() -> Self {
        Self {
            session_id: format!("session_{}", generate_message_id()),
            username: None,
            wire: Wire::Binary,
            outbound: None,
        }
    }
}

/// What to do after an inbound frame.
#[derive(Debug, PartialEq)]
enum Outcome {
    Reply(Frame),
    Silent,
    Close,
}

async fn next_outbound(outbound: &mut Option<mpsc::UnboundedReceiver<Frame>>) -> Option<Frame> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = SessionMetricsGuard::new();
    let mut conn = Connection::new();
    debug!(session = %conn.session_id, "Session connected");

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    'session: loop {
        tokio::select! {
            biased;

            Some(frame) = next_outbound(&mut conn.outbound) => {
                if send_frame(&mut sender, &frame, conn.wire).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                let frames = match msg {
                    Some(Ok(Message::Binary(data))) => {
                        conn.wire = Wire::Binary;
                        read_buffer.extend_from_slice(&data);
                        metrics::record_frame(data.len(), "inbound");
                        let mut frames = Vec::new();
                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => frames.push(frame),
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(session = %conn.session_id, error = %e, "Undecodable frame");
                                    metrics::record_error("decode");
                                    read_buffer.clear();
                                    frames.push(Frame::error(0, codes::BAD_REQUEST, e.to_string()));
                                    break;
                                }
                            }
                        }
                        frames
                    }
                    Some(Ok(Message::Text(text))) => {
                        conn.wire = Wire::Text;
                        metrics::record_frame(text.len(), "inbound");
                        match codec::decode_json(&text) {
                            Ok(frame) => vec![frame],
                            Err(e) => {
                                metrics::record_error("decode");
                                vec![Frame::error(0, codes::BAD_REQUEST, e.to_string())]
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %conn.session_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %conn.session_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %conn.session_id, "WebSocket stream ended");
                        break;
                    }
                };

                for frame in frames {
                    // Decode failures come back as ready-made error frames.
                    if let Frame::Error { .. } = frame {
                        if send_frame(&mut sender, &frame, conn.wire).await.is_err() {
                            break 'session;
                        }
                        continue;
                    }

                    let start = Instant::now();
                    let outcome = handle_frame(frame, &mut conn, &state).await;
                    metrics::record_latency(start.elapsed().as_secs_f64());
                    match outcome {
                        Outcome::Reply(reply) => {
                            if send_frame(&mut sender, &reply, conn.wire).await.is_err() {
                                break 'session;
                            }
                        }
                        Outcome::Silent => {}
                        Outcome::Close => break 'session,
                    }
                }
            }
        }
    }

    state.hub.leave(&conn.session_id).await;
    debug!(session = %conn.session_id, "Session disconnected");
}

fn error_frame(id: u64, e: &HubError) -> Frame {
    let code = match e {
        HubError::Connection(_) | HubError::Send(_) | HubError::Backend(_) => codes::BACKEND,
        HubError::MissingCredentials(_) => codes::BAD_REQUEST,
        HubError::Store(_) | HubError::Config(_) => codes::INTERNAL,
    };
    Frame::error(id, code, e.to_string())
}

/// Handle a decoded frame.
async fn handle_frame(frame: Frame, conn: &mut Connection, state: &AppState) -> Outcome {
    let hub = &state.hub;

    if !matches!(
        frame,
        Frame::Join { .. } | Frame::Ping { .. } | Frame::Disconnect {}
    ) && conn.username.is_none()
    {
        return Outcome::Reply(Frame::error(0, codes::NOT_JOINED, "join first"));
    }
    if conn.username.is_some() {
        hub.touch(&conn.session_id);
    }

    match frame {
        Frame::Join { username, team } => {
            if username.trim().is_empty() {
                return Outcome::Reply(Frame::error(0, codes::BAD_REQUEST, "empty username"));
            }
            if conn.username.is_some() {
                hub.leave(&conn.session_id).await;
            }
            let team = team.unwrap_or_default();
            conn.outbound = Some(hub.join(&conn.session_id, &username, &team).await);
            debug!(session = %conn.session_id, user = %username, "Join");
            conn.username = Some(username);
            Outcome::Silent
        }

        Frame::Message(MessageFrame::Send(request)) => {
            let id = request.id.unwrap_or(0);
            let recipient = request.recipient.unwrap_or_default();
            match hub
                .send(
                    &request.sender,
                    &request.content,
                    request.kind,
                    request.metadata,
                    &recipient,
                )
                .await
            {
                Ok(message) => {
                    metrics::record_message("sent");
                    debug!(session = %conn.session_id, message_id = %message.id, "Message");
                    match request.id {
                        Some(id) => Outcome::Reply(Frame::ack(id)),
                        None => Outcome::Silent,
                    }
                }
                Err(e) => {
                    warn!(session = %conn.session_id, error = %e, "Send failed");
                    metrics::record_error("send");
                    Outcome::Reply(error_frame(id, &e))
                }
            }
        }

        Frame::ShareItem {
            sender,
            recipient,
            item_type,
            item_data,
        } => {
            let recipient = recipient.unwrap_or_default();
            match hub.share_item(&sender, &recipient, &item_type, item_data).await {
                Ok(_) => {
                    metrics::record_message("sent");
                    Outcome::Silent
                }
                Err(e) => {
                    metrics::record_error("send");
                    Outcome::Reply(error_frame(0, &e))
                }
            }
        }

        Frame::MarkRead { ids } => match hub.mark_read(&ids).await {
            Ok(changed) => {
                debug!(session = %conn.session_id, requested = ids.len(), changed, "Mark read");
                Outcome::Silent
            }
            Err(e) => {
                metrics::record_error("mark_read");
                Outcome::Reply(error_frame(0, &e))
            }
        },

        Frame::Reaction {
            message_id,
            emoji,
            username,
        } => match hub.add_reaction(&message_id, &emoji, &username).await {
            Ok(_) => Outcome::Silent,
            Err(e) => {
                metrics::record_error("reaction");
                Outcome::Reply(error_frame(0, &e))
            }
        },

        Frame::Typing { username, active } => {
            hub.relay_typing(&conn.session_id, &username, active);
            Outcome::Silent
        }

        Frame::Ping { timestamp } => Outcome::Reply(Frame::pong(timestamp)),

        Frame::Disconnect {} => Outcome::Close,

        other => {
            warn!(session = %conn.session_id, frame_type = ?other.frame_type(), "Unexpected frame type");
            Outcome::Reply(Frame::error(
                0,
                codes::BAD_REQUEST,
                format!("unexpected frame {:?}", other.frame_type()),
            ))
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
    wire: Wire,
) -> Result<()> {
    let message = match wire {
        Wire::Binary => Message::Binary(codec::encode(frame)?.to_vec()),
        Wire::Text => Message::Text(codec::encode_json(frame)?),
    };
    let len = match &message {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    };
    metrics::record_frame(len, "outbound");
    sender.send(message).await?;
    Ok(())
}
