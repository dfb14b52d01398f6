//! Control Adapter
//!
//! Thin HTTP/WebSocket surface over the Session Manager: join/part/msg
//! commands, transfer cancellation, the info snapshot and a WebSocket that
//! streams transfer snapshots and log lines to subscribers.

use crate::irc::{wire, SessionCommand};
use crate::manager::Manager;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub log_tx: broadcast::Sender<LogLine>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/join", post(join))
        .route("/part", post(part))
        .route("/msg", post(msg))
        .route("/cancel", post(cancel))
        .route("/shutdown", post(shutdown))
        .route("/info", get(info))
        .route("/ws", get(ws_handler))
}

// ============= Request/Response Types =============

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub server: String,
    pub channel: Option<String>,
    pub channels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PartRequest {
    pub server: String,
    pub channel: Option<String>,
    pub channels: Option<Vec<String>>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MsgRequest {
    pub server: String,
    pub user: String,
    pub message: String,
    pub channel: Option<String>,
    pub channels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub server: String,
    pub nick: String,
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    fn ok() -> Json<Self> {
        Json(Self {
            status: "ok".to_string(),
            message: None,
        })
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
        }
    }
}

/// Merge the single/list channel request fields into a normalized list.
fn channel_list(channel: &Option<String>, channels: &Option<Vec<String>>) -> Vec<String> {
    let raw: Vec<String> = match (channels, channel) {
        (Some(list), _) => list.clone(),
        (None, Some(single)) => vec![single.clone()],
        (None, None) => Vec::new(),
    };
    raw.iter()
        .map(|c| wire::normalize_channel(c))
        .filter(|c| !c.is_empty())
        .collect()
}

/// Whether an outbound xdcc request to `user` via `channels` must be
/// rewritten to its ssend form.
fn rewrite_applies(
    rewrite_to_ssend: &HashSet<String>,
    ssend_map: &HashSet<String>,
    user: &str,
    channels: &[String],
) -> bool {
    channels.iter().any(|c| rewrite_to_ssend.contains(c)) || ssend_map.contains(user)
}

// ============= Handlers =============

/// Join channels on a server
/// POST /join
async fn join(State(state): State<AppState>, Json(req): Json<JoinRequest>) -> impl IntoResponse {
    let channels = channel_list(&req.channel, &req.channels);
    if channels.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(StatusResponse::error("Missing channel")),
        )
            .into_response();
    }

    match state.manager.get_or_create_session(&req.server).await {
        Ok(session) => {
            session.queue_command(SessionCommand::Join { channels });
            StatusResponse::ok().into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(StatusResponse::error(e.to_string())),
        )
            .into_response(),
    }
}

/// Part channels on a server
/// POST /part
async fn part(State(state): State<AppState>, Json(req): Json<PartRequest>) -> impl IntoResponse {
    let channels = channel_list(&req.channel, &req.channels);
    if channels.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(StatusResponse::error("Missing channel")),
        )
            .into_response();
    }

    match state.manager.get_or_create_session(&req.server).await {
        Ok(session) => {
            session.queue_command(SessionCommand::Part {
                channels,
                reason: req.reason,
            });
            StatusResponse::ok().into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(StatusResponse::error(e.to_string())),
        )
            .into_response(),
    }
}

/// Send a private message (with the xdcc ssend rewrite applied)
/// POST /msg
async fn msg(State(state): State<AppState>, Json(req): Json<MsgRequest>) -> impl IntoResponse {
    let user = req.user.trim().to_lowercase();
    let mut message = req.message.trim().to_string();
    if user.is_empty() || message.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(StatusResponse::error("Missing user or message")),
        )
            .into_response();
    }

    let channels = channel_list(&req.channel, &req.channels);
    match state.manager.get_or_create_session(&req.server).await {
        Ok(session) => {
            if rewrite_applies(
                &session.server_config().rewrite_to_ssend,
                &state.manager.config().ssend_map,
                &user,
                &channels,
            ) {
                if let Some(rewritten) = wire::rewrite_xdcc_request(&message) {
                    message = rewritten;
                }
            }

            session.queue_command(SessionCommand::Send {
                user,
                message,
                channels,
            });
            StatusResponse::ok().into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(StatusResponse::error(e.to_string())),
        )
            .into_response(),
    }
}

/// Cancel a running transfer by server, nick, and filename
/// POST /cancel
async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> impl IntoResponse {
    if state
        .manager
        .cancel_transfer(&req.server, &req.nick, &req.filename)
        .await
    {
        Json(StatusResponse {
            status: "ok".to_string(),
            message: Some("Transfer cancelled.".to_string()),
        })
        .into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(StatusResponse::error("Transfer not found or not running.")),
        )
            .into_response()
    }
}

/// Disconnect all sessions
/// POST /shutdown
async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    state.manager.shutdown().await;
    StatusResponse::ok()
}

/// Snapshot of networks and transfers
/// GET /info
async fn info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.snapshot().await)
}

// ============= WebSocket =============

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Push a transfer snapshot every second and fan out log lines; accept the
/// same slash commands the POST routes cover.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut log_rx = state.log_tx.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let transfers = state.manager.registry().snapshot().await;
                let payload = serde_json::json!({"type": "transfers", "transfers": transfers});
                if socket.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
            log = log_rx.recv() => match log {
                Ok(line) => {
                    let payload = serde_json::json!({
                        "type": "log",
                        "timestamp": line.timestamp,
                        "level": line.level,
                        "message": line.message,
                    });
                    if socket.send(Message::Text(payload.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let text = text.trim().to_string();
                    if let Some(rest) = text.strip_prefix('/') {
                        let mut parts = rest.split_whitespace().map(str::to_string);
                        let command = parts.next().unwrap_or_default();
                        let args: Vec<String> = parts.collect();
                        if let Err(e) = handle_ws_command(&command, args, &mut socket, &state).await {
                            let payload = serde_json::json!({"status": "error", "message": e});
                            let _ = socket.send(Message::Text(payload.to_string().into())).await;
                        }
                    } else {
                        tracing::info!("Received message from client: {}", text);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }
}

async fn handle_ws_command(
    command: &str,
    mut args: Vec<String>,
    socket: &mut WebSocket,
    state: &AppState,
) -> Result<(), String> {
    tracing::info!("Received command from client: {} {:?}", command, args);
    match command {
        "info" => {
            let payload = state.manager.snapshot().await;
            let message = serde_json::json!({"type": "info", "info": payload});
            socket
                .send(Message::Text(message.to_string().into()))
                .await
                .map_err(|e| e.to_string())?;
        }
        "join" | "part" => {
            if args.len() < 2 {
                return Err("Not enough arguments".to_string());
            }
            let server = args.remove(0);
            let channels: Vec<String> = args
                .iter()
                .map(|c| wire::normalize_channel(c))
                .filter(|c| !c.is_empty())
                .collect();
            let session = state
                .manager
                .get_or_create_session(&server)
                .await
                .map_err(|e| e.to_string())?;
            if command == "join" {
                session.queue_command(SessionCommand::Join { channels });
            } else {
                session.queue_command(SessionCommand::Part {
                    channels,
                    reason: None,
                });
            }
        }
        "msg" => {
            if args.len() < 3 {
                return Err("Not enough arguments".to_string());
            }
            let server = args.remove(0);
            let user = args.remove(0).trim().to_lowercase();
            let session = state
                .manager
                .get_or_create_session(&server)
                .await
                .map_err(|e| e.to_string())?;
            session.queue_command(SessionCommand::Send {
                user,
                message: args.join(" "),
                channels: Vec::new(),
            });
        }
        "msgjoin" => {
            if args.len() < 4 {
                return Err("Not enough arguments".to_string());
            }
            let server = args.remove(0);
            let channel = wire::normalize_channel(&args.remove(0));
            let user = args.remove(0).trim().to_lowercase();
            let session = state
                .manager
                .get_or_create_session(&server)
                .await
                .map_err(|e| e.to_string())?;
            session.queue_command(SessionCommand::Send {
                user,
                message: args.join(" "),
                channels: vec![channel],
            });
        }
        other => {
            return Err(format!("Unknown command: {}", other));
        }
    }
    Ok(())
}

// ============= Log fan-out =============

/// One formatted log event as sent to WebSocket subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// `tracing` layer that broadcasts log events to WebSocket subscribers.
/// The core only produces structured events; this is the single sink.
pub struct WsLogLayer {
    tx: broadcast::Sender<LogLine>,
}

impl WsLogLayer {
    pub fn new(tx: broadcast::Sender<LogLine>) -> Self {
        Self { tx }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WsLogLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut message = String::new();
        event.record(&mut MessageVisitor(&mut message));
        if message.is_empty() {
            return;
        }
        let _ = self.tx.send(LogLine {
            timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            level: event.metadata().level().to_string(),
            message,
        });
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            use std::fmt::Write;
            let _ = write!(self.0, "{:?}", value);
        }
    }
}
