//! Hub WebSocket + HTTP server — Axum-based operator endpoint
//!
//! Every operator socket authenticates at upgrade time, registers a
//! per-client sender with the room manager, and joins conversation
//! rooms explicitly. Persisted pipeline events arrive on the hub event
//! stream and are routed room-scoped (messages) or globally (channel
//! health). Typing and read signals are relayed peer-to-peer within a
//! room and never touch the pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use omnidesk_channels::registry::{RegistryError, RegistrySender};
use omnidesk_core::error::PipelineError;
use omnidesk_core::pipeline::IntegrationCore;
use omnidesk_core::types::{ContentType, ConversationStatus, HubEvent};

use crate::protocol::{ClientCommand, ServerEvent};
use crate::rooms::RoomManager;

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Shared state for the HTTP and WebSocket handlers
#[derive(Clone)]
pub struct HubState {
    pub core: Arc<IntegrationCore>,
    pub registry: RegistrySender,
    pub rooms: Arc<RoomManager>,
    pub auth_token: String,
    pub start_time: std::time::Instant,
}

pub struct HubServer {
    state: HubState,
    bind: SocketAddr,
}

impl HubServer {
    pub fn new(
        bind: SocketAddr,
        auth_token: String,
        core: Arc<IntegrationCore>,
        registry: RegistrySender,
    ) -> Self {
        let state = HubState {
            core,
            registry,
            rooms: Arc::new(RoomManager::new()),
            auth_token,
            start_time: std::time::Instant::now(),
        };
        Self { state, bind }
    }

    pub fn rooms(&self) -> Arc<RoomManager> {
        self.state.rooms.clone()
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/status", get(status_handler))
            .route("/api/send", post(send_handler))
            .route("/api/conversations/{id}/messages", get(history_handler))
            .route("/api/conversations/{id}/assign", post(assign_handler))
            .route("/api/conversations/{id}/status", post(conversation_status_handler))
            .route("/api/channels/{id}/reconnect", post(reconnect_handler))
            .route("/api/channels/{id}", axum::routing::delete(deregister_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Consume the pipeline's hub event stream, routing each event to
    /// the right set of sockets. Returns when cancelled or when the
    /// pipeline side closes.
    pub fn spawn_event_pump(
        &self,
        hub_rx: mpsc::Receiver<HubEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let rooms = self.state.rooms.clone();
        tokio::spawn(pump_events(rooms, hub_rx, cancel))
    }

    /// Bind and serve until cancellation.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind).await?;
        self.serve(listener, cancel).await
    }

    /// Serve on an already-bound listener (lets tests use port 0).
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("Hub listening on {}", listener.local_addr()?);
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
        Ok(())
    }
}

/// Route one stream of pipeline events to sockets: persisted messages
/// go to their conversation's room in emission order, channel health
/// goes to everyone, processing failures stay operational (logged and
/// counted, never delivered).
pub async fn pump_events(
    rooms: Arc<RoomManager>,
    mut hub_rx: mpsc::Receiver<HubEvent>,
    cancel: CancellationToken,
) {
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = hub_rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        match ev {
            HubEvent::MessagePersisted(msg) => {
                let Some(conversation_id) = msg.conversation_id.clone() else {
                    warn!("Persisted message {} lacks a conversation id", msg.id);
                    continue;
                };
                rooms
                    .broadcast_room(&conversation_id, ServerEvent::NewMessage(msg), None)
                    .await;
            }
            HubEvent::ChannelStatus { channel_id, state } => {
                rooms
                    .broadcast_all(ServerEvent::ChannelStatusChange { channel_id, state })
                    .await;
            }
            HubEvent::ProcessingFailed { channel_id, reason } => {
                warn!("Processing failed on {}: {}", channel_id, reason);
            }
            HubEvent::ConversationAssigned {
                conversation_id,
                agent_id,
            } => {
                let room = conversation_id.clone();
                rooms
                    .broadcast_room(
                        &room,
                        ServerEvent::ConversationAssigned {
                            conversation_id,
                            agent_id,
                        },
                        None,
                    )
                    .await;
            }
            HubEvent::ConversationStatusChanged {
                conversation_id,
                status,
            } => {
                let room = conversation_id.clone();
                rooms
                    .broadcast_room(
                        &room,
                        ServerEvent::ConversationStatusChange {
                            conversation_id,
                            status,
                        },
                        None,
                    )
                    .await;
            }
        }
    }
    debug!("Hub event pump finished");
}

/// Token check for HTTP requests and socket upgrades. An empty
/// configured token disables the check (local development); browsers
/// cannot set headers on WebSocket upgrades, so `?token=` is accepted
/// alongside the Authorization header.
fn check_auth(configured: &str, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    if configured.is_empty() {
        return true;
    }
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .or(query_token)
        .unwrap_or("");
    !provided.is_empty() && constant_time_eq(configured.as_bytes(), provided.as_bytes())
}

fn bearer_token(header: &str) -> Option<&str> {
    let token = header.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token) }
}

// Timing-independent comparison so a mismatch leaks nothing about the
// matching prefix length
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── HTTP handlers ──

async fn status_handler(State(state): State<HubState>) -> impl IntoResponse {
    let channels = state.registry.states().await;
    axum::Json(serde_json::json!({
        "status": "ok",
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "connectedClients": state.rooms.client_count().await,
        "channels": channels,
        "deadLetters": state.core.dead_letter_count(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    channel_id: String,
    conversation_id: String,
    content: String,
    content_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_id: String,
    status: String,
}

fn pipeline_status(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::UnknownChannel(_) | PipelineError::UnknownConversation(_) => {
            StatusCode::NOT_FOUND
        }
        PipelineError::NoProviderIdentity { .. } => StatusCode::CONFLICT,
        PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn registry_status(e: &RegistryError) -> StatusCode {
    match e {
        RegistryError::UnknownChannel(_) => StatusCode::NOT_FOUND,
        RegistryError::AlreadyRegistered(_) => StatusCode::CONFLICT,
        RegistryError::Connect(_) => StatusCode::BAD_GATEWAY,
    }
}

async fn send_handler(
    State(state): State<HubState>,
    headers: HeaderMap,
    axum::Json(req): axum::Json<SendRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if !check_auth(&state.auth_token, &headers, None) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let outcome = state
        .core
        .send_message(
            &req.channel_id,
            &req.conversation_id,
            &req.content,
            ContentType::from_string(&req.content_type),
        )
        .await
        .map_err(|e| {
            warn!("Send request failed: {}", e);
            pipeline_status(&e)
        })?;
    Ok(axum::Json(SendResponse {
        message_id: outcome.message_id,
        status: outcome.status.as_str().to_string(),
    }))
}

async fn history_handler(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, StatusCode> {
    if !check_auth(&state.auth_token, &headers, None) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_HISTORY_LIMIT);
    let messages = state
        .core
        .history(&id, limit)
        .await
        .map_err(|e| pipeline_status(&e))?;
    Ok(axum::Json(serde_json::json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignRequest {
    agent_id: String,
}

async fn assign_handler(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<AssignRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if !check_auth(&state.auth_token, &headers, None) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    state
        .core
        .assign_conversation(&id, &req.agent_id)
        .await
        .map_err(|e| pipeline_status(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ConversationStatusRequest {
    status: String,
}

async fn conversation_status_handler(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<ConversationStatusRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if !check_auth(&state.auth_token, &headers, None) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let status =
        ConversationStatus::from_string(&req.status).ok_or(StatusCode::UNPROCESSABLE_ENTITY)?;
    state
        .core
        .update_conversation_status(&id, status)
        .await
        .map_err(|e| pipeline_status(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reconnect_handler(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    if !check_auth(&state.auth_token, &headers, None) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    state.registry.reconnect(&id).await.map_err(|e| {
        warn!("Reconnect of channel {} failed: {}", id, e);
        registry_status(&e)
    })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deregister_handler(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    if !check_auth(&state.auth_token, &headers, None) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    state
        .registry
        .deregister(&id)
        .await
        .map_err(|e| registry_status(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

// ── WebSocket handler ──

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<HubState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    // Browsers cannot set headers on WebSocket upgrades, so a `?token=`
    // query parameter is accepted as well. Rejected sockets are never
    // upgraded, so they can never join a room.
    if !check_auth(&state.auth_token, &headers, params.get("token").map(String::as_str)) {
        warn!("Rejected unauthenticated socket from {}", addr);
        return StatusCode::UNAUTHORIZED.into_response();
    }

    info!("Operator socket connecting from {}", addr);
    ws.on_upgrade(move |socket| handle_ws(socket, state, addr))
        .into_response()
}

async fn handle_ws(socket: WebSocket, state: HubState, addr: SocketAddr) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.rooms.register(&socket_id, tx).await;

    // Per-client send task; events arrive from room broadcasts
    let (closed_tx, mut closed_rx) = oneshot::channel::<()>();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut closed_rx => break,
                ev = rx.recv() => {
                    let Some(ev) = ev else { break };
                    let json = match serde_json::to_string(&ev) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("Failed to serialize hub event: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Socket error from {}: {}", addr, e);
                break;
            }
        };
        // unknown event names fail to parse and are ignored
        let cmd: ClientCommand = match serde_json::from_str(&text) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!("Ignoring unparseable client event from {}: {}", addr, e);
                continue;
            }
        };
        handle_command(&state, &socket_id, cmd).await;
    }

    state.rooms.unregister(&socket_id).await;
    let _ = closed_tx.send(());
    let _ = send_task.await;
    info!("Operator socket {} disconnected", addr);
}

async fn handle_command(state: &HubState, socket_id: &str, cmd: ClientCommand) {
    match cmd {
        ClientCommand::JoinConversation { conversation_id } => {
            state.rooms.join(&conversation_id, socket_id).await;
        }
        ClientCommand::LeaveConversation { conversation_id } => {
            state.rooms.leave(&conversation_id, socket_id).await;
        }
        // Transient relays: room members only, never the sender, never
        // persisted or replayed.
        ClientCommand::Typing {
            conversation_id,
            is_typing,
        } => {
            if !state.rooms.is_member(&conversation_id, socket_id).await {
                return;
            }
            state
                .rooms
                .broadcast_room(
                    &conversation_id,
                    ServerEvent::Typing {
                        conversation_id: conversation_id.clone(),
                        agent_id: socket_id.to_string(),
                        is_typing,
                    },
                    Some(socket_id),
                )
                .await;
        }
        ClientCommand::ReadMessages {
            conversation_id,
            message_ids,
        } => {
            if !state.rooms.is_member(&conversation_id, socket_id).await {
                return;
            }
            state
                .rooms
                .broadcast_room(
                    &conversation_id,
                    ServerEvent::MessagesRead {
                        conversation_id: conversation_id.clone(),
                        agent_id: socket_id.to_string(),
                        message_ids,
                    },
                    Some(socket_id),
                )
                .await;
        }
    }
}
