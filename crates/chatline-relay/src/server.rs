use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, header};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chatline::protocol::{
    ChatType, Envelope, FriendAcceptEvent, FriendRequestedEvent, Frame, GroupEvent, HealthInfo,
    HistoryQuery, RecallRequest, Reply, SendRequest, Tombstone, UserId,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::auth::{TokenSigner, secret_matches};
use crate::config::RelayConfig;
use crate::directory::{Directory, MemoryDirectory, SqliteDirectory};
use crate::error::RelayError;
use crate::registry::{ConnectionHandle, Outbound};
use crate::relay::Relay;
use crate::store::{HistoryStore, MemoryHistory, MemoryOfflineQueue, OfflineQueue, SqliteStore};

/// Header the account service uses to authenticate internal events.
pub const INTERNAL_SECRET_HEADER: &str = "x-internal-secret";

/// Shared application state.
pub struct AppState {
    pub relay: Arc<Relay>,
    pub tokens: TokenSigner,
    pub internal_secret: Option<String>,
    pub outbound_buffer: usize,
}

type HttpResult<T> = Result<Json<Reply<T>>, RelayError>;

fn ok<T>(data: T) -> HttpResult<T> {
    Ok(Json(Reply::ok(data)))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, RelayError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| RelayError::InvalidRequest(e.body_text()))
}

/// Build stores and directory from config: SQLite under `data_dir`, or
/// process memory when none is set.
pub fn build_state(config: &RelayConfig) -> Result<Arc<AppState>> {
    let relay = match &config.data_dir {
        Some(dir) => {
            let directory: Arc<dyn Directory> =
                Arc::new(SqliteDirectory::open(&dir.join("directory.db"))?);
            let store = Arc::new(SqliteStore::open(
                &dir.join("messages.db"),
                config.history_limit,
            )?);
            let offline: Arc<dyn OfflineQueue> = store.clone();
            let history: Arc<dyn HistoryStore> = store;
            info!(data_dir = %dir.display(), "using sqlite storage");
            Relay::new(directory, offline, history, config.history_limit)
        }
        None => {
            warn!("no data_dir configured; directory is empty and messages are kept in memory");
            Relay::new(
                Arc::new(MemoryDirectory::new()),
                Arc::new(MemoryOfflineQueue::new()),
                Arc::new(MemoryHistory::new(config.history_limit)),
                config.history_limit,
            )
        }
    };

    Ok(Arc::new(AppState {
        relay: Arc::new(relay),
        tokens: config.token_signer(),
        internal_secret: config.internal_secret.clone(),
        outbound_buffer: config.outbound_buffer,
    }))
}

pub fn app(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/chat/send", post(chat_send))
        .route("/chat/recall", post(chat_recall))
        .route("/chat/getmessage", post(chat_getmessage))
        .route("/chat/history/{chat_type}/{id}", get(chat_history))
        .route("/internal/friend/requested", post(friend_requested))
        .route("/internal/friend/accepted", post(friend_accepted))
        .route("/internal/group/event", post(group_event))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allow_origins value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any))
}

/// Serve until ctrl-c.
pub async fn serve(config: &RelayConfig) -> Result<()> {
    let state = build_state(config)?;
    let cors = build_cors(&config.allow_origins)?;
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("chatline relay listening on {}", listener.local_addr()?);

    axum::serve(listener, app(state, cors))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

/// Start a relay in the background. Dropping or firing the sender stops it.
pub async fn spawn_relay(
    state: Arc<AppState>,
    listen: &str,
) -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind(listen)
        .await
        .context("failed to bind relay")?;
    let local_addr = listener.local_addr()?;
    let router = app(state, build_cors(&[])?);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    Ok((local_addr, shutdown_tx))
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Token from `token: <t>` or `Authorization: Bearer <t>`.
fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers.get("token").and_then(|v| v.to_str().ok()) {
        return Some(token.trim()).filter(|t| !t.is_empty());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserId, RelayError> {
    let token = token_from_headers(headers)
        .ok_or_else(|| RelayError::Unauthorized("missing token".to_string()))?;
    state.tokens.verify(token)
}

fn authorize_internal(state: &AppState, headers: &HeaderMap) -> Result<(), RelayError> {
    let expected = state
        .internal_secret
        .as_deref()
        .ok_or_else(|| RelayError::Forbidden("internal routes are disabled".to_string()))?;
    let provided = headers
        .get(INTERNAL_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !secret_matches(provided, expected) {
        return Err(RelayError::Unauthorized("invalid internal secret".to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn chat_send(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> HttpResult<Envelope> {
    let user_id = authenticate(&state, &headers)?;
    ok(state.relay.send(user_id, body(payload)?).await?)
}

async fn chat_recall(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<RecallRequest>, JsonRejection>,
) -> HttpResult<Tombstone> {
    let user_id = authenticate(&state, &headers)?;
    ok(state.relay.recall(user_id, body(payload)?).await?)
}

async fn chat_getmessage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResult<Vec<Frame>> {
    let user_id = authenticate(&state, &headers)?;
    ok(state.relay.replay(user_id).await?)
}

async fn chat_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((chat_type, id)): Path<(ChatType, i64)>,
    Query(query): Query<HistoryQuery>,
) -> HttpResult<Vec<Envelope>> {
    let user_id = authenticate(&state, &headers)?;
    ok(state
        .relay
        .history(user_id, chat_type, id, query.limit)
        .await?)
}

async fn friend_requested(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<FriendRequestedEvent>, JsonRejection>,
) -> HttpResult<bool> {
    authorize_internal(&state, &headers)?;
    let event = body(payload)?;
    ok(state.relay.friend_requested(event.user_id).await)
}

async fn friend_accepted(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<FriendAcceptEvent>, JsonRejection>,
) -> HttpResult<[Envelope; 2]> {
    authorize_internal(&state, &headers)?;
    ok(state.relay.friend_accepted(body(payload)?).await?)
}

async fn group_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<GroupEvent>, JsonRejection>,
) -> HttpResult<Envelope> {
    authorize_internal(&state, &headers)?;
    ok(state.relay.group_event(body(payload)?).await?)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Reply<HealthInfo>> {
    Json(Reply::ok(HealthInfo {
        online: state.relay.online_count(),
    }))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// `GET /ws?token=...`. A rejected handshake still upgrades so the client
/// receives the reason as a `fail` frame before the close.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
) -> Response {
    let admitted = admit(&state, params.token.as_deref()).await;
    ws.on_upgrade(move |socket| async move {
        match admitted {
            Ok(user_id) => handle_socket(socket, state, user_id).await,
            Err(e) => reject_socket(socket, e).await,
        }
    })
}

async fn admit(state: &AppState, token: Option<&str>) -> Result<UserId, RelayError> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RelayError::Unauthorized("missing token".to_string()))?;
    let user_id = state.tokens.verify(token)?;
    Ok(state.relay.admit(user_id).await?.id)
}

async fn reject_socket(mut socket: WebSocket, reason: RelayError) {
    debug!(error = %reason, "websocket handshake rejected");
    if let Ok(text) = serde_json::to_string(&Frame::fail(reason.public_message())) {
        let _ = socket.send(Message::text(text)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

/// Handle one authenticated connection.
///
/// A writer task drains the outbound channel into the socket; the read loop
/// only watches for close. Either side ending tears the session down.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: UserId) {
    let (mut sink, mut stream) = socket.split();
    let (handle, outbound) = ConnectionHandle::channel(state.outbound_buffer);
    let connection_id = handle.id();
    let Outbound { mut rx, close } = outbound;

    state.relay.connect(user_id, handle);

    let writer_close = close.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = send_frame(&mut sink, &frame).await {
                        debug!(user_id, connection_id, error = %e, "ws write failed");
                        break;
                    }
                }
                _ = writer_close.cancelled() => {
                    // Flush frames queued before the close, eviction notice included.
                    while let Ok(frame) = rx.try_recv() {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(user_id, connection_id, error = %e, "ws read error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    state.relay.disconnect(user_id, connection_id);
    close.cancel();
    let _ = writer.await;
}
