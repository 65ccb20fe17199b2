//! HTTP and websocket transport.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;

use tether_pty::{SessionError, SessionId, SessionInfo};

use crate::auth::{bearer_token, AuthError, Identity};
use crate::gateway::Connection;
use crate::protocol::{decode_binary, Outbound, ServerMessage};
use crate::state::AppState;
use crate::tabs;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_handler))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", delete(kill_session))
        .merge(tabs::routes())
        .with_state(state)
}

pub async fn serve(bind: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, create_router(state)).await
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/sessions
async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    require_auth(&state, &headers)?;
    Ok(Json(state.registry.list()))
}

/// DELETE /api/sessions/:id
async fn kill_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    let identity = require_auth(&state, &headers)?;
    state.registry.terminate(&id)?;
    log::info!("{} killed session {id} over http", identity.principal);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// GET /ws
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, params.token))
}

async fn handle_websocket(socket: WebSocket, state: AppState, token: Option<String>) {
    let mut conn = Connection::new(state);
    let (mut sink, mut stream) = socket.split();
    log::debug!("connection {}: opened", conn.id());

    if let Some(token) = token {
        let (reply, fatal) = match conn.authenticate(&token) {
            Ok(reply) => (reply, false),
            Err(e) => (e.to_message(), true),
        };
        if send_message(&mut sink, &reply).await.is_err() || fatal {
            let _ = sink.close().await;
            return;
        }
    }

    loop {
        tokio::select! {
            frame = stream.next() => {
                let result = match frame {
                    Some(Ok(WsMessage::Text(text))) => conn.handle_text(&text).await,
                    Some(Ok(WsMessage::Binary(data))) => conn.handle(decode_binary(data)).await,
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("connection {}: transport error: {e}", conn.id());
                        break;
                    }
                };
                let (reply, fatal) = match result {
                    Ok(Some(reply)) => (reply, false),
                    Ok(None) => continue,
                    Err(e) => {
                        log::debug!("connection {}: {e}", conn.id());
                        (e.to_message(), e.is_fatal())
                    }
                };
                if send_message(&mut sink, &reply).await.is_err() || fatal {
                    break;
                }
            }
            event = conn.next_event() => {
                let sent = match event {
                    Outbound::Output(bytes) => sink.send(WsMessage::Binary(bytes)).await,
                    Outbound::Message(msg) => send_message(&mut sink, &msg).await,
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    match conn.identity() {
        Some(identity) => log::info!("connection {}: {} disconnected", conn.id(), identity.principal),
        None => log::debug!("connection {}: closed before authenticating", conn.id()),
    }
    conn.disconnect();
}

async fn send_message(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sink.send(WsMessage::Text(json)).await,
        Err(e) => {
            log::warn!("failed to encode {msg:?}: {e}");
            Ok(())
        }
    }
}

/// Check the `Authorization: Bearer` header of an HTTP request.
pub(crate) fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = bearer_token(headers).ok_or(AuthError::Missing)?;
    Ok(state.auth.authenticate(token)?)
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized(AuthError),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Unauthorized(err)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SessionError::Geometry { .. } => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        log::error!("ledger error: {err}");
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(err) => (StatusCode::UNAUTHORIZED, err.to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
