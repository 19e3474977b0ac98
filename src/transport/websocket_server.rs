use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    common::types::{ConnectionId, UserId},
    protocol::IncomingMessage,
    server::{AppState, Outbound, SocketLink},
};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upgrade handler for `/`. Authorization has already been checked by the
/// middleware; a missing or non-numeric `User-Id` is rejected here before
/// anything is registered.
pub async fn websocket_handler(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(user_id) = headers
        .get("user-id")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<UserId>().ok())
    else {
        warn!("Rejected websocket upgrade: missing or invalid User-Id header");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    if let Some(name) = headers.get("client-name").and_then(|h| h.to_str().ok()) {
        info!("Incoming connection from client {} ({})", name, user_id);
    }

    let resume_key = headers
        .get("resume-key")
        .and_then(|h| h.to_str().ok())
        .filter(|k| !k.is_empty())
        .map(String::from);

    // Checked again on open; a session that expires in between starts fresh.
    let resuming = match &resume_key {
        Some(key) => state.dispatcher.can_resume(user_id, key.clone()).await,
        None => false,
    };

    let mut response = ws
        .on_upgrade(move |socket| handle_socket(socket, state, user_id, resume_key))
        .into_response();
    response.headers_mut().insert(
        "Session-Resumed",
        HeaderValue::from_static(if resuming { "true" } else { "false" }),
    );
    response
}

async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    user_id: UserId,
    resume_key: Option<String>,
) {
    let (link, end) = SocketLink::new();
    let Some(opened) = state.dispatcher.open(user_id, resume_key, link).await else {
        warn!("Dispatcher unavailable, dropping connection of client {}", user_id);
        return;
    };
    let id = opened.id;
    info!(
        "WebSocket connected: connection={} client={} resumed={}",
        id, user_id, opened.resumed
    );

    loop {
        tokio::select! {
            _ = end.cancel.cancelled() => {
                debug!("Connection {} terminated by the node", id);
                let _ = timeout(CLOSE_TIMEOUT, socket.send(Message::Close(None))).await;
                break;
            }
            Ok(outbound) = end.outbound.recv_async() => {
                let message = match outbound {
                    Outbound::Frame(text) => Message::Text(text.into()),
                    Outbound::Ping => Message::Ping(Default::default()),
                };
                if !deliver(&mut socket, &end.cancel, id, message).await {
                    break;
                }
            }
            msg = socket.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket error: connection={} err={}", id, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => forward(&state, id, text.as_bytes()),
                    Message::Binary(data) => forward(&state, id, &data),
                    Message::Pong(_) => state.dispatcher.pong(id),
                    Message::Close(frame) => {
                        debug!("Connection {} sent close {:?}", id, frame);
                        break;
                    }
                    Message::Ping(_) => {}
                }
            }
        }
    }

    state.dispatcher.closed(id, opened.socket);
}

/// Write one message unless the node cancels the socket or the peer stops
/// reading for longer than [`SEND_TIMEOUT`]. `false` ends the connection.
async fn deliver(
    socket: &mut WebSocket,
    cancel: &CancellationToken,
    id: ConnectionId,
    message: Message,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = timeout(SEND_TIMEOUT, socket.send(message)) => match sent {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Socket send error: connection={} err={}", id, e);
                false
            }
            Err(_) => {
                warn!("Connection {} stopped reading, dropping it", id);
                false
            }
        },
    }
}

fn forward(state: &AppState, id: ConnectionId, payload: &[u8]) {
    match serde_json::from_slice::<IncomingMessage>(payload) {
        Ok(message) => state.dispatcher.message(id, message),
        Err(e) => warn!("Ignoring malformed message from {}: {}", id, e),
    }
}
