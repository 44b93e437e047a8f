//! `WebSocket` transport: topic push and RPC.
//!
//! Clients connect to `GET /ws`. On connect the client is registered as a
//! session and receives the latest record of every non-empty topic, then
//! every topic record and `fit_progress` event as it is published. Text
//! frames from the client are RPC requests (`{id, event, args}`) answered
//! with `{id, ok, result | error}` on the same socket.
//!
//! If a client falls behind, lagged messages are skipped and the client
//! resumes from the most recent one.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::error::ServerError;
use crate::operations::{self, RpcReply, RpcRequest};
use crate::state::ServerState;

/// Upgrade an HTTP request to a `WebSocket` session.
///
/// # Route
///
/// `GET /ws`
pub async fn ws_session(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

/// Send `frame` as a JSON text message. Returns `false` once the client
/// is gone. Frames that cannot be encoded are skipped.
async fn send_json<T: Serialize>(sink: &mut SplitSink<WebSocket, Message>, frame: &T) -> bool {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!("Failed to serialize frame: {e}");
            return true;
        }
    };
    sink.send(Message::Text(json.into())).await.is_ok()
}

async fn handle_ws(socket: WebSocket, state: Arc<ServerState>) {
    let session_id = state.sessions.connect().await;
    let (mut sink, mut stream) = socket.split();
    let (replay, mut rx) = state.topics.connect().await;

    debug!(%session_id, replayed = replay.len(), "Replaying latest topic records");
    let mut open = true;
    for frame in &replay {
        if !send_json(&mut sink, frame).await {
            open = false;
            break;
        }
    }

    while open {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(frame) => open = send_json(&mut sink, &frame).await,
                    Err(RecvError::Lagged(n)) => {
                        debug!(%session_id, skipped = n, "WebSocket client lagged, skipping ahead");
                    }
                    Err(RecvError::Closed) => {
                        debug!(%session_id, "Broadcast channel closed, shutting down WebSocket");
                        open = false;
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_rpc(&state, text.as_str()).await;
                        open = send_json(&mut sink, &reply).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        open = sink.send(Message::Pong(data)).await.is_ok();
                    }
                    Some(Ok(Message::Close(_))) | None => open = false,
                    Some(Err(e)) => {
                        debug!(%session_id, "WebSocket error: {e}");
                        open = false;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.sessions.disconnect(session_id).await;
}

/// Decode one RPC frame and run it. A frame that does not decode gets an
/// error reply with a `null` id.
async fn handle_rpc(state: &ServerState, text: &str) -> RpcReply {
    match serde_json::from_str::<RpcRequest>(text) {
        Ok(request) => operations::dispatch(state, request).await,
        Err(e) => RpcReply::from_result(
            Value::Null,
            Err(ServerError::InvalidRequest(format!("malformed request: {e}"))),
        ),
    }
}
