//! Room socket gateway.
//!
//! Identity, room existence and membership are all checked before the HTTP
//! upgrade, so a refused handshake surfaces as a plain status code the client
//! can read. Once upgraded, every failure is reported as an `error` frame on
//! the open socket; only transport errors close it.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use chat_api::NewMessage;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{RoomId, UserId},
    error::ApiError,
    protocol::{ClientFrame, SenderInfo, ServerFrame},
};
use tracing::{debug, info};

use crate::{
    routes::{reject, Rejection},
    rooms::ConnectionId,
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    #[serde(default)]
    pub user_id: Option<String>,
}

pub async fn room_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Query(q): Query<SocketQuery>,
) -> Result<Response, Rejection> {
    let room_id = RoomId(room_id);
    // identity failures, including an absent or garbled user_id, all take the
    // same refusal path
    let user_id = q
        .user_id
        .as_deref()
        .and_then(|raw| raw.parse::<i64>().ok())
        .map(UserId)
        .ok_or_else(|| reject(ApiError::unauthorized("missing or invalid user id")))?;

    let username = state
        .api
        .storage
        .username_for_user(user_id)
        .await
        .map_err(|e| reject(ApiError::internal(e.to_string())))?
        .ok_or_else(|| reject(ApiError::unauthorized("unknown user")))?;

    state
        .api
        .storage
        .room(room_id)
        .await
        .map_err(|e| reject(ApiError::internal(e.to_string())))?
        .filter(|room| room.is_active)
        .ok_or_else(|| reject(ApiError::not_found("room not found")))?;

    chat_api::ensure_active_membership(&state.api, room_id, user_id)
        .await
        .map_err(reject)?;

    Ok(ws.on_upgrade(move |socket| run_connection(state, socket, room_id, user_id, username)))
}

async fn run_connection(
    state: Arc<AppState>,
    socket: WebSocket,
    room_id: RoomId,
    user_id: UserId,
    username: String,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (connection_id, tx, mut rx) = state.rooms.register(room_id).await;

    info!(room_id = room_id.0, user_id = user_id.0, connection_id, "socket connected");

    state.presence.mark_online(room_id, user_id).await;
    state
        .rooms
        .publish(
            room_id,
            ServerFrame::PresenceUpdate {
                user_id,
                online: true,
                last_seen: None,
            },
            Some(connection_id),
        )
        .await;

    // Writer task: drains the connection's frame queue onto the wire. Acks
    // and broadcasts share this single ordered path.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(incoming) = ws_rx.next().await {
        let message = match incoming {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => {
                handle_text(&state, room_id, user_id, &username, connection_id, &tx, &text).await;
            }
            Message::Close(_) => break,
            // axum answers Ping with Pong at the protocol layer
            _ => {}
        }
    }

    // Cleanup runs on every exit path: transport error, close frame, or the
    // stream simply ending.
    writer.abort();
    state.rooms.deregister(room_id, connection_id).await;
    state.presence.mark_offline(room_id, user_id).await;
    let last_seen = state
        .presence
        .get(room_id, user_id)
        .await
        .and_then(|record| record.last_seen);
    state
        .rooms
        .publish(
            room_id,
            ServerFrame::PresenceUpdate {
                user_id,
                online: false,
                last_seen: last_seen.or_else(|| Some(Utc::now())),
            },
            Some(connection_id),
        )
        .await;

    info!(room_id = room_id.0, user_id = user_id.0, connection_id, "socket disconnected");
}

async fn handle_text(
    state: &Arc<AppState>,
    room_id: RoomId,
    user_id: UserId,
    username: &str,
    connection_id: ConnectionId,
    tx: &tokio::sync::mpsc::UnboundedSender<ServerFrame>,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(_) => {
            send_direct(tx, ServerFrame::Error(ApiError::validation("malformed frame")));
            return;
        }
    };

    match frame {
        ClientFrame::Ping => {
            state.presence.mark_online(room_id, user_id).await;
            send_direct(
                tx,
                ServerFrame::Pong {
                    server_time: Utc::now(),
                },
            );
        }
        ClientFrame::TypingUpdate { is_typing, name } => {
            if !state.presence.typing_allowed(room_id, user_id).await {
                debug!(room_id = room_id.0, user_id = user_id.0, "typing update rate limited");
                return;
            }
            let display_name = name.unwrap_or_else(|| username.to_string());
            state
                .rooms
                .publish(
                    room_id,
                    ServerFrame::TypingUpdate {
                        user: SenderInfo {
                            id: user_id,
                            name: display_name,
                        },
                        is_typing,
                    },
                    Some(connection_id),
                )
                .await;
        }
        ClientFrame::MessageSend {
            client_temp_id,
            text,
        } => {
            let new = NewMessage {
                text: Some(text),
                client_temp_id: Some(client_temp_id),
                ..NewMessage::default()
            };
            match chat_api::create_message(&state.api, room_id, user_id, new).await {
                Ok(payload) => {
                    send_direct(tx, ServerFrame::MessageAck(payload.clone()));
                    state
                        .rooms
                        .publish(room_id, ServerFrame::MessageNew(payload), Some(connection_id))
                        .await;
                }
                Err(error) => send_direct(tx, ServerFrame::Error(error)),
            }
        }
        ClientFrame::MessageDelivered { message_id } => {
            match chat_api::mark_delivered(&state.api, room_id, message_id, user_id).await {
                // broadcast only on first delivery; replays stay silent
                Ok(true) => {
                    state
                        .rooms
                        .publish(
                            room_id,
                            ServerFrame::MessageDelivered {
                                message_id,
                                user_id,
                            },
                            Some(connection_id),
                        )
                        .await;
                }
                Ok(false) => {}
                Err(error) => send_direct(tx, ServerFrame::Error(error)),
            }
        }
        ClientFrame::MessageSeen { message_id } => {
            match chat_api::mark_seen(&state.api, room_id, message_id, user_id).await {
                Ok(true) => {
                    state
                        .rooms
                        .publish(
                            room_id,
                            ServerFrame::MessageSeen {
                                message_id,
                                user_id,
                            },
                            Some(connection_id),
                        )
                        .await;
                }
                Ok(false) => {}
                Err(error) => send_direct(tx, ServerFrame::Error(error)),
            }
        }
        ClientFrame::Unknown => {
            send_direct(
                tx,
                ServerFrame::Error(ApiError::validation("unknown event type")),
            );
        }
    }
}

fn send_direct(tx: &tokio::sync::mpsc::UnboundedSender<ServerFrame>, frame: ServerFrame) {
    // the writer task owning the receiver may already be gone on shutdown
    let _ = tx.send(frame);
}
