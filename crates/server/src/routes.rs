//! History API: the cursor-paginated read path and the authenticated write
//! path used for initial load and non-socket clients. Writes publish to the
//! room's fan-out group with no exclusion, since there is no live socket
//! authoring the change whose echo would need suppressing.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chat_api::NewMessage;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{MessageId, ReactionAction, Role, RoomId, RoomKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MessageInfo, MessagePage, MessagePayload, ServerFrame},
};

use crate::AppState;

pub type Rejection = (StatusCode, Json<ApiError>);

pub fn reject(error: ApiError) -> Rejection {
    let status = match error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::WindowExpired => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

fn internal(error: anyhow::Error) -> Rejection {
    reject(ApiError::internal(error.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub user_id: i64,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub user_id: i64,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub room_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SetRoleRequest {
    pub user_id: i64,
    #[serde(rename = "memberId")]
    pub member_id: i64,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct OpenConversationRequest {
    pub user_id: i64,
    #[serde(rename = "peerId")]
    pub peer_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub user_id: i64,
    #[serde(flatten)]
    pub message: NewMessage,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub user_id: i64,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ForwardRequest {
    pub user_id: i64,
    #[serde(rename = "targetRoomIds")]
    pub target_room_ids: Vec<RoomId>,
}

#[derive(Debug, Serialize)]
pub struct ForwardResponse {
    pub forwarded: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
pub struct ReactRequest {
    pub user_id: i64,
    pub emoji: String,
}

#[derive(Debug, Serialize)]
pub struct ReactResponse {
    pub action: ReactionAction,
}

#[derive(Debug, Serialize)]
pub struct UnreadResponse {
    pub unread: i64,
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, Rejection> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ApiError::validation("username is required")));
    }
    let user_id = state
        .api
        .storage
        .create_user(username)
        .await
        .map_err(internal)?;
    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

pub async fn create_room(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), Rejection> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(reject(ApiError::validation("room name is required")));
    }
    let room_id = state
        .api
        .storage
        .create_hub(name, UserId(req.user_id))
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(RoomResponse { room_id: room_id.0 })))
}

pub async fn join_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Json(req): Json<UserQuery>,
) -> Result<StatusCode, Rejection> {
    let room = state
        .api
        .storage
        .room(RoomId(room_id))
        .await
        .map_err(internal)?
        .filter(|room| room.is_active)
        .ok_or_else(|| reject(ApiError::not_found("room not found")))?;
    if room.kind != RoomKind::Hub {
        return Err(reject(ApiError::validation(
            "private conversations cannot be joined",
        )));
    }
    state
        .api
        .storage
        .add_membership(room.room_id, UserId(req.user_id), Role::Member)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_member_role(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Json(req): Json<SetRoleRequest>,
) -> Result<StatusCode, Rejection> {
    chat_api::set_member_role(
        &state.api,
        RoomId(room_id),
        UserId(req.user_id),
        UserId(req.member_id),
        req.role,
    )
    .await
    .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn open_conversation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenConversationRequest>,
) -> Result<Json<RoomResponse>, Rejection> {
    let room_id = chat_api::open_conversation(&state.api, UserId(req.user_id), UserId(req.peer_id))
        .await
        .map_err(reject)?;
    Ok(Json(RoomResponse { room_id: room_id.0 }))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<MessagePage>, Rejection> {
    let page = chat_api::list_messages(
        &state.api,
        RoomId(room_id),
        UserId(q.user_id),
        q.cursor.as_deref(),
        q.limit,
    )
    .await
    .map_err(reject)?;
    Ok(Json(page))
}

/// Cursor-backed unread count for the caller's inbox view.
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<UnreadResponse>, Rejection> {
    let unread = chat_api::unread_count(&state.api, RoomId(room_id), UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(UnreadResponse { unread }))
}

pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Json(req): Json<PostMessageRequest>,
) -> Result<(StatusCode, Json<MessagePayload>), Rejection> {
    let room_id = RoomId(room_id);
    let payload = chat_api::create_message(&state.api, room_id, UserId(req.user_id), req.message)
        .await
        .map_err(reject)?;

    state
        .rooms
        .publish(room_id, ServerFrame::MessageNew(payload.clone()), None)
        .await;
    Ok((StatusCode::CREATED, Json(payload)))
}

pub async fn edit_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<MessagePayload>, Rejection> {
    let payload = chat_api::edit_message(
        &state.api,
        MessageId(message_id),
        UserId(req.user_id),
        &req.text,
    )
    .await
    .map_err(reject)?;

    state
        .rooms
        .publish(payload.room_id, ServerFrame::MessageEdit(payload.clone()), None)
        .await;
    Ok(Json(payload))
}

pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, Rejection> {
    let (message_id, room_id) =
        chat_api::delete_message(&state.api, MessageId(message_id), UserId(q.user_id))
            .await
            .map_err(reject)?;

    state
        .rooms
        .publish(
            room_id,
            ServerFrame::MessageDelete {
                message_id,
                room_id,
            },
            None,
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_for_me(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<UserQuery>,
) -> Result<StatusCode, Rejection> {
    chat_api::hide_for_me(&state.api, MessageId(message_id), UserId(req.user_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn forward_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<ForwardRequest>,
) -> Result<Json<ForwardResponse>, Rejection> {
    let forwarded = chat_api::forward_message(
        &state.api,
        MessageId(message_id),
        UserId(req.user_id),
        &req.target_room_ids,
    )
    .await
    .map_err(reject)?;

    for payload in &forwarded {
        state
            .rooms
            .publish(
                payload.room_id,
                ServerFrame::MessageNew(payload.clone()),
                None,
            )
            .await;
    }
    Ok(Json(ForwardResponse { forwarded }))
}

pub async fn react(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<ReactRequest>,
) -> Result<Json<ReactResponse>, Rejection> {
    let message_id = MessageId(message_id);
    let user_id = UserId(req.user_id);
    let action = chat_api::react(&state.api, message_id, user_id, &req.emoji)
        .await
        .map_err(reject)?;

    let payload = chat_api::load_payload(&state.api, message_id)
        .await
        .map_err(reject)?;
    state
        .rooms
        .publish(
            payload.room_id,
            ServerFrame::ReactionUpdate {
                message_id,
                emoji: req.emoji.trim().to_string(),
                user_id,
                action,
            },
            None,
        )
        .await;
    Ok(Json(ReactResponse { action }))
}

pub async fn message_info(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<Json<MessageInfo>, Rejection> {
    let info = chat_api::message_info(&state.api, MessageId(message_id), UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(info))
}
