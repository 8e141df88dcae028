//! Business operations over the message store.
//!
//! Every function here takes the shared [`ApiContext`], enforces membership
//! and lifecycle rules, and returns wire-ready payloads or a typed
//! [`ApiError`]. Both the History API handlers and the realtime gateway call
//! through this layer, so the two paths cannot drift apart.

use chrono::{Duration, Utc};
use serde::Deserialize;
use shared::{
    domain::{MessageId, MessageType, ReactionAction, Role, RoomId, RoomKind, UserId},
    error::ApiError,
    protocol::{
        AttachmentPayload, MessageInfo, MessagePage, MessagePayload, ReactionPayload,
        ReceiptEntry, ReplyPreview, SenderInfo,
    },
};
use storage::{Cursor, NewAttachment, Storage, StoredMessage};

/// Senders may edit their own message for this long after creation.
pub const EDIT_WINDOW_MINUTES: i64 = 20;

/// Senders may delete their own message for this long after creation.
/// Moderators and leaders are not time-limited.
pub const DELETE_WINDOW_MINUTES: i64 = 60;

pub const DEFAULT_PAGE_SIZE: u32 = 30;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, rename = "clientTempId")]
    pub client_temp_id: Option<String>,
    #[serde(default, rename = "replyToId")]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
}

pub async fn ensure_active_membership(
    ctx: &ApiContext,
    room_id: RoomId,
    user_id: UserId,
) -> Result<Role, ApiError> {
    ctx.storage
        .active_membership(room_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::forbidden("you are not a member of this room"))
}

/// Existing-or-new private room for the unordered (user, peer) pair.
pub async fn open_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    peer_id: UserId,
) -> Result<RoomId, ApiError> {
    if user_id == peer_id {
        return Err(ApiError::validation(
            "cannot open a conversation with yourself",
        ));
    }
    if ctx
        .storage
        .username_for_user(peer_id)
        .await
        .map_err(internal)?
        .is_none()
    {
        return Err(ApiError::not_found("peer not found"));
    }
    ctx.storage
        .open_private_conversation(user_id, peer_id)
        .await
        .map_err(internal)
}

/// Leader-only role grant inside a hub.
pub async fn set_member_role(
    ctx: &ApiContext,
    room_id: RoomId,
    requester: UserId,
    target: UserId,
    role: Role,
) -> Result<(), ApiError> {
    let room = ctx
        .storage
        .room(room_id)
        .await
        .map_err(internal)?
        .filter(|room| room.is_active)
        .ok_or_else(|| ApiError::not_found("room not found"))?;
    if room.kind != RoomKind::Hub {
        return Err(ApiError::validation("roles only apply to hubs"));
    }

    let requester_role = ensure_active_membership(ctx, room_id, requester).await?;
    if requester_role != Role::Leader {
        return Err(ApiError::forbidden("only the leader can change roles"));
    }

    let updated = ctx
        .storage
        .update_membership_role(room_id, target, role)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::not_found("no active membership for that user"));
    }
    Ok(())
}

pub async fn create_message(
    ctx: &ApiContext,
    room_id: RoomId,
    sender_id: UserId,
    new: NewMessage,
) -> Result<MessagePayload, ApiError> {
    ensure_active_membership(ctx, room_id, sender_id).await?;

    let text = new.text.as_deref().map(str::trim).unwrap_or_default();
    if text.is_empty() && new.attachments.is_empty() {
        return Err(ApiError::validation(
            "message needs text or at least one attachment",
        ));
    }

    if let Some(temp_id) = new.client_temp_id.as_deref() {
        if ctx
            .storage
            .find_message_by_temp_id(room_id, sender_id, temp_id)
            .await
            .map_err(internal)?
            .is_some()
        {
            return Err(ApiError::conflict("duplicate clientTempId"));
        }
    }

    if let Some(reply_to) = new.reply_to_id {
        let target = ctx
            .storage
            .message(reply_to)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::validation("replyTo message not found"))?;
        if target.room_id != room_id {
            return Err(ApiError::validation("replyTo message is in another room"));
        }
    }

    let message_type = if new.attachments.is_empty() {
        MessageType::Text
    } else {
        MessageType::Media
    };
    let body = (!text.is_empty()).then_some(text);

    let message_id = match ctx
        .storage
        .insert_message(
            room_id,
            sender_id,
            body,
            message_type,
            new.reply_to_id,
            new.client_temp_id.as_deref(),
            None,
            Utc::now(),
        )
        .await
    {
        Ok(id) => id,
        // concurrent retries can race past the precheck; the unique index
        // reports the loser
        Err(error) if storage::is_unique_violation(&error) => {
            return Err(ApiError::conflict("duplicate clientTempId"));
        }
        Err(error) => return Err(internal(error)),
    };

    for attachment in &new.attachments {
        ctx.storage
            .insert_attachment(message_id, &attachment_from_payload(attachment))
            .await
            .map_err(internal)?;
    }

    load_payload(ctx, message_id).await
}

pub async fn edit_message(
    ctx: &ApiContext,
    message_id: MessageId,
    requester: UserId,
    new_text: &str,
) -> Result<MessagePayload, ApiError> {
    let message = require_message(ctx, message_id).await?;
    if message.is_deleted() {
        return Err(ApiError::not_found("message already deleted"));
    }
    if message.sender_id != requester {
        return Err(ApiError::forbidden("only the sender can edit a message"));
    }

    let new_text = new_text.trim();
    if new_text.is_empty() {
        return Err(ApiError::validation("message text is required"));
    }

    if Utc::now() - message.created_at > Duration::minutes(EDIT_WINDOW_MINUTES) {
        return Err(ApiError::window_expired("message is no longer editable"));
    }

    let updated = ctx
        .storage
        .edit_message_body(message_id, new_text, Utc::now())
        .await
        .map_err(internal)?;
    if !updated {
        // Lost the race to a concurrent delete.
        return Err(ApiError::not_found("message already deleted"));
    }

    load_payload(ctx, message_id).await
}

pub async fn delete_message(
    ctx: &ApiContext,
    message_id: MessageId,
    requester: UserId,
) -> Result<(MessageId, RoomId), ApiError> {
    let message = require_message(ctx, message_id).await?;
    if message.is_deleted() {
        return Err(ApiError::not_found("message already deleted"));
    }

    let role = ensure_active_membership(ctx, message.room_id, requester).await?;

    let allowed = if role.can_moderate() {
        true
    } else if message.sender_id == requester {
        Utc::now() - message.created_at <= Duration::minutes(DELETE_WINDOW_MINUTES)
    } else {
        false
    };
    if !allowed {
        return Err(ApiError::forbidden("you cannot delete this message"));
    }

    let deleted = ctx
        .storage
        .soft_delete_message(message_id, Utc::now())
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(ApiError::not_found("message already deleted"));
    }

    Ok((message_id, message.room_id))
}

pub async fn hide_for_me(
    ctx: &ApiContext,
    message_id: MessageId,
    user_id: UserId,
) -> Result<(), ApiError> {
    let message = require_message(ctx, message_id).await?;
    ensure_active_membership(ctx, message.room_id, user_id).await?;
    ctx.storage
        .hide_message_for_user(message_id, user_id)
        .await
        .map_err(internal)
}

/// Deep-copies the source message (body, type, attachments) into each target
/// room the requester is an active member of. Targets without membership are
/// skipped; the call fails only when nothing was forwarded.
pub async fn forward_message(
    ctx: &ApiContext,
    source_id: MessageId,
    requester: UserId,
    target_rooms: &[RoomId],
) -> Result<Vec<MessagePayload>, ApiError> {
    let source = require_message(ctx, source_id).await?;
    if source.is_deleted() {
        return Err(ApiError::not_found("message already deleted"));
    }
    ensure_active_membership(ctx, source.room_id, requester).await?;

    let attachments = ctx
        .storage
        .attachments_for_message(source_id)
        .await
        .map_err(internal)?;

    let mut forwarded = Vec::new();
    for &target in target_rooms {
        let is_member = ctx
            .storage
            .active_membership(target, requester)
            .await
            .map_err(internal)?
            .is_some();
        if !is_member {
            continue;
        }

        let clone_id = ctx
            .storage
            .insert_message(
                target,
                requester,
                source.body.as_deref(),
                source.message_type,
                None,
                None,
                Some(source_id),
                Utc::now(),
            )
            .await
            .map_err(internal)?;

        for attachment in &attachments {
            ctx.storage
                .insert_attachment(
                    clone_id,
                    &NewAttachment {
                        attachment_type: attachment.attachment_type.clone(),
                        url: attachment.url.clone(),
                        mime_type: attachment.mime_type.clone(),
                        file_name: attachment.file_name.clone(),
                        file_size: attachment.file_size,
                        width: attachment.width,
                        height: attachment.height,
                        duration_ms: attachment.duration_ms,
                    },
                )
                .await
                .map_err(internal)?;
        }

        forwarded.push(load_payload(ctx, clone_id).await?);
    }

    if forwarded.is_empty() {
        return Err(ApiError::forbidden(
            "no target rooms you are a member of",
        ));
    }
    Ok(forwarded)
}

/// Cursor-paginated room history, oldest→newest, with the caller's hidden
/// messages filtered out. A malformed cursor token starts from the newest
/// page rather than failing.
pub async fn list_messages(
    ctx: &ApiContext,
    room_id: RoomId,
    caller: UserId,
    cursor_token: Option<&str>,
    limit: Option<u32>,
) -> Result<MessagePage, ApiError> {
    ensure_active_membership(ctx, room_id, caller).await?;

    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let cursor = cursor_token.and_then(Cursor::decode);

    // One extra row tells us whether another page exists.
    let mut rows = ctx
        .storage
        .list_room_messages(room_id, caller, limit + 1, cursor)
        .await
        .map_err(internal)?;
    let has_more = rows.len() as u32 > limit;
    rows.truncate(limit as usize);

    // Rows are newest-first; the last one anchors the next page.
    let next_cursor = if has_more {
        rows.last().map(|oldest| {
            Cursor {
                created_at: oldest.created_at,
                message_id: oldest.message_id,
            }
            .encode()
        })
    } else {
        None
    };

    rows.reverse();
    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        messages.push(build_payload(ctx, row).await?);
    }

    Ok(MessagePage {
        messages,
        next_cursor,
    })
}

pub async fn react(
    ctx: &ApiContext,
    message_id: MessageId,
    user_id: UserId,
    emoji: &str,
) -> Result<ReactionAction, ApiError> {
    let emoji = emoji.trim();
    if emoji.is_empty() {
        return Err(ApiError::validation("emoji is required"));
    }

    let message = require_message(ctx, message_id).await?;
    if message.is_deleted() {
        return Err(ApiError::not_found("message already deleted"));
    }
    ensure_active_membership(ctx, message.room_id, user_id).await?;

    ctx.storage
        .toggle_reaction(message_id, user_id, emoji)
        .await
        .map_err(internal)
}

/// Receipts are scoped to the room the caller is acting in: a `messageId`
/// from any other room is dropped (false) rather than recorded or broadcast.
pub async fn mark_delivered(
    ctx: &ApiContext,
    room_id: RoomId,
    message_id: MessageId,
    user_id: UserId,
) -> Result<bool, ApiError> {
    ensure_active_membership(ctx, room_id, user_id).await?;
    ctx.storage
        .mark_delivered(room_id, message_id, user_id, Utc::now())
        .await
        .map_err(internal)
}

pub async fn mark_seen(
    ctx: &ApiContext,
    room_id: RoomId,
    message_id: MessageId,
    user_id: UserId,
) -> Result<bool, ApiError> {
    ensure_active_membership(ctx, room_id, user_id).await?;
    ctx.storage
        .mark_seen(room_id, message_id, user_id, Utc::now())
        .await
        .map_err(internal)
}

/// Cursor-backed unread count for the caller's inbox view.
pub async fn unread_count(
    ctx: &ApiContext,
    room_id: RoomId,
    user_id: UserId,
) -> Result<i64, ApiError> {
    ensure_active_membership(ctx, room_id, user_id).await?;
    ctx.storage
        .unread_count(room_id, user_id)
        .await
        .map_err(internal)
}

/// Sender-facing receipt rollup: who the message was delivered to and who
/// has read it.
pub async fn message_info(
    ctx: &ApiContext,
    message_id: MessageId,
    requester: UserId,
) -> Result<MessageInfo, ApiError> {
    let message = require_message(ctx, message_id).await?;
    if message.sender_id != requester {
        return Err(ApiError::forbidden(
            "only the sender can view message receipts",
        ));
    }

    let receipts = ctx
        .storage
        .receipts_for_message(message_id)
        .await
        .map_err(internal)?;

    let mut delivered = Vec::new();
    let mut read = Vec::new();
    for receipt in receipts {
        if let Some(at) = receipt.delivered_at {
            delivered.push(ReceiptEntry {
                user_id: receipt.user_id,
                at,
            });
        }
        if let Some(at) = receipt.read_at {
            read.push(ReceiptEntry {
                user_id: receipt.user_id,
                at,
            });
        }
    }

    Ok(MessageInfo {
        message_id,
        delivered,
        read,
    })
}

pub async fn load_payload(
    ctx: &ApiContext,
    message_id: MessageId,
) -> Result<MessagePayload, ApiError> {
    let message = require_message(ctx, message_id).await?;
    build_payload(ctx, message).await
}

async fn require_message(
    ctx: &ApiContext,
    message_id: MessageId,
) -> Result<StoredMessage, ApiError> {
    ctx.storage
        .message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))
}

/// A deleted message is a tombstone to every viewer: no body, attachments,
/// or reactions survive serialization.
async fn build_payload(ctx: &ApiContext, message: StoredMessage) -> Result<MessagePayload, ApiError> {
    let deleted = message.is_deleted();

    let attachments = if deleted {
        Vec::new()
    } else {
        ctx.storage
            .attachments_for_message(message.message_id)
            .await
            .map_err(internal)?
            .into_iter()
            .map(|a| AttachmentPayload {
                id: Some(a.attachment_id.0),
                attachment_type: a.attachment_type,
                url: a.url,
                mime_type: a.mime_type,
                file_name: a.file_name,
                file_size: a.file_size,
                width: a.width,
                height: a.height,
                duration_ms: a.duration_ms,
            })
            .collect()
    };

    let reactions = if deleted {
        Vec::new()
    } else {
        ctx.storage
            .reactions_for_message(message.message_id)
            .await
            .map_err(internal)?
            .into_iter()
            .map(|(user_id, emoji)| ReactionPayload { emoji, user_id })
            .collect()
    };

    let reply_to = match (deleted, message.reply_to_id) {
        (false, Some(reply_id)) => ctx
            .storage
            .message(reply_id)
            .await
            .map_err(internal)?
            .map(|target| ReplyPreview {
                id: target.message_id,
                text: if target.is_deleted() {
                    String::new()
                } else {
                    target.body.unwrap_or_default()
                },
                sender_name: target.sender_name,
            }),
        _ => None,
    };

    Ok(MessagePayload {
        id: message.message_id,
        room_id: message.room_id,
        client_temp_id: message.client_temp_id,
        message_type: if deleted {
            MessageType::Text
        } else {
            message.message_type
        },
        text: if deleted {
            String::new()
        } else {
            message.body.unwrap_or_default()
        },
        sender: SenderInfo {
            id: message.sender_id,
            name: message.sender_name,
        },
        created_at: message.created_at,
        edited_at: message.edited_at,
        deleted_at: message.deleted_at,
        reply_to,
        attachments,
        reactions,
        forwarded_from_id: message.forwarded_from_id,
    })
}

fn attachment_from_payload(payload: &AttachmentPayload) -> NewAttachment {
    NewAttachment {
        attachment_type: payload.attachment_type.clone(),
        url: payload.url.clone(),
        mime_type: payload.mime_type.clone(),
        file_name: payload.file_name.clone(),
        file_size: payload.file_size,
        width: payload.width,
        height: payload.height,
        duration_ms: payload.duration_ms,
    }
}

fn internal(error: anyhow::Error) -> ApiError {
    ApiError::internal(error.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
