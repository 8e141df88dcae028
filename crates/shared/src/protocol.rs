use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, MessageType, ReactionAction, RoomId, UserId},
    error::ApiError,
};

/// Frames a client may send over the room socket.
///
/// Anything that does not match a known `type` deserializes to `Unknown`;
/// the gateway answers those with an `error` frame and keeps the connection
/// open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "typing:update")]
    TypingUpdate {
        #[serde(rename = "isTyping")]
        is_typing: bool,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(rename = "message:send")]
    MessageSend {
        #[serde(rename = "clientTempId")]
        client_temp_id: String,
        text: String,
    },
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },
    #[serde(rename = "message:seen")]
    MessageSeen {
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerFrame {
    #[serde(rename = "pong")]
    Pong {
        #[serde(rename = "serverTime")]
        server_time: DateTime<Utc>,
    },
    #[serde(rename = "presence:update")]
    PresenceUpdate {
        #[serde(rename = "userId")]
        user_id: UserId,
        online: bool,
        #[serde(rename = "lastSeen")]
        last_seen: Option<DateTime<Utc>>,
    },
    #[serde(rename = "typing:update")]
    TypingUpdate {
        user: SenderInfo,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    #[serde(rename = "message:ack")]
    MessageAck(MessagePayload),
    #[serde(rename = "message:new")]
    MessageNew(MessagePayload),
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    #[serde(rename = "message:seen")]
    MessageSeen {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    #[serde(rename = "message:edit")]
    MessageEdit(MessagePayload),
    #[serde(rename = "message:delete")]
    MessageDelete {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    #[serde(rename = "reaction:update")]
    ReactionUpdate {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        emoji: String,
        #[serde(rename = "userId")]
        user_id: UserId,
        action: ReactionAction,
    },
    #[serde(rename = "error")]
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderInfo {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: MessageId,
    pub text: String,
    #[serde(rename = "senderName")]
    pub sender_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(rename = "type")]
    pub attachment_type: String,
    pub url: String,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, rename = "fileName", skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, rename = "fileSize", skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(default, rename = "durationMs", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub emoji: String,
    #[serde(rename = "userId")]
    pub user_id: UserId,
}

/// The message shape every surface (ack, fan-out, history page) emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    #[serde(default, rename = "clientTempId", skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    pub text: String,
    pub sender: SenderInfo,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "editedAt")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(rename = "deletedAt")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(rename = "replyTo")]
    pub reply_to: Option<ReplyPreview>,
    pub attachments: Vec<AttachmentPayload>,
    pub reactions: Vec<ReactionPayload>,
    #[serde(
        default,
        rename = "forwardedFromId",
        skip_serializing_if = "Option::is_none"
    )]
    pub forwarded_from_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessagePayload>,
    #[serde(rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptEntry {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub at: DateTime<Utc>,
}

/// Per-message receipt rollup for the sender-facing info endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageInfo {
    #[serde(rename = "messageId")]
    pub message_id: MessageId,
    pub delivered: Vec<ReceiptEntry>,
    pub read: Vec<ReceiptEntry>,
}
