use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    AttachmentId, MessageId, MessageType, ReactionAction, Role, RoomId, RoomKind, UserId,
};

pub mod cursor;

pub use cursor::Cursor;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredRoom {
    pub room_id: RoomId,
    pub kind: RoomKind,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub body: Option<String>,
    pub message_type: MessageType,
    pub reply_to_id: Option<MessageId>,
    pub client_temp_id: Option<String>,
    pub forwarded_from_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub attachment_type: String,
    pub url: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub attachment_id: AttachmentId,
    pub message_id: MessageId,
    pub attachment_type: String,
    pub url: String,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct StoredReceipt {
    pub user_id: UserId,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadCursor {
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::Member => "member",
        Role::Leader => "leader",
        Role::Moderator => "moderator",
    }
}

fn role_from_str(raw: &str) -> Role {
    match raw {
        "leader" => Role::Leader,
        "moderator" => Role::Moderator,
        _ => Role::Member,
    }
}

fn message_type_to_str(kind: MessageType) -> &'static str {
    match kind {
        MessageType::Text => "text",
        MessageType::Media => "media",
        MessageType::System => "system",
    }
}

fn message_type_from_str(raw: &str) -> MessageType {
    match raw {
        "media" => MessageType::Media,
        "system" => MessageType::System,
        _ => MessageType::Text,
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    // ---- users ----

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    // ---- rooms & membership ----

    pub async fn create_hub(&self, name: &str, creator: UserId) -> Result<RoomId> {
        let rec = sqlx::query("INSERT INTO rooms (kind, name) VALUES ('hub', ?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        let room_id = RoomId(rec.get::<i64, _>(0));
        self.add_membership(room_id, creator, Role::Leader).await?;
        Ok(room_id)
    }

    /// Returns the existing private room for the unordered pair, or creates
    /// one. Never yields a duplicate room for the same two users.
    pub async fn open_private_conversation(&self, a: UserId, b: UserId) -> Result<RoomId> {
        let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };

        if let Some(row) =
            sqlx::query("SELECT room_id FROM private_pairs WHERE user_a = ? AND user_b = ?")
                .bind(lo.0)
                .bind(hi.0)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(RoomId(row.get::<i64, _>(0)));
        }

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query("INSERT INTO rooms (kind, name) VALUES ('private', '') RETURNING id")
            .fetch_one(&mut *tx)
            .await?;
        let room_id = RoomId(rec.get::<i64, _>(0));
        sqlx::query("INSERT INTO private_pairs (room_id, user_a, user_b) VALUES (?, ?, ?)")
            .bind(room_id.0)
            .bind(lo.0)
            .bind(hi.0)
            .execute(&mut *tx)
            .await?;
        for user in [lo, hi] {
            sqlx::query(
                "INSERT INTO memberships (room_id, user_id, role, is_active) VALUES (?, ?, 'member', 1)",
            )
            .bind(room_id.0)
            .bind(user.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(room_id)
    }

    pub async fn room(&self, room_id: RoomId) -> Result<Option<StoredRoom>> {
        let row = sqlx::query("SELECT id, kind, name, is_active FROM rooms WHERE id = ?")
            .bind(room_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredRoom {
            room_id: RoomId(r.get::<i64, _>(0)),
            kind: match r.get::<String, _>(1).as_str() {
                "private" => RoomKind::Private,
                _ => RoomKind::Hub,
            },
            name: r.get::<String, _>(2),
            is_active: r.get::<bool, _>(3),
        }))
    }

    pub async fn add_membership(&self, room_id: RoomId, user_id: UserId, role: Role) -> Result<()> {
        sqlx::query(
            "INSERT INTO memberships (room_id, user_id, role, is_active)
             VALUES (?, ?, ?, 1)
             ON CONFLICT(room_id, user_id) DO UPDATE SET role=excluded.role, is_active=1",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .bind(role_to_str(role))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Role change for an existing active member. Returns false when there is
    /// no active membership to update.
    pub async fn update_membership_role(
        &self,
        room_id: RoomId,
        user_id: UserId,
        role: Role,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE memberships SET role = ? WHERE room_id = ? AND user_id = ? AND is_active = 1",
        )
        .bind(role_to_str(role))
        .bind(room_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Role of an active member, `None` if the user is not an active member.
    pub async fn active_membership(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<Role>> {
        let row = sqlx::query(
            "SELECT role FROM memberships WHERE room_id = ? AND user_id = ? AND is_active = 1",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| role_from_str(&r.get::<String, _>(0))))
    }

    // ---- messages ----

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        body: Option<&str>,
        message_type: MessageType,
        reply_to_id: Option<MessageId>,
        client_temp_id: Option<&str>,
        forwarded_from_id: Option<MessageId>,
        created_at: DateTime<Utc>,
    ) -> Result<MessageId> {
        let rec = sqlx::query(
            "INSERT INTO messages (room_id, sender_id, body, message_type, reply_to_id, client_temp_id, forwarded_from_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(room_id.0)
        .bind(sender_id.0)
        .bind(body)
        .bind(message_type_to_str(message_type))
        .bind(reply_to_id.map(|id| id.0))
        .bind(client_temp_id)
        .bind(forwarded_from_id.map(|id| id.0))
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageId(rec.get::<i64, _>(0)))
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT m.id, m.room_id, m.sender_id, u.username, m.body, m.message_type,
                    m.reply_to_id, m.client_temp_id, m.forwarded_from_id,
                    m.created_at, m.edited_at, m.deleted_at
             FROM messages m
             INNER JOIN users u ON u.id = m.sender_id
             WHERE m.id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_message))
    }

    pub async fn find_message_by_temp_id(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        client_temp_id: &str,
    ) -> Result<Option<MessageId>> {
        let row = sqlx::query(
            "SELECT id FROM messages WHERE room_id = ? AND sender_id = ? AND client_temp_id = ?",
        )
        .bind(room_id.0)
        .bind(sender_id.0)
        .bind(client_temp_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| MessageId(r.get::<i64, _>(0))))
    }

    /// Conditional update: returns false when the row was deleted in the
    /// meantime, so a concurrent delete wins deterministically.
    pub async fn edit_message_body(
        &self,
        message_id: MessageId,
        new_body: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages SET body = ?, edited_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(new_body)
        .bind(edited_at)
        .bind(message_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Room-wide tombstone: nulls the body and stamps `deleted_at`. Returns
    /// false when already deleted.
    pub async fn soft_delete_message(
        &self,
        message_id: MessageId,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE messages SET body = NULL, deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(deleted_at)
        .bind(message_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Per-user tombstone, idempotent. Orthogonal to the room-wide delete.
    pub async fn hide_message_for_user(&self, message_id: MessageId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_hides (message_id, user_id) VALUES (?, ?)
             ON CONFLICT(message_id, user_id) DO NOTHING",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest-first page of room messages for `viewer`, strictly older than
    /// the cursor position, with the viewer's hidden rows filtered out.
    /// Callers reverse the batch for oldest-to-newest rendering.
    pub async fn list_room_messages(
        &self,
        room_id: RoomId,
        viewer: UserId,
        limit: u32,
        before: Option<Cursor>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = if let Some(cursor) = before {
            sqlx::query(
                "SELECT m.id, m.room_id, m.sender_id, u.username, m.body, m.message_type,
                        m.reply_to_id, m.client_temp_id, m.forwarded_from_id,
                        m.created_at, m.edited_at, m.deleted_at
                 FROM messages m
                 INNER JOIN users u ON u.id = m.sender_id
                 WHERE m.room_id = ?
                   AND (m.created_at < ? OR (m.created_at = ? AND m.id < ?))
                   AND NOT EXISTS (
                       SELECT 1 FROM message_hides h
                       WHERE h.message_id = m.id AND h.user_id = ?
                   )
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?",
            )
            .bind(room_id.0)
            .bind(cursor.created_at)
            .bind(cursor.created_at)
            .bind(cursor.message_id.0)
            .bind(viewer.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT m.id, m.room_id, m.sender_id, u.username, m.body, m.message_type,
                        m.reply_to_id, m.client_temp_id, m.forwarded_from_id,
                        m.created_at, m.edited_at, m.deleted_at
                 FROM messages m
                 INNER JOIN users u ON u.id = m.sender_id
                 WHERE m.room_id = ?
                   AND NOT EXISTS (
                       SELECT 1 FROM message_hides h
                       WHERE h.message_id = m.id AND h.user_id = ?
                   )
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?",
            )
            .bind(room_id.0)
            .bind(viewer.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows.into_iter().map(row_to_message).collect())
    }

    // ---- attachments ----

    pub async fn insert_attachment(
        &self,
        message_id: MessageId,
        attachment: &NewAttachment,
    ) -> Result<AttachmentId> {
        let rec = sqlx::query(
            "INSERT INTO attachments (message_id, attachment_type, url, mime_type, file_name, file_size, width, height, duration_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message_id.0)
        .bind(&attachment.attachment_type)
        .bind(&attachment.url)
        .bind(attachment.mime_type.as_deref())
        .bind(attachment.file_name.as_deref())
        .bind(attachment.file_size)
        .bind(attachment.width)
        .bind(attachment.height)
        .bind(attachment.duration_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(AttachmentId(rec.get::<i64, _>(0)))
    }

    pub async fn attachments_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<StoredAttachment>> {
        let rows = sqlx::query(
            "SELECT id, message_id, attachment_type, url, mime_type, file_name, file_size, width, height, duration_ms
             FROM attachments WHERE message_id = ? ORDER BY id ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredAttachment {
                attachment_id: AttachmentId(r.get::<i64, _>(0)),
                message_id: MessageId(r.get::<i64, _>(1)),
                attachment_type: r.get::<String, _>(2),
                url: r.get::<String, _>(3),
                mime_type: r.get::<Option<String>, _>(4),
                file_name: r.get::<Option<String>, _>(5),
                file_size: r.get::<Option<i64>, _>(6),
                width: r.get::<Option<i64>, _>(7),
                height: r.get::<Option<i64>, _>(8),
                duration_ms: r.get::<Option<i64>, _>(9),
            })
            .collect())
    }

    // ---- reactions ----

    /// Toggle semantics: the same (message, user, emoji) removes the row;
    /// any other emoji replaces the user's previous reaction.
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<ReactionAction> {
        let mut tx = self.pool.begin().await?;

        let existing =
            sqlx::query("SELECT emoji FROM message_reactions WHERE message_id = ? AND user_id = ?")
                .bind(message_id.0)
                .bind(user_id.0)
                .fetch_optional(&mut *tx)
                .await?
                .map(|r| r.get::<String, _>(0));

        let action = match existing.as_deref() {
            Some(current) if current == emoji => {
                sqlx::query("DELETE FROM message_reactions WHERE message_id = ? AND user_id = ?")
                    .bind(message_id.0)
                    .bind(user_id.0)
                    .execute(&mut *tx)
                    .await?;
                ReactionAction::Removed
            }
            _ => {
                sqlx::query(
                    "INSERT INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)
                     ON CONFLICT(message_id, user_id) DO UPDATE SET emoji=excluded.emoji, created_at=excluded.created_at",
                )
                .bind(message_id.0)
                .bind(user_id.0)
                .bind(emoji)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
                ReactionAction::Added
            }
        };

        tx.commit().await?;
        Ok(action)
    }

    pub async fn reactions_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<(UserId, String)>> {
        let rows = sqlx::query(
            "SELECT user_id, emoji FROM message_reactions WHERE message_id = ? ORDER BY created_at ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (UserId(r.get::<i64, _>(0)), r.get::<String, _>(1)))
            .collect())
    }

    // ---- receipt ledger ----

    /// Lazily creates the receipt row and stamps `delivered_at` once.
    /// Returns false (no-op) on replay, for the sender, or when the message
    /// does not belong to `room_id`.
    pub async fn mark_delivered(
        &self,
        room_id: RoomId,
        message_id: MessageId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(message) = self.message(message_id).await? else {
            return Ok(false);
        };
        if message.room_id != room_id || message.sender_id == user_id || message.is_deleted() {
            return Ok(false);
        }

        let updated = sqlx::query(
            "INSERT INTO message_receipts (message_id, user_id, delivered_at)
             VALUES (?, ?, ?)
             ON CONFLICT(message_id, user_id) DO UPDATE SET delivered_at = excluded.delivered_at
                WHERE message_receipts.delivered_at IS NULL",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Stamps `read_at` (implying `delivered_at`) and advances the reader's
    /// room cursor, but only forward: a seen event for an older message never
    /// regresses the cursor. Returns false on replay, for the sender, or when
    /// the message does not belong to `room_id`.
    pub async fn mark_seen(
        &self,
        room_id: RoomId,
        message_id: MessageId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(message) = self.message(message_id).await? else {
            return Ok(false);
        };
        if message.room_id != room_id || message.sender_id == user_id || message.is_deleted() {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "INSERT INTO message_receipts (message_id, user_id, delivered_at, read_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(message_id, user_id) DO UPDATE SET
                delivered_at = COALESCE(message_receipts.delivered_at, excluded.delivered_at),
                read_at = excluded.read_at
                WHERE message_receipts.read_at IS NULL",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated > 0 {
            // Forward-only cursor advance, ordered by (created_at, id).
            sqlx::query(
                "INSERT INTO room_read_cursors (room_id, user_id, last_read_message_id, last_read_created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(room_id, user_id) DO UPDATE SET
                    last_read_message_id = excluded.last_read_message_id,
                    last_read_created_at = excluded.last_read_created_at,
                    updated_at = excluded.updated_at
                    WHERE excluded.last_read_created_at > room_read_cursors.last_read_created_at
                       OR (excluded.last_read_created_at = room_read_cursors.last_read_created_at
                           AND excluded.last_read_message_id > room_read_cursors.last_read_message_id)",
            )
            .bind(message.room_id.0)
            .bind(user_id.0)
            .bind(message_id.0)
            .bind(message.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(updated > 0)
    }

    pub async fn receipts_for_message(&self, message_id: MessageId) -> Result<Vec<StoredReceipt>> {
        let rows = sqlx::query(
            "SELECT user_id, delivered_at, read_at FROM message_receipts
             WHERE message_id = ?
             ORDER BY user_id ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredReceipt {
                user_id: UserId(r.get::<i64, _>(0)),
                delivered_at: r.get::<Option<DateTime<Utc>>, _>(1),
                read_at: r.get::<Option<DateTime<Utc>>, _>(2),
            })
            .collect())
    }

    pub async fn read_cursor(&self, room_id: RoomId, user_id: UserId) -> Result<Option<ReadCursor>> {
        let row = sqlx::query(
            "SELECT last_read_message_id, last_read_created_at FROM room_read_cursors
             WHERE room_id = ? AND user_id = ?",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ReadCursor {
            message_id: MessageId(r.get::<i64, _>(0)),
            created_at: r.get::<DateTime<Utc>, _>(1),
        }))
    }

    /// Unread count from the cursor alone; no receipt scan. The user's own
    /// messages and deleted rows never count.
    pub async fn unread_count(&self, room_id: RoomId, user_id: UserId) -> Result<i64> {
        let count = if let Some(cursor) = self.read_cursor(room_id, user_id).await? {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM messages
                 WHERE room_id = ? AND sender_id != ? AND deleted_at IS NULL
                   AND (created_at > ? OR (created_at = ? AND id > ?))",
            )
            .bind(room_id.0)
            .bind(user_id.0)
            .bind(cursor.created_at)
            .bind(cursor.created_at)
            .bind(cursor.message_id.0)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM messages
                 WHERE room_id = ? AND sender_id != ? AND deleted_at IS NULL",
            )
            .bind(room_id.0)
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?
        };
        Ok(count)
    }
}

/// True when `error` wraps a unique-constraint violation, e.g. two concurrent
/// sends racing on the same idempotency token.
pub fn is_unique_violation(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<sqlx::Error>())
        .filter_map(|e| e.as_database_error())
        .any(|db| db.is_unique_violation())
}

fn row_to_message(r: sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        room_id: RoomId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        sender_name: r.get::<String, _>(3),
        body: r.get::<Option<String>, _>(4),
        message_type: message_type_from_str(&r.get::<String, _>(5)),
        reply_to_id: r.get::<Option<i64>, _>(6).map(MessageId),
        client_temp_id: r.get::<Option<String>, _>(7),
        forwarded_from_id: r.get::<Option<i64>, _>(8).map(MessageId),
        created_at: r.get::<DateTime<Utc>, _>(9),
        edited_at: r.get::<Option<DateTime<Utc>>, _>(10),
        deleted_at: r.get::<Option<DateTime<Utc>>, _>(11),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
