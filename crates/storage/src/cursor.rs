use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use chrono::{DateTime, Utc};
use shared::domain::MessageId;

/// Opaque pagination position: the `(created_at, id)` pair of the oldest
/// message already seen. Encoded as `base64url("rfc3339|id")`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub message_id: MessageId,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.created_at.to_rfc3339(), self.message_id.0);
        URL_SAFE.encode(raw.as_bytes())
    }

    /// A malformed or unrecognized token is treated as "no cursor", never an
    /// error: callers fall back to the newest page.
    pub fn decode(token: &str) -> Option<Self> {
        let raw = URL_SAFE.decode(token.as_bytes()).ok()?;
        let raw = String::from_utf8(raw).ok()?;
        let (created_at, id) = raw.split_once('|')?;
        let created_at = DateTime::parse_from_rfc3339(created_at).ok()?.to_utc();
        let message_id = id.parse::<i64>().ok()?;
        Some(Self {
            created_at,
            message_id: MessageId(message_id),
        })
    }
}
