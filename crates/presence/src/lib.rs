//! Ephemeral per-room presence and typing state.
//!
//! Nothing here survives a restart and nothing here is authoritative: a
//! missing or expired record means "unknown/offline". The store is a trait so
//! the gateway code never cares whether the backing is this in-memory map or
//! something distributed.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use shared::domain::{RoomId, UserId};

/// Online records expire after this long without a refresh.
pub const PRESENCE_TTL: Duration = Duration::from_secs(45);

/// At most one typing broadcast per user per room per window; excess events
/// are dropped silently.
pub const TYPING_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Refreshes the TTL record for (room, user). Multiple devices of the
    /// same user simply overwrite each other.
    async fn mark_online(&self, room: RoomId, user: UserId);

    /// Explicit offline write with `last_seen`, emitted on clean disconnect.
    async fn mark_offline(&self, room: RoomId, user: UserId);

    /// `None` once the TTL has lapsed; absence means unknown/offline.
    async fn get(&self, room: RoomId, user: UserId) -> Option<PresenceRecord>;

    /// Rate gate for typing broadcasts.
    async fn typing_allowed(&self, room: RoomId, user: UserId) -> bool;
}

struct Entry {
    record: PresenceRecord,
    expires_at: Instant,
}

pub struct MemoryPresence {
    ttl: Duration,
    typing_window: Duration,
    entries: RwLock<HashMap<(RoomId, UserId), Entry>>,
    typing: RwLock<HashMap<(RoomId, UserId), Instant>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::with_ttl(PRESENCE_TTL, TYPING_WINDOW)
    }

    pub fn with_ttl(ttl: Duration, typing_window: Duration) -> Self {
        Self {
            ttl,
            typing_window,
            entries: RwLock::new(HashMap::new()),
            typing: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn mark_online(&self, room: RoomId, user: UserId) {
        let mut entries = self.entries.write().await;
        entries.insert(
            (room, user),
            Entry {
                record: PresenceRecord {
                    online: true,
                    last_seen: None,
                },
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    async fn mark_offline(&self, room: RoomId, user: UserId) {
        let mut entries = self.entries.write().await;
        entries.insert(
            (room, user),
            Entry {
                record: PresenceRecord {
                    online: false,
                    last_seen: Some(Utc::now()),
                },
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    async fn get(&self, room: RoomId, user: UserId) -> Option<PresenceRecord> {
        let entries = self.entries.read().await;
        let entry = entries.get(&(room, user))?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.record)
    }

    async fn typing_allowed(&self, room: RoomId, user: UserId) -> bool {
        let now = Instant::now();
        let mut typing = self.typing.write().await;
        match typing.get(&(room, user)) {
            Some(last) if now.duration_since(*last) < self.typing_window => false,
            _ => {
                typing.insert((room, user), now);
                true
            }
        }
    }
}
