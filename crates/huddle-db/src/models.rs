//! Database row types. These map directly to SQLite rows and stay separate
//! from the wire models in huddle-types.

use chrono::{DateTime, Utc};
use huddle_types::models::ChatMessage;
use tracing::warn;

/// A message row joined with its author's display fields.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub channel_id: i64,
    pub user_id: i64,
    pub text: Option<String>,
    pub attachment_url: Option<String>,
    pub is_edited: bool,
    pub created_at: String,
    pub username: Option<String>,
    pub avatar: Option<String>,
    pub color: Option<String>,
}

impl MessageRow {
    pub fn into_chat_message(self) -> ChatMessage {
        let created_at = parse_timestamp(&self.created_at).unwrap_or_else(|| {
            warn!("Corrupt created_at '{}' on message {}", self.created_at, self.id);
            DateTime::default()
        });

        ChatMessage {
            id: self.id,
            channel_id: self.channel_id,
            user_id: self.user_id,
            text: self.text,
            attachment_url: self.attachment_url,
            created_at,
            is_edited: self.is_edited,
            username: self.username.unwrap_or_else(|| "unknown".to_string()),
            avatar: self.avatar,
            color: self.color,
        }
    }
}

/// One entry of the append-only edit audit trail.
#[derive(Debug, Clone)]
pub struct EditedMessageRow {
    pub id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub previous_text: Option<String>,
    pub edited_at: String,
}

/// Snapshot of a message taken right before it was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedMessageRow {
    pub id: i64,
    pub message_id: i64,
    pub channel_id: i64,
    pub user_id: i64,
    pub text: Option<String>,
    pub attachment_url: Option<String>,
    pub is_edited: bool,
    pub created_at: String,
    pub deleted_by: i64,
    pub deleted_at: String,
}

/// Accepts both the RFC 3339 form written by the schema defaults and the bare
/// `YYYY-MM-DD HH:MM:SS` form of SQLite's `datetime()`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .ok()
}
