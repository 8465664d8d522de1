use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Live status of a project member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    /// Online and away members still hold a live connection.
    pub fn is_connected(self) -> bool {
        !matches!(self, Self::Offline)
    }
}

/// A member of a project as reported by the membership query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMember {
    pub id: i64,
    pub username: String,
    pub role: String,
    pub avatar: Option<String>,
    pub color: Option<String>,
}

/// One row of a project's roster.
///
/// The connection id is process-local and never leaves the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub id: i64,
    pub username: String,
    pub role: String,
    pub avatar: Option<String>,
    pub color: Option<String>,
    pub status: PresenceStatus,
    #[serde(skip)]
    pub connection_id: Option<Uuid>,
}

impl PresenceEntry {
    pub fn offline(member: ProjectMember) -> Self {
        Self {
            id: member.id,
            username: member.username,
            role: member.role,
            avatar: member.avatar,
            color: member.color,
            status: PresenceStatus::Offline,
            connection_id: None,
        }
    }

    /// Refresh display fields from the membership row, keeping live state.
    pub fn refresh(&mut self, member: ProjectMember) {
        self.username = member.username;
        self.role = member.role;
        self.avatar = member.avatar;
        self.color = member.color;
    }
}

/// A persisted chat message joined with its author's display fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub channel_id: i64,
    pub user_id: i64,
    pub text: Option<String>,
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_edited: bool,
    pub username: String,
    pub avatar: Option<String>,
    pub color: Option<String>,
}
