use serde::{Deserialize, Deserializer, Serialize};

use crate::models::{ChatMessage, PresenceEntry};

/// The user block a client sends with `join`.
///
/// Only `id` is read. The display fields are accepted for compatibility
/// but the server uses the membership row instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinUser {
    pub id: Option<i64>,
    pub username: Option<String>,
    pub avatar: Option<String>,
    pub color: Option<String>,
}

/// Body of `online` / `away`. Clients send `{}`, `null` or no `data` at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySignal {}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    /// Bind this connection to a project. Once per connection.
    Join { project_id: i64, user: JoinUser },

    /// Activity signal: the user is active again
    Online(Option<ActivitySignal>),

    /// Activity signal: the user went idle
    Away(Option<ActivitySignal>),

    StartTyping { channel_id: i64 },

    StopTyping { channel_id: i64 },

    SendMessage {
        project_id: Option<i64>,
        channel_id: i64,
        user_id: Option<i64>,
        #[serde(rename = "message")]
        text: Option<String>,
        #[serde(rename = "attachment_url")]
        attachment_url: Option<String>,
        #[serde(default, deserialize_with = "null_as_empty")]
        mentions: Vec<String>,
    },

    EditMessage {
        message_id: i64,
        new_message: String,
        user_id: Option<i64>,
        project_id: Option<i64>,
    },

    DeleteMessage {
        message_id: i64,
        user_id: Option<i64>,
        project_id: Option<i64>,
    },
}

impl ClientCommand {
    /// Wire name of the command, echoed back in error events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Online(_) => "online",
            Self::Away(_) => "away",
            Self::StartTyping { .. } => "startTyping",
            Self::StopTyping { .. } => "stopTyping",
            Self::SendMessage { .. } => "sendMessage",
            Self::EditMessage { .. } => "editMessage",
            Self::DeleteMessage { .. } => "deleteMessage",
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Machine-readable reason carried by [`ServerEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidState,
    Validation,
    Forbidden,
    NotFound,
    Persistence,
}

/// Events sent FROM server TO clients over WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Full reconciled roster of a project
    UpdateOnlineUsers(Vec<PresenceEntry>),

    /// Everyone currently typing in a channel (possibly nobody)
    TypingUpdate {
        channel_id: i64,
        typing_usernames: Vec<String>,
    },

    /// A new message was posted
    ReceiveMessage(ChatMessage),

    /// A message was edited by its author
    MessageEdited(ChatMessage),

    /// A message was removed by its author
    MessageDeleted { message_id: i64, channel_id: i64 },

    /// Targeted: the recipient was mentioned in a message
    ReceivePing { channel_id: i64, message_id: i64 },

    /// Targeted: the originating connection's command failed
    Error {
        event: String,
        code: ErrorCode,
        message: String,
    },
}
