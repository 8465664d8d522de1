use huddle_types::events::{ErrorCode, ServerEvent};
use thiserror::Error;

/// Why a client command was rejected.
///
/// Errors are only ever reported to the connection that sent the command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("connection has not joined a project")]
    NotJoined,

    #[error("connection already joined project {0}")]
    AlreadyJoined(i64),

    #[error("connection is closed")]
    Closed,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not allowed: {0}")]
    Forbidden(String),

    /// Also covers rows owned by someone else, so ownership is never revealed.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("storage failure: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotJoined | Self::AlreadyJoined(_) | Self::Closed => ErrorCode::InvalidState,
            Self::Validation(_) => ErrorCode::Validation,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Persistence(_) => ErrorCode::Persistence,
        }
    }

    /// Acknowledgement for the originating connection. Storage details stay
    /// in the server log.
    pub fn to_event(&self, event: &str) -> ServerEvent {
        let message = match self {
            Self::Persistence(_) => "operation failed, please retry".to_string(),
            other => other.to_string(),
        };

        ServerEvent::Error {
            event: event.to_string(),
            code: self.code(),
            message,
        }
    }
}
