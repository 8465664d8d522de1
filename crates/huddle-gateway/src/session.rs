use tokio::sync::mpsc;
use uuid::Uuid;

use huddle_types::events::ServerEvent;

/// Identity a connection joined with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: i64,
    pub username: String,
    pub avatar: Option<String>,
    pub color: Option<String>,
}

/// `Unjoined -> Joined -> Closed`. There is no way back to `Unjoined`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unjoined,
    Joined { project_id: i64, user: SessionUser },
    Closed,
}

/// Per-connection state owned by the connection task.
pub struct Session {
    conn_id: Uuid,
    state: SessionState,
    outbound: mpsc::UnboundedSender<ServerEvent>,
}

impl Session {
    pub fn new(outbound: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            state: SessionState::Unjoined,
            outbound,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Project and user, if this connection has joined.
    pub fn joined(&self) -> Option<(i64, &SessionUser)> {
        match &self.state {
            SessionState::Joined { project_id, user } => Some((*project_id, user)),
            _ => None,
        }
    }

    pub(crate) fn outbound(&self) -> mpsc::UnboundedSender<ServerEvent> {
        self.outbound.clone()
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Move to `Closed`, returning the state the session was in.
    pub(crate) fn close(&mut self) -> SessionState {
        std::mem::replace(&mut self.state, SessionState::Closed)
    }

    /// Deliver an event to this connection only.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.outbound.send(event);
    }
}
