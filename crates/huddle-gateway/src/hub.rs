use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, trace};

use huddle_types::events::{ClientCommand, JoinUser, ServerEvent};
use huddle_types::models::{PresenceEntry, PresenceStatus};

use crate::dispatcher::Dispatcher;
use crate::error::CommandError;
use crate::presence::PresenceRegistry;
use crate::session::{Session, SessionState, SessionUser};
use crate::store::{ChatStore, run_blocking};
use crate::typing::TypingTracker;

/// Routes client commands to the presence registry, the typing tracker and
/// the store, and fans results out to project groups.
pub struct Hub<S> {
    store: Arc<S>,
    presence: Arc<PresenceRegistry>,
    typing: Arc<TypingTracker>,
    dispatcher: Dispatcher,
}

impl<S> Clone for Hub<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            presence: self.presence.clone(),
            typing: self.typing.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<S: ChatStore> Hub<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_parts(
            store,
            Arc::new(PresenceRegistry::new()),
            Arc::new(TypingTracker::new()),
            Dispatcher::new(),
        )
    }

    pub fn with_parts(
        store: Arc<S>,
        presence: Arc<PresenceRegistry>,
        typing: Arc<TypingTracker>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            presence,
            typing,
            dispatcher,
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Reconciled roster of a project.
    pub async fn project_users(&self, project_id: i64) -> anyhow::Result<Vec<PresenceEntry>> {
        self.presence.project_users(&self.store, project_id).await
    }

    /// Process one command. On failure the error is acknowledged to the
    /// originating connection only and nothing is broadcast.
    pub async fn handle(&self, session: &mut Session, command: ClientCommand) -> Result<(), CommandError> {
        let name = command.name();
        let result = self.execute(session, command).await;

        if let Err(err) = &result {
            match err {
                CommandError::Persistence(e) => {
                    error!("{} from connection {} failed: {:#}", name, session.conn_id(), e)
                }
                other => debug!("{} from connection {} rejected: {}", name, session.conn_id(), other),
            }
            session.send(err.to_event(name));
        }

        result
    }

    async fn execute(&self, session: &mut Session, command: ClientCommand) -> Result<(), CommandError> {
        match command {
            ClientCommand::Join { project_id, user } => self.join(session, project_id, user).await,

            ClientCommand::Online(_) => self.activity(session, PresenceStatus::Online).await,

            ClientCommand::Away(_) => self.activity(session, PresenceStatus::Away).await,

            ClientCommand::StartTyping { channel_id } => {
                let (project_id, user) = joined(session)?;
                self.check_channel(project_id, channel_id).await?;
                let names = self.typing.start_typing(channel_id, user.id, &user.username).await;
                trace!("{} typing in channel {}", user.username, channel_id);
                self.broadcast_typing(project_id, session, channel_id, names).await;
                Ok(())
            }

            ClientCommand::StopTyping { channel_id } => {
                let (project_id, user) = joined(session)?;
                let names = self.typing.stop_typing(channel_id, user.id).await;
                self.broadcast_typing(project_id, session, channel_id, names).await;
                Ok(())
            }

            ClientCommand::SendMessage {
                project_id,
                channel_id,
                user_id,
                text,
                attachment_url,
                mentions,
            } => {
                self.send_message(session, project_id, channel_id, user_id, text, attachment_url, mentions)
                    .await
            }

            ClientCommand::EditMessage {
                message_id,
                new_message,
                user_id,
                project_id,
            } => self.edit_message(session, message_id, new_message, user_id, project_id).await,

            ClientCommand::DeleteMessage {
                message_id,
                user_id,
                project_id,
            } => self.delete_message(session, message_id, user_id, project_id).await,
        }
    }

    async fn join(&self, session: &mut Session, project_id: i64, user: JoinUser) -> Result<(), CommandError> {
        match session.state() {
            SessionState::Unjoined => {}
            SessionState::Joined { project_id, .. } => return Err(CommandError::AlreadyJoined(*project_id)),
            SessionState::Closed => return Err(CommandError::Closed),
        }

        let user_id = user
            .id
            .ok_or_else(|| CommandError::Validation("user.id is required".to_string()))?;

        let member = run_blocking(&self.store, move |s| s.project_member(project_id, user_id))
            .await?
            .ok_or_else(|| {
                CommandError::Forbidden(format!(
                    "user {} is not a member of project {}",
                    user_id, project_id
                ))
            })?;

        // Display fields come from the membership row, never from the client.
        let user = SessionUser {
            id: member.id,
            username: member.username,
            avatar: member.avatar,
            color: member.color,
        };
        let conn_id = session.conn_id();

        self.dispatcher.join_group(project_id, conn_id, session.outbound()).await;
        self.presence.set_online(project_id, &user, conn_id).await;

        info!(
            "{} ({}) joined project {} on connection {}",
            user.username, user.id, project_id, conn_id
        );
        session.set_state(SessionState::Joined { project_id, user });

        // The join itself has succeeded; a stale roster is only logged.
        if let Err(e) = self.broadcast_roster(project_id).await {
            error!("Roster update after join to project {} failed: {}", project_id, e);
        }
        Ok(())
    }

    async fn activity(&self, session: &Session, status: PresenceStatus) -> Result<(), CommandError> {
        let (project_id, user) = joined(session)?;

        if !self.presence.set_status(project_id, user.id, status).await {
            return Ok(());
        }

        debug!("{} ({}) is now {:?}", user.username, user.id, status);
        self.broadcast_roster(project_id).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_message(
        &self,
        session: &Session,
        claimed_project: Option<i64>,
        channel_id: i64,
        claimed_user: Option<i64>,
        text: Option<String>,
        attachment_url: Option<String>,
        mentions: Vec<String>,
    ) -> Result<(), CommandError> {
        let (project_id, user) = joined(session)?;
        check_claims(project_id, user, claimed_project, claimed_user)?;
        self.check_channel(project_id, channel_id).await?;

        // Sending ends typing, and the cleared list goes out before the message.
        let names = self.typing.stop_typing(channel_id, user.id).await;
        self.broadcast_typing(project_id, session, channel_id, names).await;

        let text = text.filter(|t| !t.trim().is_empty());
        let attachment_url = attachment_url.filter(|u| !u.trim().is_empty());
        if text.is_none() && attachment_url.is_none() {
            return Err(CommandError::Validation(
                "message needs text or an attachment".to_string(),
            ));
        }

        let user_id = user.id;
        let message_id = run_blocking(&self.store, move |s| {
            s.insert_message(channel_id, user_id, text.as_deref(), attachment_url.as_deref())
        })
        .await?;

        let message = run_blocking(&self.store, move |s| s.message_with_author(message_id))
            .await?
            .ok_or(CommandError::NotFound("message"))?;

        debug!(
            "{} ({}) posted message {} in channel {}",
            user.username, user.id, message_id, channel_id
        );
        self.dispatcher
            .broadcast(project_id, ServerEvent::ReceiveMessage(message))
            .await;

        self.ping_mentions(project_id, user, channel_id, message_id, &mentions)
            .await;

        Ok(())
    }

    /// Targeted pings for mentioned members that are connected right now.
    /// Offline members are skipped, nothing is queued for later.
    async fn ping_mentions(
        &self,
        project_id: i64,
        author: &SessionUser,
        channel_id: i64,
        message_id: i64,
        mentions: &[String],
    ) {
        let mut seen = HashSet::new();

        for username in mentions {
            if !seen.insert(username.as_str()) {
                continue;
            }

            let Some(target) = self.presence.find_by_username(project_id, username).await else {
                continue;
            };
            if target.id == author.id {
                continue;
            }

            if let Some(conn_id) = self.presence.lookup_connection(project_id, target.id).await {
                trace!("Pinging {} for message {}", target.username, message_id);
                self.dispatcher
                    .send_to(
                        project_id,
                        conn_id,
                        ServerEvent::ReceivePing {
                            channel_id,
                            message_id,
                        },
                    )
                    .await;
            }
        }
    }

    async fn edit_message(
        &self,
        session: &Session,
        message_id: i64,
        new_text: String,
        claimed_user: Option<i64>,
        claimed_project: Option<i64>,
    ) -> Result<(), CommandError> {
        let (project_id, user) = joined(session)?;
        check_claims(project_id, user, claimed_project, claimed_user)?;
        self.check_message(project_id, message_id).await?;

        let user_id = user.id;
        let edited = run_blocking(&self.store, move |s| s.edit_message(message_id, user_id, &new_text)).await?;
        if !edited {
            return Err(CommandError::NotFound("message"));
        }

        let message = run_blocking(&self.store, move |s| s.message_with_author(message_id))
            .await?
            .ok_or(CommandError::NotFound("message"))?;

        debug!("{} ({}) edited message {}", user.username, user.id, message_id);
        self.dispatcher
            .broadcast(project_id, ServerEvent::MessageEdited(message))
            .await;

        Ok(())
    }

    async fn delete_message(
        &self,
        session: &Session,
        message_id: i64,
        claimed_user: Option<i64>,
        claimed_project: Option<i64>,
    ) -> Result<(), CommandError> {
        let (project_id, user) = joined(session)?;
        check_claims(project_id, user, claimed_project, claimed_user)?;
        self.check_message(project_id, message_id).await?;

        let user_id = user.id;
        let archived = run_blocking(&self.store, move |s| s.delete_message(message_id, user_id))
            .await?
            .ok_or(CommandError::NotFound("message"))?;

        debug!("{} ({}) deleted message {}", user.username, user.id, message_id);
        self.dispatcher
            .broadcast(
                project_id,
                ServerEvent::MessageDeleted {
                    message_id,
                    channel_id: archived.channel_id,
                },
            )
            .await;

        Ok(())
    }

    /// Tear down a connection: clear its typing state, leave the group and
    /// show the user offline. A no-op for connections that never joined.
    pub async fn disconnect(&self, session: &mut Session) {
        let SessionState::Joined { project_id, user } = session.close() else {
            return;
        };
        let conn_id = session.conn_id();

        for (channel_id, names) in self.typing.clear_user(user.id).await {
            self.dispatcher
                .broadcast_except(
                    project_id,
                    conn_id,
                    ServerEvent::TypingUpdate {
                        channel_id,
                        typing_usernames: names,
                    },
                )
                .await;
        }

        self.dispatcher.leave_group(project_id, conn_id).await;

        if self.presence.set_offline(project_id, user.id, conn_id).await {
            if let Err(e) = self.broadcast_roster(project_id).await {
                error!("Roster update after {} left project {} failed: {}", user.username, project_id, e);
            }
        }

        info!(
            "{} ({}) left project {} (connection {})",
            user.username, user.id, project_id, conn_id
        );
    }

    /// Channels of other projects look the same as missing ones.
    async fn check_channel(&self, project_id: i64, channel_id: i64) -> Result<(), CommandError> {
        let owner = run_blocking(&self.store, move |s| s.channel_project(channel_id)).await?;
        if owner != Some(project_id) {
            return Err(CommandError::NotFound("channel"));
        }
        Ok(())
    }

    async fn check_message(&self, project_id: i64, message_id: i64) -> Result<(), CommandError> {
        let owner = run_blocking(&self.store, move |s| s.message_project(message_id)).await?;
        if owner != Some(project_id) {
            return Err(CommandError::NotFound("message"));
        }
        Ok(())
    }

    async fn broadcast_roster(&self, project_id: i64) -> Result<(), CommandError> {
        let roster = self.project_users(project_id).await?;
        self.dispatcher
            .broadcast(project_id, ServerEvent::UpdateOnlineUsers(roster))
            .await;
        Ok(())
    }

    async fn broadcast_typing(&self, project_id: i64, session: &Session, channel_id: i64, names: Vec<String>) {
        self.dispatcher
            .broadcast_except(
                project_id,
                session.conn_id(),
                ServerEvent::TypingUpdate {
                    channel_id,
                    typing_usernames: names,
                },
            )
            .await;
    }
}

fn joined(session: &Session) -> Result<(i64, &SessionUser), CommandError> {
    match session.state() {
        SessionState::Closed => Err(CommandError::Closed),
        _ => session.joined().ok_or(CommandError::NotJoined),
    }
}

/// Ids a client repeats in its payload must agree with what it joined as.
fn check_claims(
    project_id: i64,
    user: &SessionUser,
    claimed_project: Option<i64>,
    claimed_user: Option<i64>,
) -> Result<(), CommandError> {
    if claimed_user.is_some_and(|id| id != user.id) {
        return Err(CommandError::Forbidden("userId does not match this connection".to_string()));
    }
    if claimed_project.is_some_and(|id| id != project_id) {
        return Err(CommandError::Forbidden(
            "projectId does not match this connection".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use huddle_db::Database;
    use huddle_types::events::ErrorCode;
    use huddle_types::models::ChatMessage;
    use tokio::sync::mpsc;

    use super::*;
    use crate::store::testing::FlakyStore;

    struct Fixture {
        db: Arc<Database>,
        hub: Hub<Database>,
        project_id: i64,
        channel_id: i64,
        side_channel: i64,
        /// Channel of a project nobody in the fixture has joined.
        foreign_channel: i64,
        alice: i64,
        bob: i64,
        carol: i64,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = db.create_user("alice", None, Some("#aa0000")).unwrap();
        let bob = db.create_user("bob", None, None).unwrap();
        let carol = db.create_user("carol", None, None).unwrap();
        let project_id = db.create_project("apollo").unwrap();
        for id in [alice, bob, carol] {
            db.add_project_member(project_id, id, "member").unwrap();
        }
        let channel_id = db.create_channel(project_id, "general", None).unwrap();
        let side_channel = db.create_channel(project_id, "random", None).unwrap();
        let other_project = db.create_project("gemini").unwrap();
        let foreign_channel = db.create_channel(other_project, "general", None).unwrap();
        Fixture {
            hub: Hub::new(db.clone()),
            db,
            project_id,
            channel_id,
            side_channel,
            foreign_channel,
            alice,
            bob,
            carol,
        }
    }

    fn connect() -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn join_cmd(project_id: i64, id: i64, username: &str) -> ClientCommand {
        ClientCommand::Join {
            project_id,
            user: JoinUser {
                id: Some(id),
                username: Some(username.to_string()),
                avatar: None,
                color: None,
            },
        }
    }

    fn send_cmd(channel_id: i64, text: &str, mentions: &[&str]) -> ClientCommand {
        ClientCommand::SendMessage {
            project_id: None,
            channel_id,
            user_id: None,
            text: Some(text.to_string()),
            attachment_url: None,
            mentions: mentions.iter().map(|m| m.to_string()).collect(),
        }
    }

    async fn joined_session<S: ChatStore>(
        hub: &Hub<S>,
        project_id: i64,
        id: i64,
        username: &str,
    ) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (mut session, rx) = connect();
        hub.handle(&mut session, join_cmd(project_id, id, username))
            .await
            .unwrap();
        (session, rx)
    }

    fn roster_status(event: &ServerEvent, id: i64) -> Option<PresenceStatus> {
        match event {
            ServerEvent::UpdateOnlineUsers(roster) => roster.iter().find(|e| e.id == id).map(|e| e.status),
            _ => None,
        }
    }

    fn error_code(events: &[ServerEvent]) -> Option<ErrorCode> {
        events.iter().find_map(|e| match e {
            ServerEvent::Error { code, .. } => Some(*code),
            _ => None,
        })
    }

    fn received_message(events: &[ServerEvent]) -> Option<&ChatMessage> {
        events.iter().find_map(|e| match e {
            ServerEvent::ReceiveMessage(msg) => Some(msg),
            _ => None,
        })
    }

    #[tokio::test]
    async fn join_send_disconnect_scenario() {
        let f = fixture();

        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(roster_status(&events[0], f.alice), Some(PresenceStatus::Online));

        let (_b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        for events in [drain(&mut a_rx), drain(&mut b_rx)] {
            assert_eq!(events.len(), 1);
            assert_eq!(roster_status(&events[0], f.alice), Some(PresenceStatus::Online));
            assert_eq!(roster_status(&events[0], f.bob), Some(PresenceStatus::Online));
            assert_eq!(roster_status(&events[0], f.carol), Some(PresenceStatus::Offline));
        }

        f.hub.handle(&mut a, send_cmd(f.channel_id, "hi", &[])).await.unwrap();
        for events in [drain(&mut a_rx), drain(&mut b_rx)] {
            let msg = received_message(&events).expect("receiveMessage");
            assert_eq!(msg.text.as_deref(), Some("hi"));
            assert!(!msg.is_edited);
            assert_eq!(msg.user_id, f.alice);
            assert_eq!(msg.username, "alice");
            assert_eq!(msg.color.as_deref(), Some("#aa0000"));
        }

        f.hub.disconnect(&mut a).await;
        assert_eq!(a.state(), &SessionState::Closed);
        let events = drain(&mut b_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(roster_status(&events[0], f.alice), Some(PresenceStatus::Offline));
        assert_eq!(roster_status(&events[0], f.bob), Some(PresenceStatus::Online));
        assert_eq!(f.hub.dispatcher().group_size(f.project_id).await, 1);
    }

    #[tokio::test]
    async fn typing_updates_skip_the_sender() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (_b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        f.hub
            .handle(&mut a, ClientCommand::StartTyping { channel_id: f.channel_id })
            .await
            .unwrap();
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerEvent::TypingUpdate {
                channel_id: f.channel_id,
                typing_usernames: vec!["alice".to_string()],
            }]
        );

        f.hub
            .handle(&mut a, ClientCommand::StopTyping { channel_id: f.channel_id })
            .await
            .unwrap();
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerEvent::TypingUpdate {
                channel_id: f.channel_id,
                typing_usernames: vec![],
            }]
        );

        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn sending_clears_typing_before_the_message() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (mut b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        f.hub
            .handle(&mut b, ClientCommand::StartTyping { channel_id: f.channel_id })
            .await
            .unwrap();
        f.hub
            .handle(&mut a, ClientCommand::StartTyping { channel_id: f.channel_id })
            .await
            .unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        f.hub.handle(&mut a, send_cmd(f.channel_id, "done", &[])).await.unwrap();

        let events = drain(&mut b_rx);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ServerEvent::TypingUpdate {
                channel_id: f.channel_id,
                typing_usernames: vec!["bob".to_string()],
            }
        );
        assert!(matches!(events[1], ServerEvent::ReceiveMessage(_)));
        assert_eq!(f.hub.typing().typing_names(f.channel_id).await, vec!["bob"]);
    }

    #[tokio::test]
    async fn mentions_ping_only_connected_members() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (_b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        let (_c, mut c_rx) = joined_session(&f.hub, f.project_id, f.carol, "carol").await;
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        f.hub
            .handle(&mut a, send_cmd(f.channel_id, "@bob look", &["bob", "bob", "alice", "Carol"]))
            .await
            .unwrap();

        fn pings(events: &[ServerEvent]) -> Vec<ServerEvent> {
            events
                .iter()
                .filter(|e| matches!(e, ServerEvent::ReceivePing { .. }))
                .cloned()
                .collect()
        }

        let b_events = drain(&mut b_rx);
        let message_id = received_message(&b_events).unwrap().id;
        assert_eq!(
            pings(&b_events),
            vec![ServerEvent::ReceivePing {
                channel_id: f.channel_id,
                message_id,
            }]
        );
        assert!(pings(&drain(&mut c_rx)).is_empty());
        assert!(pings(&drain(&mut a_rx)).is_empty());
    }

    #[tokio::test]
    async fn offline_members_are_not_pinged() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (mut b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        f.hub.disconnect(&mut b).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        f.hub.handle(&mut a, send_cmd(f.channel_id, "@bob?", &["bob"])).await.unwrap();
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn only_the_author_can_edit() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (mut b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        f.hub.handle(&mut a, send_cmd(f.channel_id, "draft", &[])).await.unwrap();
        let message_id = received_message(&drain(&mut a_rx)).unwrap().id;
        drain(&mut b_rx);

        let err = f
            .hub
            .handle(
                &mut b,
                ClientCommand::EditMessage {
                    message_id,
                    new_message: "hijacked".to_string(),
                    user_id: None,
                    project_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound(_)));
        assert_eq!(error_code(&drain(&mut b_rx)), Some(ErrorCode::NotFound));
        assert!(drain(&mut a_rx).is_empty());

        f.hub
            .handle(
                &mut a,
                ClientCommand::EditMessage {
                    message_id,
                    new_message: "final".to_string(),
                    user_id: Some(f.alice),
                    project_id: Some(f.project_id),
                },
            )
            .await
            .unwrap();

        for events in [drain(&mut a_rx), drain(&mut b_rx)] {
            match events.as_slice() {
                [ServerEvent::MessageEdited(msg)] => {
                    assert_eq!(msg.id, message_id);
                    assert_eq!(msg.text.as_deref(), Some("final"));
                    assert!(msg.is_edited);
                }
                other => panic!("unexpected events {:?}", other),
            }
        }

        let history = f.db.edit_history(message_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].previous_text.as_deref(), Some("draft"));
    }

    #[tokio::test]
    async fn only_the_author_can_delete() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (mut b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        f.hub.handle(&mut a, send_cmd(f.channel_id, "oops", &[])).await.unwrap();
        let message_id = received_message(&drain(&mut a_rx)).unwrap().id;
        drain(&mut b_rx);

        let delete = |user_id| ClientCommand::DeleteMessage {
            message_id,
            user_id,
            project_id: None,
        };

        assert!(f.hub.handle(&mut b, delete(None)).await.is_err());
        assert!(drain(&mut a_rx).is_empty());
        assert!(f.db.get_message_with_author(message_id).unwrap().is_some());

        f.hub.handle(&mut a, delete(Some(f.alice))).await.unwrap();
        let expected = ServerEvent::MessageDeleted {
            message_id,
            channel_id: f.channel_id,
        };
        assert_eq!(drain(&mut a_rx), vec![expected.clone()]);
        assert_eq!(drain(&mut b_rx), vec![expected]);

        assert!(f.db.get_message_with_author(message_id).unwrap().is_none());
        let archive = f.db.deleted_archive(message_id).unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].text.as_deref(), Some("oops"));

        // A second delete finds nothing and archives nothing.
        assert!(f.hub.handle(&mut a, delete(None)).await.is_err());
        assert_eq!(f.db.deleted_archive(message_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_archive_aborts_delete() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (_b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        f.hub.handle(&mut a, send_cmd(f.channel_id, "keep me", &[])).await.unwrap();
        let message_id = received_message(&drain(&mut a_rx)).unwrap().id;
        drain(&mut b_rx);

        f.db
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE deleted_messages")?;
                Ok(())
            })
            .unwrap();

        let err = f
            .hub
            .handle(
                &mut a,
                ClientCommand::DeleteMessage {
                    message_id,
                    user_id: None,
                    project_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Persistence(_)));
        assert_eq!(error_code(&drain(&mut a_rx)), Some(ErrorCode::Persistence));
        assert!(drain(&mut b_rx).is_empty());
        assert!(f.db.get_message_with_author(message_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn commands_require_a_joined_session() {
        let f = fixture();
        let (mut session, mut rx) = connect();

        let err = f
            .hub
            .handle(&mut session, ClientCommand::StartTyping { channel_id: 3 })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotJoined));
        assert_eq!(error_code(&drain(&mut rx)), Some(ErrorCode::InvalidState));

        let err = f
            .hub
            .handle(&mut session, send_cmd(f.channel_id, "hi", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotJoined));
        assert!(f.db.get_messages(f.channel_id, 10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn join_is_validated() {
        let f = fixture();
        let outsider = f.db.create_user("mallory", None, None).unwrap();

        let (mut session, mut rx) = connect();
        let no_id = ClientCommand::Join {
            project_id: f.project_id,
            user: JoinUser::default(),
        };
        assert!(matches!(
            f.hub.handle(&mut session, no_id).await,
            Err(CommandError::Validation(_))
        ));
        assert_eq!(session.state(), &SessionState::Unjoined);

        assert!(matches!(
            f.hub
                .handle(&mut session, join_cmd(f.project_id, outsider, "mallory"))
                .await,
            Err(CommandError::Forbidden(_))
        ));
        assert_eq!(f.hub.dispatcher().group_size(f.project_id).await, 0);
        drain(&mut rx);

        f.hub
            .handle(&mut session, join_cmd(f.project_id, f.alice, "alice"))
            .await
            .unwrap();
        assert!(matches!(
            f.hub
                .handle(&mut session, join_cmd(f.project_id, f.alice, "alice"))
                .await,
            Err(CommandError::AlreadyJoined(_))
        ));
    }

    #[tokio::test]
    async fn activity_signals_update_the_roster() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (_b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        f.hub.handle(&mut a, ClientCommand::Away(None)).await.unwrap();
        let events = drain(&mut b_rx);
        assert_eq!(roster_status(&events[0], f.alice), Some(PresenceStatus::Away));

        f.hub.handle(&mut a, ClientCommand::Online(None)).await.unwrap();
        let events = drain(&mut b_rx);
        assert_eq!(roster_status(&events[0], f.alice), Some(PresenceStatus::Online));
    }

    #[tokio::test]
    async fn roster_drops_removed_members() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (_b, _b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        drain(&mut a_rx);

        f.db.remove_project_member(f.project_id, f.bob).unwrap();
        f.hub.handle(&mut a, ClientCommand::Away(None)).await.unwrap();

        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(roster_status(&events[0], f.bob), None);
        assert_eq!(roster_status(&events[0], f.alice), Some(PresenceStatus::Away));
        assert_eq!(f.hub.presence().lookup_connection(f.project_id, f.bob).await, None);
    }

    #[tokio::test]
    async fn disconnect_clears_typing_everywhere() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (_b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        for channel_id in [f.channel_id, f.side_channel] {
            f.hub
                .handle(&mut a, ClientCommand::StartTyping { channel_id })
                .await
                .unwrap();
        }
        drain(&mut a_rx);
        drain(&mut b_rx);

        f.hub.disconnect(&mut a).await;

        let events = drain(&mut b_rx);
        assert_eq!(events.len(), 3);
        assert_eq!(
            &events[..2],
            &[
                ServerEvent::TypingUpdate {
                    channel_id: f.channel_id,
                    typing_usernames: vec![],
                },
                ServerEvent::TypingUpdate {
                    channel_id: f.side_channel,
                    typing_usernames: vec![],
                },
            ]
        );
        assert_eq!(roster_status(&events[2], f.alice), Some(PresenceStatus::Offline));

        let err = f.hub.handle(&mut a, ClientCommand::Online(None)).await.unwrap_err();
        assert!(matches!(err, CommandError::Closed));
    }

    #[tokio::test]
    async fn disconnect_before_join_is_silent() {
        let f = fixture();
        let (_b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        drain(&mut b_rx);

        let (mut session, _rx) = connect();
        f.hub.disconnect(&mut session).await;
        assert_eq!(session.state(), &SessionState::Closed);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn empty_send_is_rejected_after_clearing_typing() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        let (_b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;
        f.hub
            .handle(&mut a, ClientCommand::StartTyping { channel_id: f.channel_id })
            .await
            .unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        let err = f.hub.handle(&mut a, send_cmd(f.channel_id, "   ", &[])).await.unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
        assert_eq!(error_code(&drain(&mut a_rx)), Some(ErrorCode::Validation));

        let b_events = drain(&mut b_rx);
        assert_eq!(
            b_events,
            vec![ServerEvent::TypingUpdate {
                channel_id: f.channel_id,
                typing_usernames: vec![],
            }]
        );
        assert!(f.db.get_messages(f.channel_id, 10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn attachment_only_messages_are_accepted() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        drain(&mut a_rx);

        f.hub
            .handle(
                &mut a,
                ClientCommand::SendMessage {
                    project_id: Some(f.project_id),
                    channel_id: f.channel_id,
                    user_id: Some(f.alice),
                    text: None,
                    attachment_url: Some("https://files/cat.png".to_string()),
                    mentions: vec![],
                },
            )
            .await
            .unwrap();

        let events = drain(&mut a_rx);
        let msg = received_message(&events).unwrap();
        assert!(msg.text.is_none());
        assert_eq!(msg.attachment_url.as_deref(), Some("https://files/cat.png"));
    }

    #[tokio::test]
    async fn spoofed_ids_are_forbidden() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        drain(&mut a_rx);

        let spoofed = ClientCommand::SendMessage {
            project_id: None,
            channel_id: f.channel_id,
            user_id: Some(f.bob),
            text: Some("as bob".to_string()),
            attachment_url: None,
            mentions: vec![],
        };
        assert!(matches!(
            f.hub.handle(&mut a, spoofed).await,
            Err(CommandError::Forbidden(_))
        ));
        assert!(f.db.get_messages(f.channel_id, 10, None).unwrap().is_empty());
    }

    fn flaky_fixture() -> (Arc<FlakyStore>, Hub<FlakyStore>, i64, i64, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", None, None).unwrap();
        let bob = db.create_user("bob", None, None).unwrap();
        let project_id = db.create_project("apollo").unwrap();
        db.add_project_member(project_id, alice, "owner").unwrap();
        db.add_project_member(project_id, bob, "member").unwrap();
        let channel_id = db.create_channel(project_id, "general", None).unwrap();

        let store = Arc::new(FlakyStore::new(db));
        let hub = Hub::new(store.clone());
        (store, hub, project_id, channel_id, alice, bob)
    }

    #[tokio::test]
    async fn failed_insert_is_not_broadcast() {
        let (store, hub, project_id, channel_id, alice, bob) = flaky_fixture();
        store.fail_inserts.store(true, Ordering::SeqCst);

        let (mut a, mut a_rx) = joined_session(&hub, project_id, alice, "alice").await;
        let (_b, mut b_rx) = joined_session(&hub, project_id, bob, "bob").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let err = hub.handle(&mut a, send_cmd(channel_id, "lost", &["bob"])).await.unwrap_err();
        assert!(matches!(err, CommandError::Persistence(_)));
        assert_eq!(error_code(&drain(&mut a_rx)), Some(ErrorCode::Persistence));
        // Bob only sees the cleared typing list, never the message or a ping.
        assert!(drain(&mut b_rx)
            .iter()
            .all(|e| matches!(e, ServerEvent::TypingUpdate { .. })));

        store.fail_inserts.store(false, Ordering::SeqCst);
        hub.handle(&mut a, send_cmd(channel_id, "found", &[])).await.unwrap();
        assert!(received_message(&drain(&mut b_rx)).is_some());
    }

    #[tokio::test]
    async fn join_stands_when_the_roster_cannot_be_loaded() {
        let (store, hub, project_id, _channel_id, alice, _bob) = flaky_fixture();
        store.fail_members.store(true, Ordering::SeqCst);

        let (mut session, mut rx) = connect();
        hub.handle(&mut session, join_cmd(project_id, alice, "alice"))
            .await
            .unwrap();

        assert!(session.joined().is_some());
        assert_eq!(error_code(&drain(&mut rx)), None);
        assert_eq!(hub.dispatcher().group_size(project_id).await, 1);
        assert!(hub.presence().lookup_connection(project_id, alice).await.is_some());
    }

    #[tokio::test]
    async fn display_fields_come_from_membership() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "bob").await;
        let (_b, mut b_rx) = joined_session(&f.hub, f.project_id, f.bob, "bob").await;

        let (mut c, mut c_rx) = connect();
        let nameless = ClientCommand::Join {
            project_id: f.project_id,
            user: JoinUser {
                id: Some(f.carol),
                ..JoinUser::default()
            },
        };
        f.hub.handle(&mut c, nameless).await.unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        for session in [&mut a, &mut c] {
            f.hub
                .handle(session, ClientCommand::StartTyping { channel_id: f.channel_id })
                .await
                .unwrap();
        }

        let events = drain(&mut b_rx);
        assert_eq!(
            events.last(),
            Some(&ServerEvent::TypingUpdate {
                channel_id: f.channel_id,
                typing_usernames: vec!["alice".to_string(), "carol".to_string()],
            })
        );
        let (_, user) = a.joined().unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(user.color.as_deref(), Some("#aa0000"));
    }

    #[tokio::test]
    async fn other_projects_channels_are_out_of_reach() {
        let f = fixture();
        let (mut a, mut a_rx) = joined_session(&f.hub, f.project_id, f.alice, "alice").await;
        drain(&mut a_rx);

        let err = f
            .hub
            .handle(&mut a, send_cmd(f.foreign_channel, "intruding", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound("channel")));
        assert!(f.db.get_messages(f.foreign_channel, 10, None).unwrap().is_empty());

        let err = f
            .hub
            .handle(&mut a, ClientCommand::StartTyping { channel_id: f.foreign_channel })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotFound("channel")));
        assert!(f.hub.typing().typing_names(f.foreign_channel).await.is_empty());

        // Alice's own message in the foreign channel stays untouchable from here.
        let foreign_id = f
            .db
            .insert_message(f.foreign_channel, f.alice, Some("old"), None)
            .unwrap();
        let edit = ClientCommand::EditMessage {
            message_id: foreign_id,
            new_message: "new".to_string(),
            user_id: None,
            project_id: None,
        };
        assert!(matches!(
            f.hub.handle(&mut a, edit).await,
            Err(CommandError::NotFound("message"))
        ));
        let delete = ClientCommand::DeleteMessage {
            message_id: foreign_id,
            user_id: None,
            project_id: None,
        };
        assert!(matches!(
            f.hub.handle(&mut a, delete).await,
            Err(CommandError::NotFound("message"))
        ));

        let row = f.db.get_message_with_author(foreign_id).unwrap().unwrap();
        assert_eq!(row.text.as_deref(), Some("old"));
        let codes: Vec<_> = drain(&mut a_rx)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Error { code, .. } => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(codes, vec![ErrorCode::NotFound; 4]);
    }
}
