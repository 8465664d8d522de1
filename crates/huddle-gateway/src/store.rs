use std::sync::Arc;

use anyhow::{Result, anyhow};
use huddle_db::Database;
use huddle_db::models::DeletedMessageRow;
use huddle_types::models::{ChatMessage, ProjectMember};

/// The relational collaborator the realtime core calls into.
///
/// Implementations are synchronous; the hub runs every call on the blocking
/// pool through [`run_blocking`].
pub trait ChatStore: Send + Sync + 'static {
    fn project_members(&self, project_id: i64) -> Result<Vec<ProjectMember>>;

    /// `None` when `user_id` is not a member of `project_id`.
    fn project_member(&self, project_id: i64, user_id: i64) -> Result<Option<ProjectMember>>;

    fn channel_project(&self, channel_id: i64) -> Result<Option<i64>>;

    fn message_project(&self, message_id: i64) -> Result<Option<i64>>;

    fn insert_message(
        &self,
        channel_id: i64,
        user_id: i64,
        text: Option<&str>,
        attachment_url: Option<&str>,
    ) -> Result<i64>;

    fn message_with_author(&self, message_id: i64) -> Result<Option<ChatMessage>>;

    /// Returns `false` when `user_id` does not own `message_id`.
    fn edit_message(&self, message_id: i64, user_id: i64, new_text: &str) -> Result<bool>;

    /// Archives then removes. `None` when `user_id` does not own `message_id`.
    fn delete_message(&self, message_id: i64, user_id: i64) -> Result<Option<DeletedMessageRow>>;
}

impl ChatStore for Database {
    fn project_members(&self, project_id: i64) -> Result<Vec<ProjectMember>> {
        Database::project_members(self, project_id)
    }

    fn project_member(&self, project_id: i64, user_id: i64) -> Result<Option<ProjectMember>> {
        Database::project_member(self, project_id, user_id)
    }

    fn channel_project(&self, channel_id: i64) -> Result<Option<i64>> {
        Database::channel_project(self, channel_id)
    }

    fn message_project(&self, message_id: i64) -> Result<Option<i64>> {
        Database::message_project(self, message_id)
    }

    fn insert_message(
        &self,
        channel_id: i64,
        user_id: i64,
        text: Option<&str>,
        attachment_url: Option<&str>,
    ) -> Result<i64> {
        Database::insert_message(self, channel_id, user_id, text, attachment_url)
    }

    fn message_with_author(&self, message_id: i64) -> Result<Option<ChatMessage>> {
        Ok(self
            .get_message_with_author(message_id)?
            .map(|row| row.into_chat_message()))
    }

    fn edit_message(&self, message_id: i64, user_id: i64, new_text: &str) -> Result<bool> {
        Database::edit_message(self, message_id, user_id, new_text)
    }

    fn delete_message(&self, message_id: i64, user_id: i64) -> Result<Option<DeletedMessageRow>> {
        Database::delete_message(self, message_id, user_id)
    }
}

/// Run a store call off the async runtime. This is the only place the hub
/// suspends.
pub async fn run_blocking<S, F, T>(store: &Arc<S>, f: F) -> Result<T>
where
    S: ChatStore,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| anyhow!("store task failed: {}", e))?
}
