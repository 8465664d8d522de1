use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use huddle_types::models::{PresenceEntry, PresenceStatus, ProjectMember};

use crate::session::SessionUser;
use crate::store::{ChatStore, run_blocking};

/// Per-project roster: project_id -> (user_id -> entry).
///
/// Members stay listed as offline after they disconnect. Entries only go away
/// when the user is no longer a member of the project.
pub struct PresenceRegistry {
    projects: RwLock<HashMap<i64, HashMap<i64, PresenceEntry>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the project's membership and reconcile the roster against it.
    /// Returns the roster in membership order.
    pub async fn project_users<S: ChatStore>(
        &self,
        store: &Arc<S>,
        project_id: i64,
    ) -> anyhow::Result<Vec<PresenceEntry>> {
        let members = run_blocking(store, move |s| s.project_members(project_id)).await?;
        Ok(self.reconcile(project_id, members).await)
    }

    /// Make the roster match `members`: continuing members keep their live
    /// status, new members start offline, everyone else is pruned. A project
    /// without members is not tracked at all.
    pub async fn reconcile(&self, project_id: i64, members: Vec<ProjectMember>) -> Vec<PresenceEntry> {
        let mut projects = self.projects.write().await;

        if members.is_empty() {
            if projects.remove(&project_id).is_some() {
                debug!("Project {} has no members, dropped its roster", project_id);
            }
            return Vec::new();
        }

        let tracked = projects.entry(project_id).or_default();

        let mut next = HashMap::with_capacity(members.len());
        let mut roster = Vec::with_capacity(members.len());

        for member in members {
            let entry = match tracked.remove(&member.id) {
                Some(mut entry) => {
                    entry.refresh(member);
                    entry
                }
                None => PresenceEntry::offline(member),
            };
            roster.push(entry.clone());
            next.insert(entry.id, entry);
        }

        if !tracked.is_empty() {
            debug!(
                "Pruned {} non-member(s) from project {} roster",
                tracked.len(),
                project_id
            );
        }

        *tracked = next;
        roster
    }

    /// Insert or overwrite the user's entry as online on `conn_id`.
    pub async fn set_online(&self, project_id: i64, user: &SessionUser, conn_id: Uuid) {
        let mut projects = self.projects.write().await;
        let tracked = projects.entry(project_id).or_default();

        let entry = tracked.entry(user.id).or_insert_with(|| PresenceEntry {
            id: user.id,
            username: user.username.clone(),
            role: "member".to_string(),
            avatar: None,
            color: None,
            status: PresenceStatus::Offline,
            connection_id: None,
        });

        entry.username = user.username.clone();
        if user.avatar.is_some() {
            entry.avatar = user.avatar.clone();
        }
        if user.color.is_some() {
            entry.color = user.color.clone();
        }
        entry.status = PresenceStatus::Online;
        entry.connection_id = Some(conn_id);
    }

    /// Returns `false` (and does nothing) when the user has no entry.
    pub async fn set_status(&self, project_id: i64, user_id: i64, status: PresenceStatus) -> bool {
        let mut projects = self.projects.write().await;
        match projects.get_mut(&project_id).and_then(|p| p.get_mut(&user_id)) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Mark the user offline, but only if `conn_id` still owns the entry.
    /// A newer connection of the same user is left alone.
    pub async fn set_offline(&self, project_id: i64, user_id: i64, conn_id: Uuid) -> bool {
        let mut projects = self.projects.write().await;
        match projects.get_mut(&project_id).and_then(|p| p.get_mut(&user_id)) {
            Some(entry) if entry.connection_id == Some(conn_id) => {
                entry.status = PresenceStatus::Offline;
                entry.connection_id = None;
                true
            }
            _ => false,
        }
    }

    /// Live connection of a user, for targeted delivery.
    pub async fn lookup_connection(&self, project_id: i64, user_id: i64) -> Option<Uuid> {
        let projects = self.projects.read().await;
        projects
            .get(&project_id)
            .and_then(|p| p.get(&user_id))
            .filter(|entry| entry.status.is_connected())
            .and_then(|entry| entry.connection_id)
    }

    /// Exact, case-sensitive username match within a project's roster.
    pub async fn find_by_username(&self, project_id: i64, username: &str) -> Option<PresenceEntry> {
        let projects = self.projects.read().await;
        projects
            .get(&project_id)?
            .values()
            .find(|entry| entry.username == username)
            .cloned()
    }

    /// Current roster without touching the store.
    pub async fn snapshot(&self, project_id: i64) -> Vec<PresenceEntry> {
        let projects = self.projects.read().await;
        let mut roster: Vec<PresenceEntry> = projects
            .get(&project_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        roster.sort_by(|a, b| a.username.cmp(&b.username));
        roster
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
