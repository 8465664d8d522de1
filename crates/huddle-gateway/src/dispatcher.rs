use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use huddle_types::events::ServerEvent;

type Outbound = mpsc::UnboundedSender<ServerEvent>;

/// Broadcast groups: one per project, holding every joined connection.
///
/// Sends never block. A connection whose receiver is gone is skipped.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// project_id -> (conn_id -> outbound queue)
    groups: RwLock<HashMap<i64, HashMap<Uuid, Outbound>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                groups: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub async fn join_group(&self, project_id: i64, conn_id: Uuid, tx: Outbound) {
        self.inner
            .groups
            .write()
            .await
            .entry(project_id)
            .or_default()
            .insert(conn_id, tx);
    }

    pub async fn leave_group(&self, project_id: i64, conn_id: Uuid) {
        let mut groups = self.inner.groups.write().await;
        if let Some(group) = groups.get_mut(&project_id) {
            group.remove(&conn_id);
            if group.is_empty() {
                groups.remove(&project_id);
            }
        }
    }

    /// Send to every connection in the project.
    pub async fn broadcast(&self, project_id: i64, event: ServerEvent) {
        let groups = self.inner.groups.read().await;
        if let Some(group) = groups.get(&project_id) {
            for tx in group.values() {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Send to every connection in the project except `exclude`.
    pub async fn broadcast_except(&self, project_id: i64, exclude: Uuid, event: ServerEvent) {
        let groups = self.inner.groups.read().await;
        if let Some(group) = groups.get(&project_id) {
            for (conn_id, tx) in group.iter() {
                if *conn_id != exclude {
                    let _ = tx.send(event.clone());
                }
            }
        }
    }

    /// Targeted send. Returns `false` if the connection is not in the group
    /// or already gone.
    pub async fn send_to(&self, project_id: i64, conn_id: Uuid, event: ServerEvent) -> bool {
        let groups = self.inner.groups.read().await;
        groups
            .get(&project_id)
            .and_then(|group| group.get(&conn_id))
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub async fn group_size(&self, project_id: i64) -> usize {
        self.inner
            .groups
            .read()
            .await
            .get(&project_id)
            .map_or(0, |group| group.len())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
