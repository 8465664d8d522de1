use std::collections::HashMap;

use tokio::sync::Mutex;

/// Who is typing where: channel_id -> [(user_id, display name)].
///
/// Names keep the order in which users started typing.
pub struct TypingTracker {
    channels: Mutex<HashMap<i64, Vec<(i64, String)>>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a user as typing. Repeated calls keep a single entry.
    /// Returns the channel's typing names afterwards.
    pub async fn start_typing(&self, channel_id: i64, user_id: i64, name: &str) -> Vec<String> {
        let mut channels = self.channels.lock().await;
        let typing = channels.entry(channel_id).or_default();

        match typing.iter_mut().find(|(uid, _)| *uid == user_id) {
            Some(entry) => entry.1 = name.to_string(),
            None => typing.push((user_id, name.to_string())),
        }

        names(typing)
    }

    /// Remove a user from a channel. Not typing is fine.
    /// Returns the channel's typing names afterwards.
    pub async fn stop_typing(&self, channel_id: i64, user_id: i64) -> Vec<String> {
        let mut channels = self.channels.lock().await;

        let Some(typing) = channels.get_mut(&channel_id) else {
            return Vec::new();
        };

        typing.retain(|(uid, _)| *uid != user_id);
        let remaining = names(typing);
        if typing.is_empty() {
            channels.remove(&channel_id);
        }

        remaining
    }

    /// Remove a user from every channel. Returns only the channels the user
    /// was typing in, with their remaining names.
    pub async fn clear_user(&self, user_id: i64) -> Vec<(i64, Vec<String>)> {
        let mut channels = self.channels.lock().await;
        let mut changed = Vec::new();

        for (&channel_id, typing) in channels.iter_mut() {
            let before = typing.len();
            typing.retain(|(uid, _)| *uid != user_id);
            if typing.len() != before {
                changed.push((channel_id, names(typing)));
            }
        }

        channels.retain(|_, typing| !typing.is_empty());
        changed.sort_by_key(|(channel_id, _)| *channel_id);
        changed
    }

    pub async fn typing_names(&self, channel_id: i64) -> Vec<String> {
        self.channels
            .lock()
            .await
            .get(&channel_id)
            .map(|typing| names(typing))
            .unwrap_or_default()
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn names(typing: &[(i64, String)]) -> Vec<String> {
    typing.iter().map(|(_, name)| name.clone()).collect()
}
