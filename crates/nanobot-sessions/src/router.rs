//! Active-session routing for a channel: key rotation, `/clear`, and
//! rewind-last-turn.
//!
//! Keys are readable: `channel:chat_id#main` for the default session and
//! `channel:chat_id#s<timestamp>_<rand>` after rotation.

use std::collections::HashMap;
use std::sync::Mutex;

use nanobot_core::types::Role;

use crate::store::SessionStore;

pub struct SessionRouter {
    channel_name: String,
    active: Mutex<HashMap<String, String>>,
}

impl SessionRouter {
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// The session key currently routed for `chat_id`.
    pub fn active_session_key(&self, chat_id: &str) -> String {
        let active = self.active.lock().expect("router table poisoned");
        active
            .get(chat_id)
            .cloned()
            .unwrap_or_else(|| self.default_session_key(chat_id))
    }

    /// Rotate to a fresh session key and return it.
    pub fn open_new_session(&self, chat_id: &str) -> String {
        let key = self.new_session_key(chat_id);
        self.active
            .lock()
            .expect("router table poisoned")
            .insert(chat_id.to_string(), key.clone());
        key
    }

    /// Delete the current session file (if any) and rotate.
    /// Returns `(deleted, new_key)`.
    pub fn clear_current_session(&self, store: &SessionStore, chat_id: &str) -> (bool, String) {
        let current = self.active_session_key(chat_id);
        let deleted = store.delete(&current);
        (deleted, self.open_new_session(chat_id))
    }

    /// Roll back one user turn: trim messages through the last user message
    /// into a freshly rotated session.
    ///
    /// Returns `(ok, session_key, human_message)`.
    pub fn rewind_last_turn(&self, store: &SessionStore, chat_id: &str) -> (bool, String, String) {
        let current = self.active_session_key(chat_id);
        let Ok(Some(session)) = store.load(&current) else {
            let key = self.open_new_session(chat_id);
            return (false, key, "当前会话文件不存在，已切换到新会话。".to_string());
        };

        let Some(last_user_idx) = session
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
        else {
            return (false, current, "当前会话没有可回退的用户消息。".to_string());
        };

        let removed = session.messages.len() - last_user_idx;
        let new_key = self.open_new_session(chat_id);
        let mut trimmed = session.clone();
        trimmed.key = new_key.clone();
        trimmed.messages.truncate(last_user_idx);
        if store.save(&mut trimmed).is_err() {
            return (false, current, "读取会话失败，未执行回退。".to_string());
        }
        (
            true,
            new_key,
            format!("已回退 1 轮对话，移除 {removed} 条最近消息并切换到新会话。"),
        )
    }

    /// Recent sessions for a chat as `(key, updated_at)`, newest first.
    pub fn list_recent_sessions(
        &self,
        store: &SessionStore,
        chat_id: &str,
        limit: usize,
    ) -> Vec<(String, String)> {
        let prefix = format!("{}:{}", self.channel_name, chat_id);
        store
            .list()
            .into_iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .take(limit)
            .collect()
    }

    fn default_session_key(&self, chat_id: &str) -> String {
        format!("{}:{}#main", self.channel_name, chat_id)
    }

    fn new_session_key(&self, chat_id: &str) -> String {
        let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let rand: String = uuid::Uuid::new_v4().simple().to_string()[..6].to_string();
        format!("{}:{}#s{}_{}", self.channel_name, chat_id, ts, rand)
    }
}
