//! Per-channel session routing and the session control commands.
//!
//! User turns are routed through the channel's active session key
//! (`channel:chat_id#main`, rotated to `#s<ts>_<rand>`), and the dispatcher
//! answers `/new`, `/clear`, `/rewind` and `/sessions` here without burning
//! an LLM turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use nanobot_core::types::{InboundMessage, OutboundMessage};
use nanobot_sessions::{SessionRouter, SessionStore};

pub struct SessionCommands {
    sessions: Arc<SessionStore>,
    routers: Mutex<HashMap<String, Arc<SessionRouter>>>,
}

impl SessionCommands {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self {
            sessions,
            routers: Mutex::new(HashMap::new()),
        }
    }

    /// The session key this channel's conversation is currently routed to.
    pub fn active_session_key(&self, channel: &str, chat_id: &str) -> String {
        self.router_for(channel).active_session_key(chat_id)
    }

    /// Handle a session control command. Returns the reply when `msg` was
    /// one, `None` when it should go to the model.
    pub fn try_handle(&self, msg: &InboundMessage) -> Option<OutboundMessage> {
        let router = self.router_for(&msg.channel);
        let text = match msg.content.trim() {
            "/new" => {
                let key = router.open_new_session(&msg.chat_id);
                info!(channel = %msg.channel, chat_id = %msg.chat_id, key = %key, "session rotated");
                format!("已切换到新会话：{key}")
            }
            "/clear" => {
                let (deleted, key) = router.clear_current_session(&self.sessions, &msg.chat_id);
                if deleted {
                    format!("已清除当前会话并切换到新会话：{key}")
                } else {
                    format!("当前会话为空，已切换到新会话：{key}")
                }
            }
            "/rewind" => {
                let (_ok, _key, reply) = router.rewind_last_turn(&self.sessions, &msg.chat_id);
                reply
            }
            "/sessions" => {
                let recent = router.list_recent_sessions(&self.sessions, &msg.chat_id, 10);
                if recent.is_empty() {
                    "暂无历史会话。".to_string()
                } else {
                    let mut lines = vec!["最近会话：".to_string()];
                    for (key, updated) in recent {
                        let ts: String = updated.chars().take(19).collect();
                        lines.push(format!("- {key} ({})", ts.replace('T', " ")));
                    }
                    lines.join("\n")
                }
            }
            _ => return None,
        };

        let mut reply = OutboundMessage::new(&msg.channel, &msg.chat_id, text);
        reply.trace_id = msg.trace_id.clone();
        Some(reply)
    }

    fn router_for(&self, channel: &str) -> Arc<SessionRouter> {
        let mut routers = self.routers.lock().expect("session routers poisoned");
        routers
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(SessionRouter::new(channel)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_core::types::Role;

    fn fixture() -> (tempfile::TempDir, Arc<SessionStore>, SessionCommands) {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")));
        let commands = SessionCommands::new(sessions.clone());
        (dir, sessions, commands)
    }

    #[test]
    fn user_turns_route_to_the_main_session_by_default() {
        let (_dir, _sessions, commands) = fixture();
        assert_eq!(
            commands.active_session_key("telegram", "42"),
            "telegram:42#main"
        );
    }

    #[test]
    fn new_command_rotates_the_active_key() {
        let (_dir, _sessions, commands) = fixture();
        let before = commands.active_session_key("telegram", "42");

        let msg = InboundMessage::new("telegram", "u", "42", "/new");
        let reply = commands.try_handle(&msg).expect("command reply");
        assert!(reply.content.contains("新会话"));

        let after = commands.active_session_key("telegram", "42");
        assert_ne!(before, after);
        assert!(after.contains("#s"));
        assert!(reply.content.contains(&after));
    }

    #[test]
    fn clear_command_deletes_the_session_file() {
        let (_dir, sessions, commands) = fixture();
        let key = commands.active_session_key("cli", "direct");
        let mut session = sessions.get_or_create(&key);
        session.add_message(Role::User, "hello");
        sessions.save(&mut session).unwrap();

        let msg = InboundMessage::new("cli", "u", "direct", "/clear");
        let reply = commands.try_handle(&msg).expect("command reply");
        assert!(reply.content.contains("已清除"));
        assert!(sessions.load(&key).unwrap().is_none());
        assert_ne!(commands.active_session_key("cli", "direct"), key);
    }

    #[test]
    fn rewind_command_trims_the_last_user_turn() {
        let (_dir, sessions, commands) = fixture();
        let key = commands.active_session_key("telegram", "7");
        let mut session = sessions.get_or_create(&key);
        session.add_message(Role::User, "第一问");
        session.add_message(Role::Assistant, "第一答");
        session.add_message(Role::User, "第二问");
        session.add_message(Role::Assistant, "第二答");
        sessions.save(&mut session).unwrap();

        let msg = InboundMessage::new("telegram", "u", "7", "/rewind");
        let reply = commands.try_handle(&msg).expect("command reply");
        assert!(reply.content.contains("已回退"));

        let rewound_key = commands.active_session_key("telegram", "7");
        let rewound = sessions.load(&rewound_key).unwrap().unwrap();
        assert_eq!(rewound.messages.len(), 2);
        assert_eq!(rewound.messages[1].text(), Some("第一答"));
    }

    #[test]
    fn sessions_command_lists_recent_keys() {
        let (_dir, sessions, commands) = fixture();
        let key = commands.active_session_key("telegram", "9");
        let mut session = sessions.get_or_create(&key);
        session.add_message(Role::User, "x");
        sessions.save(&mut session).unwrap();

        let msg = InboundMessage::new("telegram", "u", "9", "/sessions");
        let reply = commands.try_handle(&msg).expect("command reply");
        assert!(reply.content.contains("最近会话"));
        assert!(reply.content.contains("telegram:9#main"));
    }

    #[test]
    fn ordinary_messages_pass_through() {
        let (_dir, _sessions, commands) = fixture();
        let msg = InboundMessage::new("telegram", "u", "42", "今天天气如何");
        assert!(commands.try_handle(&msg).is_none());
    }
}
