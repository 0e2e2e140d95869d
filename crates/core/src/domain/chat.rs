use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn now(role: ChatRole, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), timestamp: Utc::now() }
    }
}

/// A conversation owned by exactly one user. Messages are append-only; the
/// whole session is deleted on explicit clear and there is no other terminal
/// state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub messages: Vec<ChatMessage>,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ChatSession {
    pub fn new(id: SessionId, user_id: UserId, context: impl Into<String>) -> Self {
        Self {
            id,
            user_id,
            messages: Vec::new(),
            context: context.into(),
            created_at: Utc::now(),
            last_message_at: None,
        }
    }

    pub fn append(&mut self, message: ChatMessage) {
        self.last_message_at = Some(message.timestamp);
        self.messages.push(message);
    }

    /// The most recent `window` messages, oldest first. Full history stays in
    /// `messages` regardless of what gets sent upstream as model context.
    pub fn recent_context(&self, window: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::{ChatMessage, ChatRole, ChatSession, SessionId};
    use crate::domain::UserId;

    #[test]
    fn recent_context_truncates_but_history_is_kept() {
        let mut session = ChatSession::new(
            SessionId("s-1".to_owned()),
            UserId("u-1".to_owned()),
            "quote page",
        );
        for n in 0..12 {
            session.append(ChatMessage::now(ChatRole::User, format!("message {n}")));
        }

        assert_eq!(session.messages.len(), 12);
        let window = session.recent_context(10);
        assert_eq!(window.len(), 10);
        assert_eq!(window[0].content, "message 2");
        assert_eq!(window[9].content, "message 11");
    }

    #[test]
    fn recent_context_with_short_history_returns_everything() {
        let mut session =
            ChatSession::new(SessionId("s-2".to_owned()), UserId("u-1".to_owned()), "");
        session.append(ChatMessage::now(ChatRole::User, "hello"));
        assert_eq!(session.recent_context(10).len(), 1);
    }
}
