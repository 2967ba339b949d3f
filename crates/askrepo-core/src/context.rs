use serde::{Deserialize, Serialize};

use crate::messages::{Role, Turn};

/// The complete request sent to a language model.
#[derive(Clone, Debug, Default)]
pub struct LlmContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl LlmContext {
    /// Create an empty context (useful for testing).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Seed a context with prior conversation turns, oldest first.
    pub fn from_history(history: &[Turn]) -> Self {
        Self {
            system_prompt: None,
            messages: history.iter().map(ChatMessage::from).collect(),
        }
    }

    pub fn with_system(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage {
            role: ChatRole::User,
            content: content.into(),
        });
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        let role = match turn.role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        };
        Self {
            role,
            content: turn.content.clone(),
        }
    }
}
