use chrono::{DateTime, Utc};
use harmonia_common::ConversationConfig;
use serde::{Deserialize, Serialize};

use crate::providers::ChatMessage;
use crate::tools::ToolRegistry;

/// Caller-owned message history plus its settings.
///
/// A turn works on a clone and hands back the extended copy, so the caller
/// decides whether to keep it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub config: ConversationConfig,
    /// History without the developer preamble.
    pub messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(config: ConversationConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            config,
            messages: Vec::new(),
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::user(text));
    }

    /// Messages as sent on the wire: the developer preamble, if any, then the history.
    pub fn request_messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !self.config.system_prompt.is_empty() {
            out.push(ChatMessage::developer(self.config.system_prompt.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    pub fn enabled_tools(&self, registry: &ToolRegistry) -> ToolRegistry {
        registry.enabled(&self.config)
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(ConversationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatRole;

    #[test]
    fn preamble_leads_request_messages() {
        let mut convo = Conversation::new(ConversationConfig {
            system_prompt: "Answer tersely.".to_string(),
            ..Default::default()
        });
        convo.push_user("hi");
        let msgs = convo.request_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, ChatRole::Developer);
        assert_eq!(msgs[1].text(), "hi");
        assert_eq!(convo.messages.len(), 1);
    }

    #[test]
    fn empty_preamble_is_omitted() {
        let mut convo = Conversation::default();
        convo.push_user("hi");
        assert_eq!(convo.request_messages()[0].role, ChatRole::User);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(Conversation::default().id, Conversation::default().id);
    }
}
