//! Per-backend request adaptation.
//!
//! Each profile supplies two hooks: how hidden reasoning from a tool-calling
//! assistant turn is threaded back into the next request, and how the
//! reasoning effort hint is encoded. Supporting another backend means adding
//! a row to [`PROFILES`].

use harmonia_common::{Error, ReasoningEffort, Result};
use serde_json::json;

use crate::providers::{ChatMessage, ChatRole, RequestExtensions};

type InjectReasoning = fn(&mut RequestExtensions, usize, &str);
type EncodeEffort = fn(&mut RequestExtensions, ReasoningEffort);

pub struct BackendProfile {
    pub id: &'static str,
    inject_reasoning: InjectReasoning,
    encode_effort: EncodeEffort,
}

impl std::fmt::Debug for BackendProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProfile").field("id", &self.id).finish()
    }
}

impl PartialEq for BackendProfile {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

pub static PROFILES: &[BackendProfile] = &[
    BackendProfile {
        id: "llamacpp",
        inject_reasoning: inject_thinking,
        encode_effort: template_kwargs_effort,
    },
    BackendProfile {
        id: "openrouter",
        inject_reasoning: inject_reasoning,
        encode_effort: top_level_effort,
    },
    BackendProfile {
        id: "openai",
        inject_reasoning: no_injection,
        encode_effort: top_level_effort,
    },
];

impl BackendProfile {
    pub fn lookup(id: &str) -> Result<&'static BackendProfile> {
        PROFILES.iter().find(|p| p.id == id).ok_or_else(|| {
            Error::Config(format!(
                "no adaptation profile for backend '{id}' (known: {})",
                PROFILES.iter().map(|p| p.id).collect::<Vec<_>>().join(", ")
            ))
        })
    }

    /// Apply both adaptations for one outgoing request.
    ///
    /// Reasoning is injected only when the last assistant message in
    /// `messages` carries a tool call and no visible text.
    pub fn adapt(
        &self,
        extensions: &mut RequestExtensions,
        messages: &[ChatMessage],
        pending_reasoning: &str,
        effort: Option<ReasoningEffort>,
    ) {
        if !pending_reasoning.is_empty() {
            if let Some(index) = reasoning_target(messages) {
                (self.inject_reasoning)(extensions, index, pending_reasoning);
            }
        }
        if let Some(effort) = effort {
            (self.encode_effort)(extensions, effort);
        }
    }
}

fn reasoning_target(messages: &[ChatMessage]) -> Option<usize> {
    let (index, last) = messages
        .iter()
        .enumerate()
        .rev()
        .find(|(_, m)| m.role == ChatRole::Assistant)?;
    (last.has_tool_calls() && last.text().is_empty()).then_some(index)
}

fn inject_thinking(ext: &mut RequestExtensions, index: usize, text: &str) {
    ext.set_message(index, "thinking", json!(text));
}

fn inject_reasoning(ext: &mut RequestExtensions, index: usize, text: &str) {
    ext.set_message(index, "reasoning", json!(text));
}

fn no_injection(_ext: &mut RequestExtensions, _index: usize, _text: &str) {}

fn top_level_effort(ext: &mut RequestExtensions, effort: ReasoningEffort) {
    ext.set_body("reasoning_effort", json!(effort.as_str()));
}

fn template_kwargs_effort(ext: &mut RequestExtensions, effort: ReasoningEffort) {
    ext.set_body(
        "chat_template_kwargs",
        json!({ "reasoning_effort": effort.as_str() }),
    );
    top_level_effort(ext, effort);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ToolCall, ToolCallKind};

    fn tool_turn() -> Vec<ChatMessage> {
        vec![
            ChatMessage::developer("be brief"),
            ChatMessage::user("weather in London?"),
            ChatMessage::assistant_tool_call(ToolCall {
                id: "call_1".to_string(),
                kind: ToolCallKind::Function,
                name: "get_weather".to_string(),
                arguments: r#"{"location":"London"}"#.to_string(),
            }),
            ChatMessage::tool_result("call_1", "15°C - cloudy"),
        ]
    }

    #[test]
    fn lookup_known_and_unknown() {
        assert_eq!(BackendProfile::lookup("openrouter").unwrap().id, "openrouter");
        let err = BackendProfile::lookup("ollama").unwrap_err();
        assert!(err.to_string().contains("llamacpp, openrouter, openai"));
    }

    #[test]
    fn llamacpp_injects_thinking_and_template_effort() {
        let mut ext = RequestExtensions::default();
        BackendProfile::lookup("llamacpp").unwrap().adapt(
            &mut ext,
            &tool_turn(),
            "Need the weather tool.",
            Some(ReasoningEffort::High),
        );
        assert_eq!(ext.messages[&2]["thinking"], "Need the weather tool.");
        assert_eq!(ext.body["chat_template_kwargs"]["reasoning_effort"], "high");
        assert_eq!(ext.body["reasoning_effort"], "high");
    }

    #[test]
    fn openrouter_injects_reasoning_field() {
        let mut ext = RequestExtensions::default();
        BackendProfile::lookup("openrouter")
            .unwrap()
            .adapt(&mut ext, &tool_turn(), "hmm", Some(ReasoningEffort::Low));
        assert_eq!(ext.messages[&2]["reasoning"], "hmm");
        assert!(!ext.body.contains_key("chat_template_kwargs"));
        assert_eq!(ext.body["reasoning_effort"], "low");
    }

    #[test]
    fn openai_never_injects() {
        let mut ext = RequestExtensions::default();
        BackendProfile::lookup("openai")
            .unwrap()
            .adapt(&mut ext, &tool_turn(), "hmm", None);
        assert!(ext.is_empty());
    }

    #[test]
    fn no_injection_without_pending_tool_call() {
        let mut messages = tool_turn();
        messages.push(ChatMessage::assistant("It is 15°C."));
        messages.push(ChatMessage::user("thanks"));
        let mut ext = RequestExtensions::default();
        BackendProfile::lookup("llamacpp")
            .unwrap()
            .adapt(&mut ext, &messages, "stale", None);
        assert!(ext.messages.is_empty());
    }

    #[test]
    fn no_injection_with_empty_reasoning() {
        let mut ext = RequestExtensions::default();
        BackendProfile::lookup("llamacpp")
            .unwrap()
            .adapt(&mut ext, &tool_turn(), "", None);
        assert!(ext.is_empty());
    }
}
