use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use harmonia_common::Result;
use serde::{Deserialize, Serialize};

/// Boundary to an OpenAI-compatible chat-completions endpoint.
///
/// A submission yields a lazy, finite sequence of fragments. Errors returned
/// before the stream starts, or yielded from it, are transport failures.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Transport identifier used in logs (e.g. "openai-compat", "scripted").
    fn transport_id(&self) -> &str;

    /// Submit a request and return its response fragments in arrival order.
    async fn submit(&self, request: &ChatRequest) -> Result<FragmentStream>;
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment>> + Send>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    /// Backend-specific fields merged into the request body on the wire.
    #[serde(default)]
    pub extensions: RequestExtensions,
}

/// Out-of-band JSON fields a backend needs that the portable request lacks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestExtensions {
    /// Top-level body fields, e.g. `chat_template_kwargs`.
    pub body: serde_json::Map<String, serde_json::Value>,
    /// Fields merged into `messages[index]`, keyed by position in `ChatRequest::messages`.
    pub messages: BTreeMap<usize, serde_json::Map<String, serde_json::Value>>,
}

impl RequestExtensions {
    pub fn is_empty(&self) -> bool {
        self.body.is_empty() && self.messages.is_empty()
    }

    pub fn set_body(&mut self, key: &str, value: serde_json::Value) {
        self.body.insert(key.to_string(), value);
    }

    pub fn set_message(&mut self, index: usize, key: &str, value: serde_json::Value) {
        self.messages
            .entry(index)
            .or_default()
            .insert(key.to_string(), value);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessagePart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Developer,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePart {
    Text(String),
    Parts(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_call")]
    ToolCall(ToolCall),
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

/// A fully assembled request from the model to invoke a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub kind: ToolCallKind,
    pub name: String,
    /// Raw JSON argument text exactly as the model produced it.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallKind {
    #[default]
    Function,
    Custom,
    #[serde(untagged)]
    Other(String),
}

impl ToolCallKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "function" => ToolCallKind::Function,
            "custom" => ToolCallKind::Custom,
            other => ToolCallKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ToolCallKind::Function => "function",
            ToolCallKind::Custom => "custom",
            ToolCallKind::Other(kind) => kind,
        }
    }
}

impl ChatMessage {
    pub fn developer(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Developer,
            content: MessagePart::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessagePart::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessagePart::Text(text.into()),
        }
    }

    /// Assistant turn that carries a tool call and no visible text.
    pub fn assistant_tool_call(call: ToolCall) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessagePart::Parts(vec![ContentBlock::ToolCall(call)]),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: MessagePart::Parts(vec![ContentBlock::ToolResult {
                tool_call_id: tool_call_id.into(),
                content: content.into(),
            }]),
        }
    }

    /// Visible text of the message. Tool-call and tool-result blocks are skipped.
    pub fn text(&self) -> String {
        match &self.content {
            MessagePart::Text(t) => t.clone(),
            MessagePart::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        let parts: &[ContentBlock] = match &self.content {
            MessagePart::Parts(parts) => parts,
            MessagePart::Text(_) => &[],
        };
        parts.iter().filter_map(|p| match p {
            ContentBlock::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Error object a server may send instead of choices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub code: Option<u16>,
    pub message: Option<String>,
}

/// One incremental unit of a streamed response.
///
/// `delta` is `None` when the underlying chunk carried no choice (usage-only
/// trailers, error envelopes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Arrival position within the response, starting at 0.
    pub seq: usize,
    pub model: Option<String>,
    pub delta: Option<FragmentDelta>,
    pub usage: Option<TokenUsage>,
    pub error: Option<ServerError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentDelta {
    pub reasoning: String,
    pub content: String,
    pub tool_calls: Vec<ToolCallDelta>,
    /// Set on the last fragment of a choice.
    pub finish_reason: Option<String>,
}

/// Partial tool call. Only the first delta for an index carries id, kind and name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub kind: Option<ToolCallKind>,
    pub name: Option<String>,
    /// Partial JSON argument text.
    pub arguments: String,
}

impl Fragment {
    pub fn reasoning(seq: usize, text: impl Into<String>) -> Self {
        Self::with_delta(
            seq,
            FragmentDelta {
                reasoning: text.into(),
                ..Default::default()
            },
        )
    }

    pub fn content(seq: usize, text: impl Into<String>) -> Self {
        Self::with_delta(
            seq,
            FragmentDelta {
                content: text.into(),
                ..Default::default()
            },
        )
    }

    pub fn tool_call(seq: usize, delta: ToolCallDelta) -> Self {
        Self::with_delta(
            seq,
            FragmentDelta {
                tool_calls: vec![delta],
                ..Default::default()
            },
        )
    }

    pub fn finish(seq: usize, reason: impl Into<String>) -> Self {
        Self::with_delta(
            seq,
            FragmentDelta {
                finish_reason: Some(reason.into()),
                ..Default::default()
            },
        )
    }

    pub fn with_delta(seq: usize, delta: FragmentDelta) -> Self {
        Self {
            seq,
            delta: Some(delta),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            kind: ToolCallKind::Function,
            name: name.to_string(),
            arguments: "{}".to_string(),
        }
    }

    #[test]
    fn text_skips_tool_blocks() {
        let msg = ChatMessage {
            role: ChatRole::Assistant,
            content: MessagePart::Parts(vec![
                ContentBlock::Text {
                    text: "checking".to_string(),
                },
                ContentBlock::ToolCall(call("get_weather")),
            ]),
        };
        assert_eq!(msg.text(), "checking");
        assert!(msg.has_tool_calls());
        assert_eq!(msg.tool_calls().next().unwrap().name, "get_weather");
    }

    #[test]
    fn plain_messages_have_no_tool_calls() {
        assert!(!ChatMessage::assistant("hi").has_tool_calls());
        assert!(!ChatMessage::tool_result("call_1", "15°C").has_tool_calls());
    }

    #[test]
    fn tool_call_kind_parsing() {
        assert_eq!(ToolCallKind::parse("function"), ToolCallKind::Function);
        assert_eq!(ToolCallKind::parse("custom"), ToolCallKind::Custom);
        assert_eq!(
            ToolCallKind::parse("mcp"),
            ToolCallKind::Other("mcp".to_string())
        );
        assert_eq!(ToolCallKind::Other("mcp".to_string()).as_str(), "mcp");
    }

    #[test]
    fn extensions_merge_per_message() {
        let mut ext = RequestExtensions::default();
        assert!(ext.is_empty());
        ext.set_message(2, "thinking", serde_json::json!("hmm"));
        ext.set_message(2, "extra", serde_json::json!(1));
        assert_eq!(ext.messages[&2].len(), 2);
        assert!(!ext.is_empty());
    }
}
