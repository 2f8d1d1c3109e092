use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use harmonia_common::{Error, Result};
use harmonia_config::EndpointConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::providers::{
    ChatMessage, ChatRequest, ChatRole, ChatTransport, ContentBlock, Fragment, FragmentDelta,
    FragmentStream, MessagePart, ServerError, TokenUsage, ToolCallDelta, ToolCallKind,
};

/// Chat-completions client for llama.cpp, OpenRouter, OpenAI and anything
/// else that speaks the same wire format.
#[derive(Clone)]
pub struct OpenAiCompatTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiCompatTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn from_endpoint(endpoint: &EndpointConfig) -> Self {
        Self::new(endpoint.resolved_base_url(), endpoint.resolved_api_key())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChatTransport for OpenAiCompatTransport {
    fn transport_id(&self) -> &str {
        "openai-compat"
    }

    async fn submit(&self, request: &ChatRequest) -> Result<FragmentStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = encode_request(request)?;

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "status={}, body={}",
                status.as_u16(),
                body
            )));
        }

        if request.stream {
            return Ok(Box::pin(SseParser::new(response.bytes_stream())));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {e}")))?;
        let fragment = decode_response(&raw)?;
        Ok(Box::pin(futures::stream::iter(vec![Ok(fragment)])))
    }
}

/// Build the chat-completions JSON body, including backend extension fields.
pub fn encode_request(request: &ChatRequest) -> Result<serde_json::Value> {
    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(
            request
                .tools
                .iter()
                .map(|t| OpenAiTool {
                    kind: "function",
                    function: OpenAiFunctionDefinition {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.input_schema.clone(),
                    },
                })
                .collect(),
        )
    };

    let wire = OpenAiRequest {
        model: request.model.clone(),
        messages: request.messages.iter().map(encode_message).collect(),
        tools,
        stream: request.stream,
        stream_options: request
            .stream
            .then_some(OpenAiStreamOptions { include_usage: true }),
    };

    let mut body = serde_json::to_value(wire)?;
    let ext = &request.extensions;
    if let Some(obj) = body.as_object_mut() {
        for (key, value) in &ext.body {
            obj.insert(key.clone(), value.clone());
        }
    }
    if let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for (index, fields) in &ext.messages {
            let Some(message) = messages.get_mut(*index).and_then(|m| m.as_object_mut()) else {
                debug!(index, "extension targets a message that is not in the request");
                continue;
            };
            for (key, value) in fields {
                message.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(body)
}

/// Each chat message maps to exactly one wire message so extension indexes line up.
fn encode_message(msg: &ChatMessage) -> OpenAiMessage {
    match msg.role {
        ChatRole::Developer => OpenAiMessage::Developer {
            content: msg.text(),
        },
        ChatRole::User => OpenAiMessage::User {
            content: msg.text(),
        },
        ChatRole::Assistant => {
            let text = msg.text();
            let calls: Vec<OpenAiToolCall> = msg
                .tool_calls()
                .map(|c| OpenAiToolCall {
                    id: c.id.clone(),
                    kind: c.kind.as_str().to_string(),
                    function: OpenAiFunctionCall {
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    },
                })
                .collect();
            OpenAiMessage::Assistant {
                content: (!text.is_empty() || calls.is_empty()).then_some(text),
                tool_calls: (!calls.is_empty()).then_some(calls),
            }
        }
        ChatRole::Tool => {
            let (tool_call_id, content) = match &msg.content {
                MessagePart::Parts(parts) => parts
                    .iter()
                    .find_map(|p| match p {
                        ContentBlock::ToolResult {
                            tool_call_id,
                            content,
                        } => Some((tool_call_id.clone(), content.clone())),
                        _ => None,
                    })
                    .unwrap_or_else(|| (String::new(), msg.text())),
                MessagePart::Text(text) => (String::new(), text.clone()),
            };
            OpenAiMessage::Tool {
                tool_call_id,
                content,
            }
        }
    }
}

/// Turn a complete (non-streamed) response body into one equivalent fragment.
pub fn decode_response(raw: &str) -> Result<Fragment> {
    let response: OpenAiResponse = serde_json::from_str(raw)
        .map_err(|e| Error::Transport(format!("malformed chat completion: {e}")))?;

    let delta = response.choices.into_iter().next().map(|choice| {
        let m = choice.message;
        FragmentDelta {
            reasoning: join_text(m.reasoning, m.reasoning_content),
            content: join_text(m.content, m.refusal),
            tool_calls: m
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, tc)| ToolCallDelta {
                    index: i as u32,
                    id: Some(tc.id),
                    kind: Some(ToolCallKind::parse(&tc.kind)),
                    name: Some(tc.function.name),
                    arguments: tc.function.arguments,
                })
                .collect(),
            finish_reason: choice.finish_reason,
        }
    });

    Ok(Fragment {
        seq: 0,
        model: response.model,
        delta,
        usage: response.usage.map(Into::into),
        error: response.error.map(Into::into),
    })
}

fn decode_chunk(seq: usize, data: &str) -> Result<Fragment> {
    let chunk: OpenAiStreamChunk = serde_json::from_str(data)
        .map_err(|e| Error::Transport(format!("malformed stream chunk: {e}")))?;

    let delta = chunk.choices.into_iter().next().map(|choice| {
        let d = choice.delta;
        FragmentDelta {
            reasoning: join_text(d.reasoning, d.reasoning_content),
            content: join_text(d.content, d.refusal),
            tool_calls: d
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|tc| {
                    let (name, arguments) = match tc.function {
                        Some(f) => (f.name, f.arguments.unwrap_or_default()),
                        None => (None, String::new()),
                    };
                    ToolCallDelta {
                        index: tc.index,
                        id: tc.id,
                        kind: tc.kind.as_deref().map(ToolCallKind::parse),
                        name,
                        arguments,
                    }
                })
                .collect(),
            finish_reason: choice.finish_reason,
        }
    });

    Ok(Fragment {
        seq,
        model: chunk.model,
        delta,
        usage: chunk.usage.map(Into::into),
        error: chunk.error.map(Into::into),
    })
}

fn join_text(a: Option<String>, b: Option<String>) -> String {
    let mut out = a.unwrap_or_default();
    if let Some(b) = b {
        out.push_str(&b);
    }
    out
}

// Request types
#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAiStreamOptions>,
}

#[derive(Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    Developer {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: OpenAiFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAiFunctionDefinition,
}

#[derive(Serialize)]
struct OpenAiFunctionDefinition {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize)]
struct OpenAiResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
    error: Option<OpenAiError>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    refusal: Option<String>,
    reasoning: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<OpenAiUsage> for TokenUsage {
    fn from(u: OpenAiUsage) -> Self {
        TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }
    }
}

/// Servers disagree on whether `code` is a number or a string.
#[derive(Deserialize)]
struct OpenAiError {
    code: Option<serde_json::Value>,
    message: Option<String>,
}

impl From<OpenAiError> for ServerError {
    fn from(e: OpenAiError) -> Self {
        let code = e.code.and_then(|c| match c {
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });
        ServerError {
            code,
            message: e.message,
        }
    }
}

// Stream parser
struct SseParser {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
    queue: VecDeque<Result<Fragment>>,
    seq: usize,
    finished: bool,
}

impl SseParser {
    fn new(stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static) -> Self {
        Self {
            stream: Box::pin(stream),
            buffer: Vec::new(),
            queue: VecDeque::new(),
            seq: 0,
            finished: false,
        }
    }

    /// Queue a fragment for every complete event in the buffer.
    fn drain_events(&mut self) {
        while let Some((pos, len)) = find_delimiter(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..pos).collect();
            self.buffer.drain(..len);
            self.parse_event(&event);
        }
    }

    fn parse_event(&mut self, event: &[u8]) {
        let text = String::from_utf8_lossy(event);
        for line in text.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let fragment = decode_chunk(self.seq, data);
            self.seq += 1;
            self.queue.push_back(fragment);
        }
    }
}

fn find_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

impl Stream for SseParser {
    type Item = Result<Fragment>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buffer.extend_from_slice(&chunk);
                    self.drain_events();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(Error::Transport(format!(
                        "stream error: {e}"
                    )))));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    // a final event without a trailing blank line
                    let rest = std::mem::take(&mut self.buffer);
                    if !rest.is_empty() {
                        self.parse_event(&rest);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// Stream response types
#[derive(Deserialize)]
struct OpenAiStreamChunk {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
    error: Option<OpenAiError>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiStreamDelta {
    content: Option<String>,
    refusal: Option<String>,
    reasoning: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiStreamToolCall {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    function: Option<OpenAiStreamFunctionCall>,
}

#[derive(Deserialize)]
struct OpenAiStreamFunctionCall {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{RequestExtensions, ToolCall, ToolDefinition};
    use futures::StreamExt;
    use serde_json::json;

    fn parse_all(chunks: Vec<&'static str>) -> Vec<Result<Fragment>> {
        let input = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<Bytes, reqwest::Error>(Bytes::from_static(c.as_bytes()))),
        );
        futures::executor::block_on(SseParser::new(input).collect::<Vec<_>>())
    }

    #[test]
    fn encode_tool_turn_and_extensions() {
        let mut extensions = RequestExtensions::default();
        extensions.set_message(2, "thinking", json!("need weather"));
        extensions.set_body("reasoning_effort", json!("low"));

        let request = ChatRequest {
            model: "gpt-oss".to_string(),
            messages: vec![
                ChatMessage::developer("be brief"),
                ChatMessage::user("weather?"),
                ChatMessage::assistant_tool_call(ToolCall {
                    id: "call_1".to_string(),
                    kind: ToolCallKind::Function,
                    name: "get_weather".to_string(),
                    arguments: r#"{"location":"London"}"#.to_string(),
                }),
                ChatMessage::tool_result("call_1", "15°C"),
            ],
            tools: vec![ToolDefinition {
                name: "get_weather".to_string(),
                description: "Current weather".to_string(),
                input_schema: json!({"type": "object"}),
            }],
            stream: true,
            extensions,
        };

        let body = encode_request(&request).unwrap();
        assert_eq!(body["model"], "gpt-oss");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["reasoning_effort"], "low");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "developer");
        assert_eq!(messages[2]["role"], "assistant");
        assert!(messages[2]["content"].is_null());
        assert_eq!(messages[2]["thinking"], "need weather");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            r#"{"location":"London"}"#
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert_eq!(messages[3]["content"], "15°C");
    }

    #[test]
    fn non_streaming_request_omits_stream_options() {
        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user("hi")],
            ..Default::default()
        };
        let body = encode_request(&request).unwrap();
        assert_eq!(body["stream"], false);
        assert!(body.get("stream_options").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn chunk_merges_reasoning_and_refusal_fields() {
        let f = decode_chunk(
            3,
            r#"{"model":"m","choices":[{"delta":{"reasoning_content":"a","reasoning":"b","content":"c","refusal":"d"}}]}"#,
        )
        .unwrap();
        let delta = f.delta.unwrap();
        assert_eq!(f.seq, 3);
        assert_eq!(delta.reasoning, "ba");
        assert_eq!(delta.content, "cd");
    }

    #[test]
    fn chunk_without_choices_keeps_error() {
        let f = decode_chunk(0, r#"{"choices":[],"error":{"code":"429","message":"rate limited"}}"#)
            .unwrap();
        assert!(f.delta.is_none());
        let err = f.error.unwrap();
        assert_eq!(err.code, Some(429));
        assert_eq!(err.message.as_deref(), Some("rate limited"));
    }

    #[test]
    fn sse_events_split_across_reads() {
        let frags = parse_all(vec![
            "data: {\"choices\":[{\"delta\":{\"reas",
            "oning\":\"hm\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\r\n\r\n",
            "data: [DONE]\n\n",
        ]);
        assert_eq!(frags.len(), 2);
        let first = frags[0].as_ref().unwrap();
        let second = frags[1].as_ref().unwrap();
        assert_eq!(first.delta.as_ref().unwrap().reasoning, "hm");
        assert_eq!(second.delta.as_ref().unwrap().content, "ok");
        assert_eq!(second.seq, 1);
    }

    #[test]
    fn sse_tool_call_deltas() {
        let frags = parse_all(vec![
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_9\",\"type\":\"function\",\"function\":{\"name\":\"python\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}",
        ]);
        assert_eq!(frags.len(), 3);
        let start = &frags[0].as_ref().unwrap().delta.as_ref().unwrap().tool_calls[0];
        assert_eq!(start.id.as_deref(), Some("call_9"));
        assert_eq!(start.kind, Some(ToolCallKind::Function));
        assert_eq!(start.name.as_deref(), Some("python"));
        let more = &frags[1].as_ref().unwrap().delta.as_ref().unwrap().tool_calls[0];
        assert!(more.name.is_none());
        assert_eq!(more.arguments, "{}");
        let last = frags[2].as_ref().unwrap().delta.as_ref().unwrap();
        assert_eq!(last.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn sse_malformed_chunk_is_transport_error() {
        let frags = parse_all(vec!["data: {not json}\n\n"]);
        assert!(matches!(frags[0], Err(Error::Transport(_))));
    }

    #[test]
    fn complete_response_becomes_one_fragment() {
        let f = decode_response(
            r#"{
                "model": "gpt-oss-20b",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "reasoning_content": "call it",
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "get_weather", "arguments": "{\"location\":\"Paris\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 40, "completion_tokens": 9}
            }"#,
        )
        .unwrap();
        let delta = f.delta.unwrap();
        assert_eq!(f.model.as_deref(), Some("gpt-oss-20b"));
        assert_eq!(delta.reasoning, "call it");
        assert_eq!(delta.tool_calls[0].name.as_deref(), Some("get_weather"));
        assert_eq!(f.usage.unwrap().completion_tokens, 9);
    }
}
