use std::sync::Arc;
use std::time::{Duration, Instant};

use harmonia_common::{Error, Result};
use harmonia_config::AppConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::accumulator::{AccumulatedMessage, FragmentAccumulator, TurnOutcome};
use crate::backend::BackendProfile;
use crate::cancel::TurnGuard;
use crate::conversation::Conversation;
use crate::events::{Channel, EventSink, TurnEvent, UsageSink};
use crate::openai::encode_request;
use crate::providers::{ChatMessage, ChatRequest, ChatTransport, ToolCall, ToolCallKind};
use crate::tools::{Tool, ToolRegistry};
use crate::usage::UsageRecord;

/// Empty-stop retries tolerated before a turn fails.
pub const DEFAULT_MAX_EMPTY_RETRIES: u32 = 3;

/// Everything the turn loop needs to know that is not part of a conversation.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub model: String,
    pub backend: &'static BackendProfile,
    pub stream: bool,
    pub max_empty_retries: u32,
    /// Deadline for a whole turn, covering every request and tool call in it.
    pub turn_timeout: Option<Duration>,
    /// Log each outgoing request body and every raw fragment at debug level.
    pub debug_payloads: bool,
}

impl RuntimeConfig {
    pub fn new(model: impl Into<String>, backend: &'static BackendProfile) -> Self {
        Self {
            model: model.into(),
            backend,
            stream: true,
            max_empty_retries: DEFAULT_MAX_EMPTY_RETRIES,
            turn_timeout: None,
            debug_payloads: false,
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            model: config.endpoint.model.clone(),
            backend: BackendProfile::lookup(&config.endpoint.backend)?,
            stream: config.agent.stream,
            max_empty_retries: config.agent.max_empty_retries,
            turn_timeout: config.agent.turn_timeout_secs.map(Duration::from_secs),
            debug_payloads: config.logging.debug_payloads,
        })
    }
}

/// Result of a successful turn.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub final_text: String,
    /// The caller's conversation extended with every message this turn produced.
    pub conversation: Conversation,
    pub usage: UsageRecord,
}

/// Drives submit, accumulate, classify and invoke until the model answers.
pub struct AgentRuntime {
    transport: Arc<dyn ChatTransport>,
    tools: ToolRegistry,
    config: RuntimeConfig,
}

impl AgentRuntime {
    pub fn new(transport: Arc<dyn ChatTransport>, config: RuntimeConfig) -> Self {
        Self {
            transport,
            tools: ToolRegistry::new(),
            config,
        }
    }

    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        info!("registered tool: {}", tool.name());
        self.tools.register(tool);
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run one logical turn: from the conversation's last user message to a
    /// final answer.
    ///
    /// `conversation` is not modified; the extended history is returned in
    /// [`TurnOutput::conversation`]. Events and usage snapshots are delivered
    /// while the turn runs. Cancelling `cancel` aborts the in-flight read or
    /// tool call with [`Error::Cancelled`].
    #[instrument(
        skip_all,
        fields(
            conversation_id = %conversation.id,
            transport = self.transport.transport_id(),
            backend = self.config.backend.id,
        )
    )]
    pub async fn run_turn(
        &self,
        conversation: &Conversation,
        events: &dyn EventSink,
        usage_sink: &dyn UsageSink,
        cancel: CancellationToken,
    ) -> Result<TurnOutput> {
        let guard = TurnGuard::new(cancel, self.config.turn_timeout);
        let mut convo = conversation.clone();
        let tools = convo.enabled_tools(&self.tools);
        let mut usage = UsageRecord::default();
        let mut empty_retries = 0u32;
        let mut pending_reasoning = String::new();

        loop {
            guard.check()?;
            let request = self.build_request(&convo, &tools, &pending_reasoning);
            let message = self.submit(&request, events, &guard, &mut usage).await?;
            usage_sink.on_usage(&usage);

            if !message.saw_choice {
                let server = message.server_error.unwrap_or_default();
                return Err(Error::empty_response(server.code, server.message));
            }

            match message.outcome() {
                TurnOutcome::FinalAnswer(text) => {
                    events.on_event(TurnEvent::new(
                        Channel::Final,
                        text.clone(),
                        message.next_index,
                        true,
                    ));
                    convo.messages.push(ChatMessage::assistant(text.clone()));
                    usage.log_summary();
                    return Ok(TurnOutput {
                        final_text: text,
                        conversation: convo,
                        usage,
                    });
                }
                TurnOutcome::ToolCall(call) => {
                    if call.kind != ToolCallKind::Function {
                        return Err(Error::UnsupportedToolCall(call.kind.as_str().to_string()));
                    }
                    let (request_text, response_text) =
                        self.invoke(&tools, &call, &guard, &mut usage).await?;
                    usage_sink.on_usage(&usage);
                    events.on_event(TurnEvent::new(
                        Channel::Tool,
                        format!("{request_text}\n{response_text}\n"),
                        0,
                        false,
                    ));

                    let call_id = call.id.clone();
                    convo.messages.push(ChatMessage::assistant_tool_call(call));
                    convo
                        .messages
                        .push(ChatMessage::tool_result(call_id, response_text));
                    pending_reasoning = message.reasoning;
                    empty_retries = 0;
                }
                TurnOutcome::EmptyStop => {
                    if empty_retries >= self.config.max_empty_retries {
                        warn!(attempts = empty_retries + 1, "giving up after empty responses");
                        return Err(Error::EmptyStop {
                            attempts: empty_retries + 1,
                        });
                    }
                    empty_retries += 1;
                    warn!(
                        retry = empty_retries,
                        max = self.config.max_empty_retries,
                        finish_reason = ?message.finish_reason,
                        "model stopped without an answer or tool call, retrying"
                    );
                    if !message.reasoning.is_empty() {
                        convo
                            .messages
                            .push(ChatMessage::assistant(message.reasoning));
                    }
                    pending_reasoning.clear();
                }
            }
        }
    }

    fn build_request(
        &self,
        convo: &Conversation,
        tools: &ToolRegistry,
        pending_reasoning: &str,
    ) -> ChatRequest {
        let mut request = ChatRequest {
            model: self.config.model.clone(),
            messages: convo.request_messages(),
            tools: tools.definitions(),
            stream: self.config.stream,
            extensions: Default::default(),
        };
        self.config.backend.adapt(
            &mut request.extensions,
            &request.messages,
            pending_reasoning,
            convo.config.reasoning_effort,
        );
        request
    }

    async fn submit(
        &self,
        request: &ChatRequest,
        events: &dyn EventSink,
        guard: &TurnGuard,
        usage: &mut UsageRecord,
    ) -> Result<AccumulatedMessage> {
        if self.config.debug_payloads {
            match encode_request(request) {
                Ok(body) => debug!(body = %body, "outgoing request"),
                Err(e) => debug!("could not encode request for logging: {}", e),
            }
        }

        let started = Instant::now();
        let stream = guard.run(self.transport.submit(request)).await??;
        let message = FragmentAccumulator::new()
            .with_fragment_logging(self.config.debug_payloads)
            .consume(stream, events, guard)
            .await?;
        usage.record_request(message.model.as_deref(), message.usage, started.elapsed());
        debug!(
            fragments = message.fragments,
            finish_reason = ?message.finish_reason,
            "response accumulated"
        );
        Ok(message)
    }

    /// Run a tool call and render its request and result text.
    ///
    /// Unknown tools and tool failures become text for the model; only
    /// cancellation escapes.
    async fn invoke(
        &self,
        tools: &ToolRegistry,
        call: &ToolCall,
        guard: &TurnGuard,
        usage: &mut UsageRecord,
    ) -> Result<(String, String)> {
        let Some(tool) = tools.get(&call.name) else {
            warn!(name = %call.name, "model called a tool that is not enabled");
            return Ok((
                describe_call(call),
                format!("Error: function \"{}\" is not defined", call.name),
            ));
        };

        info!(name = %call.name, id = %call.id, "calling tool");
        let started = Instant::now();
        let result = guard.run(tool.execute(&call.arguments)).await?;
        usage.record_tool(&call.name, started.elapsed());

        Ok(match result {
            Ok(output) => (output.request, output.content),
            Err(e) => {
                warn!(name = %call.name, "tool failed: {}", e);
                (describe_call(call), tool_error_text(&call.name, &e))
            }
        })
    }
}

fn describe_call(call: &ToolCall) -> String {
    format!("{}{}", call.name, call.arguments)
}

fn tool_error_text(name: &str, err: &Error) -> String {
    let detail = match err {
        Error::Tool(msg) => msg.clone(),
        other => other.to_string(),
    };
    format!("Error calling {name} function: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use harmonia_common::ReasoningEffort;

    #[test]
    fn config_from_app_config() {
        let mut app = AppConfig::default();
        app.endpoint.backend = "openrouter".to_string();
        app.endpoint.model = "openai/gpt-oss-120b".to_string();
        app.agent.turn_timeout_secs = Some(90);
        app.agent.stream = false;
        app.logging.debug_payloads = true;

        let cfg = RuntimeConfig::from_app_config(&app).unwrap();
        assert_eq!(cfg.backend.id, "openrouter");
        assert_eq!(cfg.model, "openai/gpt-oss-120b");
        assert_eq!(cfg.turn_timeout, Some(Duration::from_secs(90)));
        assert_eq!(cfg.max_empty_retries, DEFAULT_MAX_EMPTY_RETRIES);
        assert!(!cfg.stream);
        assert!(cfg.debug_payloads);
    }

    #[test]
    fn config_rejects_unknown_backend() {
        let mut app = AppConfig::default();
        app.endpoint.backend = "vllm".to_string();
        assert!(matches!(
            RuntimeConfig::from_app_config(&app),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn tool_error_text_unwraps_tool_errors() {
        assert_eq!(
            tool_error_text("get_weather", &Error::Tool("city not found".to_string())),
            "Error calling get_weather function: city not found"
        );
        assert_eq!(
            tool_error_text("python", &Error::Transport("timeout".to_string())),
            "Error calling python function: transport error: timeout"
        );
    }

    #[test]
    fn describe_call_joins_name_and_arguments() {
        let call = ToolCall {
            id: "call_1".to_string(),
            kind: ToolCallKind::Function,
            name: "browser_search".to_string(),
            arguments: r#"{"query":"rust"}"#.to_string(),
        };
        assert_eq!(describe_call(&call), r#"browser_search{"query":"rust"}"#);
    }

    #[test]
    fn build_request_applies_backend_adaptation() {
        struct Unused;

        #[async_trait::async_trait]
        impl ChatTransport for Unused {
            fn transport_id(&self) -> &str {
                "unused"
            }

            async fn submit(
                &self,
                _request: &ChatRequest,
            ) -> Result<crate::providers::FragmentStream> {
                Err(Error::Transport("not used".to_string()))
            }
        }

        let runtime = AgentRuntime::new(
            Arc::new(Unused),
            RuntimeConfig::new("gpt-oss", BackendProfile::lookup("llamacpp").unwrap()),
        );
        let mut convo = Conversation::new(harmonia_common::ConversationConfig {
            system_prompt: "be brief".to_string(),
            reasoning_effort: Some(ReasoningEffort::Low),
            tools: Vec::new(),
        });
        convo.push_user("hi");

        let request = runtime.build_request(&convo, runtime.tools(), "");
        assert_eq!(request.messages.len(), 2);
        assert!(request.stream);
        assert_eq!(request.extensions.body["reasoning_effort"], "low");
        assert!(request.extensions.messages.is_empty());
    }
}
