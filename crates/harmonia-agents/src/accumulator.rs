//! Merges the fragments of one streamed response into a single message.
//!
//! The accumulator de-interleaves reasoning and answer text into the
//! `analysis` and `final` channels as fragments arrive, and assembles at most
//! one tool call from partial argument deltas. Once that call is complete the
//! rest of the stream is left unread.

use futures::StreamExt;
use harmonia_common::Result;
use tracing::{debug, warn};

use crate::cancel::TurnGuard;
use crate::events::{Channel, EventSink, TurnEvent};
use crate::providers::{
    Fragment, FragmentStream, ServerError, TokenUsage, ToolCall, ToolCallDelta, ToolCallKind,
};

/// Merge state for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedMessage {
    pub model: Option<String>,
    pub reasoning: String,
    pub content: String,
    /// First complete tool call. Later calls in the same response are ignored.
    pub tool_call: Option<ToolCall>,
    /// True when the response started a second tool call that was not actioned.
    pub dropped_tool_call: bool,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub server_error: Option<ServerError>,
    /// Number of fragments consumed.
    pub fragments: usize,
    /// False when no fragment carried a choice.
    pub saw_choice: bool,
    /// Reasoning arrived after the answer had started and was not emitted.
    pub late_reasoning: bool,
    /// Index the next event of the current channel burst would take.
    pub next_index: usize,
}

/// What the runtime should do with an accumulated response.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    FinalAnswer(String),
    ToolCall(ToolCall),
    EmptyStop,
}

impl AccumulatedMessage {
    /// A pending tool call wins over any visible text.
    pub fn outcome(&self) -> TurnOutcome {
        if let Some(call) = &self.tool_call {
            return TurnOutcome::ToolCall(call.clone());
        }
        if !self.content.is_empty() {
            return TurnOutcome::FinalAnswer(self.content.clone());
        }
        TurnOutcome::EmptyStop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}

#[derive(Debug)]
struct PartialToolCall {
    index: u32,
    id: String,
    kind: Option<ToolCallKind>,
    name: String,
    arguments: String,
}

impl PartialToolCall {
    fn start(delta: ToolCallDelta) -> Self {
        Self {
            index: delta.index,
            id: delta.id.unwrap_or_default(),
            kind: delta.kind,
            name: delta.name.unwrap_or_default(),
            arguments: delta.arguments,
        }
    }

    fn merge(&mut self, delta: ToolCallDelta) {
        if self.id.is_empty() {
            self.id = delta.id.unwrap_or_default();
        }
        if self.kind.is_none() {
            self.kind = delta.kind;
        }
        if self.name.is_empty() {
            self.name = delta.name.unwrap_or_default();
        }
        self.arguments.push_str(&delta.arguments);
    }

    fn into_call(self) -> ToolCall {
        let id = if self.id.is_empty() {
            format!("call_{}", uuid::Uuid::new_v4().simple())
        } else {
            self.id
        };
        ToolCall {
            id,
            kind: self.kind.unwrap_or_default(),
            name: self.name,
            arguments: self.arguments,
        }
    }
}

pub struct FragmentAccumulator {
    message: AccumulatedMessage,
    channel: Channel,
    index: usize,
    pending: Option<PartialToolCall>,
    log_fragments: bool,
}

impl Default for FragmentAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentAccumulator {
    pub fn new() -> Self {
        Self {
            message: AccumulatedMessage::default(),
            channel: Channel::Analysis,
            index: 0,
            pending: None,
            log_fragments: false,
        }
    }

    /// Log every raw fragment at debug level.
    pub fn with_fragment_logging(mut self, enabled: bool) -> Self {
        self.log_fragments = enabled;
        self
    }

    /// Fold one fragment into the message, emitting channel events for its text.
    pub fn push(&mut self, fragment: Fragment, sink: &dyn EventSink) -> Step {
        if self.message.tool_call.is_some() {
            return Step::Stop;
        }
        if self.log_fragments {
            debug!(fragment = ?fragment, "stream fragment");
        }

        self.message.fragments += 1;
        if let Some(model) = fragment.model.filter(|m| !m.is_empty()) {
            self.message.model = Some(model);
        }
        if fragment.usage.is_some() {
            self.message.usage = fragment.usage;
        }
        if fragment.error.is_some() {
            self.message.server_error = fragment.error;
        }

        let Some(delta) = fragment.delta else {
            return Step::Continue;
        };
        self.message.saw_choice = true;

        if !delta.reasoning.is_empty() {
            self.push_reasoning(delta.reasoning, sink);
        }
        if !delta.content.is_empty() {
            self.push_content(delta.content, sink);
        }
        for call in delta.tool_calls {
            if self.push_tool_call(call, sink) == Step::Stop {
                self.message.finish_reason = delta.finish_reason;
                return Step::Stop;
            }
        }
        if let Some(reason) = delta.finish_reason {
            self.message.finish_reason = Some(reason);
            if self.pending.is_some() {
                self.complete_tool_call(sink);
                return Step::Stop;
            }
        }
        Step::Continue
    }

    /// Close out the stream. A tool call still open at stream end is complete.
    pub fn finish(mut self, sink: &dyn EventSink) -> AccumulatedMessage {
        if self.pending.is_some() {
            self.complete_tool_call(sink);
        }
        self.message.next_index = self.index;
        self.message
    }

    /// Read `stream` until it ends or a tool call completes.
    pub async fn consume(
        mut self,
        mut stream: FragmentStream,
        sink: &dyn EventSink,
        guard: &TurnGuard,
    ) -> Result<AccumulatedMessage> {
        while let Some(item) = guard.run(stream.next()).await? {
            if self.push(item?, sink) == Step::Stop {
                debug!(
                    fragments = self.message.fragments,
                    "tool call complete, not reading the rest of the stream"
                );
                break;
            }
        }
        let message = self.finish(sink);
        if message.dropped_tool_call {
            warn!("response contained more than one tool call; only the first is actioned");
        }
        Ok(message)
    }

    fn push_reasoning(&mut self, text: String, sink: &dyn EventSink) {
        self.message.reasoning.push_str(&text);
        if self.channel == Channel::Analysis {
            sink.on_event(TurnEvent::new(Channel::Analysis, text, self.index, false));
            self.index += 1;
        } else {
            self.message.late_reasoning = true;
        }
    }

    fn push_content(&mut self, text: String, sink: &dyn EventSink) {
        if self.channel == Channel::Analysis {
            let had_analysis = self.index > 0;
            self.channel = Channel::Final;
            self.index = 0;
            if had_analysis {
                sink.on_event(TurnEvent::line_break(Channel::Final, 0));
                self.index = 1;
            }
        }
        self.message.content.push_str(&text);
        sink.on_event(TurnEvent::new(Channel::Final, text, self.index, false));
        self.index += 1;
    }

    fn push_tool_call(&mut self, delta: ToolCallDelta, sink: &dyn EventSink) -> Step {
        match &mut self.pending {
            Some(pending) if pending.index != delta.index => {
                self.message.dropped_tool_call = true;
                self.complete_tool_call(sink);
                Step::Stop
            }
            Some(pending) => {
                pending.merge(delta);
                Step::Continue
            }
            None => {
                self.pending = Some(PartialToolCall::start(delta));
                Step::Continue
            }
        }
    }

    fn complete_tool_call(&mut self, sink: &dyn EventSink) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if self.index > 0 {
            sink.on_event(TurnEvent::line_break(self.channel, self.index));
            self.index += 1;
        }
        let call = pending.into_call();
        debug!(name = %call.name, id = %call.id, "tool call assembled");
        self.message.tool_call = Some(call);
    }
}
