pub mod accumulator;
pub mod backend;
pub mod cancel;
pub mod conversation;
pub mod events;
pub mod openai;
pub mod providers;
pub mod runtime;
pub mod tools;
pub mod usage;

pub use accumulator::{AccumulatedMessage, FragmentAccumulator, Step, TurnOutcome};
pub use backend::{BackendProfile, PROFILES};
pub use cancel::TurnGuard;
pub use conversation::Conversation;
pub use events::{Channel, EventSink, TurnEvent, UsageSink};
pub use openai::{OpenAiCompatTransport, encode_request};
pub use providers::{
    ChatMessage, ChatRequest, ChatRole, ChatTransport, ContentBlock, Fragment, FragmentDelta,
    FragmentStream, MessagePart, RequestExtensions, ServerError, TokenUsage, ToolCall,
    ToolCallDelta, ToolCallKind, ToolDefinition,
};
pub use runtime::{AgentRuntime, DEFAULT_MAX_EMPTY_RETRIES, RuntimeConfig, TurnOutput};
pub use tools::{Tool, ToolOutput, ToolRegistry};
pub use usage::UsageRecord;
