use std::sync::Arc;

use async_trait::async_trait;
use harmonia_common::{ConversationConfig, Result};

use crate::providers::ToolDefinition;

/// A capability the model may ask to have invoked.
///
/// Runtime failures (bad arguments, unreachable services) should come back as
/// `Err(Error::Tool(..))` or be written into `ToolOutput::content`; either
/// way the model sees them as text and decides what to do next.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the argument object.
    fn input_schema(&self) -> serde_json::Value;

    /// Invoke with the raw JSON argument text from the model.
    async fn execute(&self, arguments: &str) -> Result<ToolOutput>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Human readable rendering of the request, e.g. `get_weather{location:London}`.
    pub request: String,
    pub content: String,
}

impl ToolOutput {
    pub fn new(request: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            content: content.into(),
        }
    }
}

/// Name-keyed set of tools available to a runtime.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later tool with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// The subset enabled by a conversation's settings, in registration order.
    pub fn enabled(&self, config: &ConversationConfig) -> ToolRegistry {
        ToolRegistry {
            tools: self
                .tools
                .iter()
                .filter(|t| config.is_tool_enabled(t.name()))
                .cloned()
                .collect(),
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
