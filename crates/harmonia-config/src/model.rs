use harmonia_common::{ConversationConfig, Error, ReasoningEffort, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub endpoint: EndpointConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
}

/// Where requests go and how they authenticate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub backend: String,
    /// Falls back to the backend's well-known URL when unset.
    pub base_url: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            backend: "llamacpp".to_string(),
            base_url: None,
            model: String::new(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl EndpointConfig {
    pub fn resolved_base_url(&self) -> String {
        if let Some(url) = &self.base_url {
            return url.trim_end_matches('/').to_string();
        }
        match self.backend.as_str() {
            "openrouter" => "https://openrouter.ai/api/v1",
            "openai" => "https://api.openai.com/v1",
            _ => "http://localhost:8080/v1",
        }
        .to_string()
    }

    /// Explicit key first, then the configured environment variable.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub stream: bool,
    /// Empty-stop retries tolerated before a turn fails.
    pub max_empty_retries: u32,
    pub turn_timeout_secs: Option<u64>,
    pub system_prompt: String,
    pub reasoning_effort: ReasoningEffort,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            stream: true,
            max_empty_retries: 3,
            turn_timeout_secs: None,
            system_prompt: String::new(),
            reasoning_effort: ReasoningEffort::Medium,
        }
    }
}

impl AgentConfig {
    /// Settings for a new conversation, with every named tool enabled.
    pub fn conversation_config<I, S>(&self, tools: I) -> ConversationConfig
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ConversationConfig {
            system_prompt: self.system_prompt.clone(),
            reasoning_effort: Some(self.reasoning_effort),
            ..ConversationConfig::with_tools(tools)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Log every outgoing request body and raw stream fragment at debug level.
    pub debug_payloads: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            debug_payloads: false,
        }
    }
}

impl AppConfig {
    /// Checks settings that do not depend on the backend table.
    ///
    /// Backend ids are resolved against the adaptation profiles when the
    /// runtime is built, so an unknown id passes here.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.backend.trim().is_empty() {
            return Err(Error::Config("endpoint.backend must not be empty".to_string()));
        }
        if self.endpoint.backend != "llamacpp" && self.endpoint.model.trim().is_empty() {
            return Err(Error::Config(format!(
                "endpoint.model is required for backend '{}'",
                self.endpoint.backend
            )));
        }
        if self.agent.max_empty_retries == 0 {
            return Err(Error::Config(
                "agent.max_empty_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
