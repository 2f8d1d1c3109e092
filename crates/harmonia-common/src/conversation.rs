use serde::{Deserialize, Serialize};

/// Hint passed to reasoning models on how much thinking to spend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    #[default]
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

impl std::str::FromStr for ReasoningEffort {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            other => Err(crate::Error::Config(format!(
                "unknown reasoning effort '{other}' (expected low, medium or high)"
            ))),
        }
    }
}

/// Whether a named tool is offered to the model in this conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    pub enabled: bool,
}

/// Per-conversation settings, owned by the caller alongside the message history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Developer preamble sent ahead of the history. Empty means none.
    pub system_prompt: String,
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolConfig>,
}

impl ConversationConfig {
    /// Default settings with every named tool enabled.
    pub fn with_tools<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reasoning_effort: Some(ReasoningEffort::Medium),
            tools: names
                .into_iter()
                .map(|name| ToolConfig {
                    name: name.into(),
                    enabled: true,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn is_tool_enabled(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.enabled && t.name == name)
    }

    /// Enable or disable a tool, adding it to the list if it is not there yet.
    pub fn set_tool_enabled(&mut self, name: &str, enabled: bool) {
        match self.tools.iter_mut().find(|t| t.name == name) {
            Some(tool) => tool.enabled = enabled,
            None => self.tools.push(ToolConfig {
                name: name.to_string(),
                enabled,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_tools_enables_all() {
        let cfg = ConversationConfig::with_tools(["get_weather", "python"]);
        assert!(cfg.is_tool_enabled("get_weather"));
        assert!(cfg.is_tool_enabled("python"));
        assert!(!cfg.is_tool_enabled("browser.search"));
        assert_eq!(cfg.reasoning_effort, Some(ReasoningEffort::Medium));
    }

    #[test]
    fn set_tool_enabled_toggles_and_appends() {
        let mut cfg = ConversationConfig::with_tools(["python"]);
        cfg.set_tool_enabled("python", false);
        assert!(!cfg.is_tool_enabled("python"));
        cfg.set_tool_enabled("browser.open", true);
        assert!(cfg.is_tool_enabled("browser.open"));
        assert_eq!(cfg.tools.len(), 2);
    }

    #[test]
    fn reasoning_effort_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<ReasoningEffort>().unwrap(), ReasoningEffort::High);
        assert!("extreme".parse::<ReasoningEffort>().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let json = r#"{"system_prompt":"be brief","reasoning_effort":"low","tools":[{"name":"python","enabled":false}]}"#;
        let cfg: ConversationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.system_prompt, "be brief");
        assert_eq!(cfg.reasoning_effort, Some(ReasoningEffort::Low));
        assert!(!cfg.is_tool_enabled("python"));
    }
}
