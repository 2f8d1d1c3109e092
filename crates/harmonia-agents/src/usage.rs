use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::providers::TokenUsage;

/// Call counts, latency and token totals across one turn loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Model name reported by the most recent response.
    pub model: String,
    pub api_calls: u32,
    /// Total time spent waiting on requests, in milliseconds.
    pub api_time_ms: u64,
    pub completion_tokens: u64,
    /// Prompt length of the most recent request.
    pub prompt_tokens: u32,
    pub tool_calls: u32,
    pub functions: BTreeMap<String, u32>,
    pub tool_time_ms: u64,
}

impl UsageRecord {
    pub fn record_request(
        &mut self,
        model: Option<&str>,
        usage: Option<TokenUsage>,
        elapsed: Duration,
    ) {
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            self.model = model.to_string();
        }
        self.api_calls += 1;
        self.api_time_ms += elapsed.as_millis() as u64;
        if let Some(usage) = usage {
            self.completion_tokens += u64::from(usage.completion_tokens);
            self.prompt_tokens = usage.prompt_tokens;
        }
    }

    pub fn record_tool(&mut self, name: &str, elapsed: Duration) {
        self.tool_calls += 1;
        *self.functions.entry(name.to_string()).or_default() += 1;
        self.tool_time_ms += elapsed.as_millis() as u64;
    }

    pub fn completion_tokens_per_sec(&self) -> f64 {
        if self.api_time_ms == 0 {
            return 0.0;
        }
        1000.0 * self.completion_tokens as f64 / self.api_time_ms as f64
    }

    pub fn log_summary(&self) {
        info!(
            "{} API calls in {:?}  {} prompt tokens  {} completion tokens at {:.1} tok/sec",
            self.api_calls,
            Duration::from_millis(self.api_time_ms),
            self.prompt_tokens,
            self.completion_tokens,
            self.completion_tokens_per_sec()
        );
        if self.tool_calls > 0 {
            let funcs = self
                .functions
                .iter()
                .map(|(name, count)| format!("{name}:{count}"))
                .collect::<Vec<_>>()
                .join(" ");
            info!(
                "{} tool calls in {:?} - {}",
                self.tool_calls,
                Duration::from_millis(self.tool_time_ms),
                funcs
            );
        }
    }
}
