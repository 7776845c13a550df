use serde::{Deserialize, Serialize};

/// Summary of one stream run, provider-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunTrace {
    /// Caller-supplied run identifier.
    pub run_id: Option<String>,

    /// Provider identifier, e.g. "deepseek", "ollama".
    pub provider: Option<String>,

    /// Model identifier, e.g. "deepseek-reasoner".
    pub model: Option<String>,

    /// Wall time from first poll to terminal event.
    pub latency_ms: Option<u64>,

    /// Number of events handed to the sink, terminal event included.
    pub events: u64,

    /// Completed function-call regions.
    pub tool_calls: u32,

    /// "complete", "cancelled" or "error".
    pub outcome: Option<String>,

    pub error_message: Option<String>,
}

impl RunTrace {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn run_id(mut self, id: &str) -> Self {
        self.run_id = Some(id.to_string());
        self
    }
    pub fn provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }
    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
    pub fn events(mut self, n: u64) -> Self {
        self.events = n;
        self
    }
    pub fn tool_calls(mut self, n: u32) -> Self {
        self.tool_calls = n;
        self
    }
    pub fn outcome(mut self, outcome: &str) -> Self {
        self.outcome = Some(outcome.to_string());
        self
    }
    pub fn error_message_opt(mut self, msg: Option<&str>) -> Self {
        self.error_message = msg.map(|s| s.to_string());
        self
    }
}

/// One validator decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationLog {
    pub run_id: Option<String>,
    pub tool_name: String,
    pub valid: bool,
    pub code: Option<String>,
    pub message: Option<String>,
    pub decision: Option<serde_json::Value>,
}
