/// Span/log attribute keys for stream runs.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_RUN_ID: &str = "run.id";
pub const KEY_PROVIDER: &str = "llm.provider";
pub const KEY_MODEL: &str = "llm.model";

pub const KEY_EVENTS: &str = "events.count";
pub const KEY_TOOL_CALLS: &str = "tool.calls";
pub const KEY_OUTCOME: &str = "run.outcome";
pub const KEY_LATENCY_MS: &str = "latency.ms";

/// Tool-call related
pub const KEY_TOOL_NAME: &str = "tool.name";
pub const KEY_VALIDATION_CODE: &str = "validation.code";
