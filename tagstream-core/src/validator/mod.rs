//! Pre-execution check of a tool call against the assistant's stated
//! decision and its configured tools.

pub mod schema;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ToolCall, ToolDefinition};
use crate::telemetry::KEY_VALIDATION_CODE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    /// No decision JSON, or it lacks `tool_name`.
    ProtocolViolation,
    /// Stated `tool_name` differs from the tool actually called.
    DriftDetected,
    /// Arguments are not valid JSON.
    RuntimeError,
    /// Arguments do not satisfy the tool's parameter schema.
    SchemaViolation,
    /// The called tool is not configured for the assistant.
    HallucinationBlocked,
}

impl ValidationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
            Self::DriftDetected => "DRIFT_DETECTED",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::SchemaViolation => "SCHEMA_VIOLATION",
            Self::HallucinationBlocked => "HALLUCINATION_BLOCKED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub error: Option<ValidationCode>,
    pub message: Option<String>,
    /// Parsed decision record, when one was found.
    pub telemetry: Option<Value>,
}

impl ValidationOutcome {
    fn allowed(decision: Value) -> Self {
        Self {
            valid: true,
            error: None,
            message: None,
            telemetry: Some(decision),
        }
    }

    fn rejected(code: ValidationCode, message: impl Into<String>, decision: Option<Value>) -> Self {
        Self {
            valid: false,
            error: Some(code),
            message: Some(message.into()),
            telemetry: decision,
        }
    }
}

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("fence regex compiles"));

/// Find the decision JSON object in free-form assistant content.
/// Fenced ```json blocks win; otherwise the span from the first `{` to the
/// last `}` is tried.
pub fn extract_decision(content: &str) -> Option<Value> {
    for caps in JSON_FENCE.captures_iter(content) {
        if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&caps[1]) {
            return Some(v);
        }
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&content[start..=end]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// Stateless; safe to share across runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolValidator;

impl ProtocolValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(
        &self,
        content: &str,
        tool_call: &ToolCall,
        allowed_tools: &[ToolDefinition],
    ) -> ValidationOutcome {
        let span = tracing::debug_span!(
            "validate_tool_call",
            tool.name = %tool_call.function.name,
            validation.code = tracing::field::Empty,
        );
        let _entered = span.enter();
        let outcome = self.check(content, tool_call, allowed_tools);
        if let Some(code) = outcome.error {
            span.record(KEY_VALIDATION_CODE, code.as_str());
            tracing::warn!(
                tool.name = %tool_call.function.name,
                validation.code = code.as_str(),
                message = outcome.message.as_deref().unwrap_or(""),
                "tool call rejected"
            );
        }
        outcome
    }

    fn check(
        &self,
        content: &str,
        tool_call: &ToolCall,
        allowed_tools: &[ToolDefinition],
    ) -> ValidationOutcome {
        use ValidationCode::*;

        let Some(decision) = extract_decision(content) else {
            return ValidationOutcome::rejected(
                ProtocolViolation,
                "no decision JSON found in assistant content",
                None,
            );
        };
        let Some(stated) = decision.get("tool_name").and_then(Value::as_str) else {
            return ValidationOutcome::rejected(
                ProtocolViolation,
                "decision JSON has no \"tool_name\"",
                Some(decision),
            );
        };
        let called = tool_call.function.name.as_str();
        if stated != called {
            let msg = format!("decision names '{stated}' but the call is '{called}'");
            return ValidationOutcome::rejected(DriftDetected, msg, Some(decision));
        }

        if allowed_tools
            .iter()
            .any(|t| t.kind != "function" && t.kind == called)
        {
            return ValidationOutcome::allowed(decision);
        }

        let Some(def) = allowed_tools
            .iter()
            .filter(|t| t.kind == "function")
            .filter_map(|t| t.function.as_ref())
            .find(|f| f.name == called)
        else {
            let msg = format!("tool '{called}' is not configured for this assistant");
            return ValidationOutcome::rejected(HallucinationBlocked, msg, Some(decision));
        };

        let args: Value = match serde_json::from_str(&tool_call.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                let msg = format!("arguments are not valid JSON: {e}");
                return ValidationOutcome::rejected(RuntimeError, msg, Some(decision));
            }
        };
        if let Some(params) = &def.parameters {
            let errors = schema::validate_instance(&args, params);
            if !errors.is_empty() {
                return ValidationOutcome::rejected(SchemaViolation, errors.join("; "), Some(decision));
            }
        }
        ValidationOutcome::allowed(decision)
    }
}
