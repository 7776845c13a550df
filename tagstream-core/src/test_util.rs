//! Shared fixtures for unit tests.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::{CoreResult, TagStreamError};
use crate::model::{ToolCall, ToolDefinition};
use crate::sink::EventSink;
use crate::stream::StreamEvent;
use crate::telemetry::{RunTrace, TelemetrySink, ValidationLog};
use crate::worker::ToolExecutor;

/// Keeps every event in memory.
#[derive(Default)]
pub struct CollectSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl CollectSink {
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for CollectSink {
    async fn emit(&self, event: StreamEvent) -> CoreResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Records calls and answers each with a fixed result.
pub struct RecordingExecutor {
    result: Result<Value, String>,
    calls: Mutex<Vec<ToolCall>>,
}

impl RecordingExecutor {
    pub fn returning(result: Value) -> Self {
        Self {
            result: Ok(result),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    async fn execute(&self, call: &ToolCall) -> CoreResult<Value> {
        self.calls.lock().unwrap().push(call.clone());
        self.result
            .clone()
            .map_err(|m| TagStreamError::Other(anyhow::anyhow!(m)))
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    runs: Mutex<Vec<RunTrace>>,
    validations: Mutex<Vec<ValidationLog>>,
}

impl RecordingTelemetry {
    pub fn runs(&self) -> Vec<RunTrace> {
        self.runs.lock().unwrap().clone()
    }

    pub fn validations(&self) -> Vec<ValidationLog> {
        self.validations.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record_run(&self, trace: RunTrace) {
        self.runs.lock().unwrap().push(trace);
    }

    fn record_validation(&self, log: ValidationLog) {
        self.validations.lock().unwrap().push(log);
    }
}

/// `code_interpreter` plus a `get_flight_times(departure, arrival)` function.
pub fn flight_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::platform("code_interpreter"),
        ToolDefinition::function(
            "get_flight_times",
            json!({
                "type": "object",
                "properties": {
                    "departure": {"type": "string"},
                    "arrival": {"type": "string"}
                },
                "required": ["departure", "arrival"]
            }),
        ),
    ]
}
