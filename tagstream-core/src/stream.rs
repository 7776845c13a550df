//! Typed events produced by the demultiplexer and the stream worker.
//!
//! Contract:
//! - Events for one run are emitted in the same relative order as the tokens
//!   that produced them.
//! - A run ends with exactly one terminal event: a `status` event whose
//!   `status` is `complete` or `cancelled`, or an `error` event.
//! - After a terminal event, no further events are emitted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Reasoning,
    Content,
    Code,
    ToolCallStart,
    ToolCallDelta,
    ToolCallEnd,
    Status,
    Error,
}

impl EventKind {
    /// Kinds whose payload is plain text.
    pub fn is_text(self) -> bool {
        matches!(
            self,
            Self::Reasoning | Self::Content | Self::Code | Self::ToolCallDelta | Self::ToolCallEnd
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Map(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub payload: Payload,
}

/// Status values the worker emits.
pub const STATUS_COMPLETE: &str = "complete";
pub const STATUS_CANCELLED: &str = "cancelled";
pub const STATUS_TOOL_RESULT: &str = "tool_result";
pub const STATUS_TOOL_REJECTED: &str = "tool_rejected";

impl StreamEvent {
    pub fn text(kind: EventKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            payload: Payload::Text(text.into()),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::text(EventKind::Reasoning, text)
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self::text(EventKind::Content, text)
    }

    pub fn code(text: impl Into<String>) -> Self {
        Self::text(EventKind::Code, text)
    }

    pub fn tool_call_start() -> Self {
        Self {
            kind: EventKind::ToolCallStart,
            payload: Payload::Map(Map::new()),
        }
    }

    pub fn tool_call_delta(text: impl Into<String>) -> Self {
        Self::text(EventKind::ToolCallDelta, text)
    }

    pub fn tool_call_end(text: impl Into<String>) -> Self {
        Self::text(EventKind::ToolCallEnd, text)
    }

    /// Status event; `extra` fields are merged next to `status`.
    pub fn status(status: &str, extra: Map<String, Value>) -> Self {
        let mut map = extra;
        map.insert("status".into(), Value::String(status.into()));
        Self {
            kind: EventKind::Status,
            payload: Payload::Map(map),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("message".into(), Value::String(message.into()));
        Self {
            kind: EventKind::Error,
            payload: Payload::Map(map),
        }
    }

    /// Text payload, if this is a text kind.
    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(s) => Some(s.as_str()),
            Payload::Map(_) => None,
        }
    }

    /// Value of the `status` field for status events.
    pub fn status_value(&self) -> Option<&str> {
        match (&self.kind, &self.payload) {
            (EventKind::Status, Payload::Map(m)) => m.get("status").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Returns true if this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        match self.kind {
            EventKind::Error => true,
            EventKind::Status => matches!(
                self.status_value(),
                Some(STATUS_COMPLETE) | Some(STATUS_CANCELLED)
            ),
            _ => false,
        }
    }
}
