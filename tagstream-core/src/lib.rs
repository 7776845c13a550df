//! Streaming demultiplexer for reasoning-model output.
//!
//! Raw tokens carrying `<think>` and `<fc>` tags (names configurable) are
//! split into typed [`stream::StreamEvent`]s. Function calls are
//! accumulated, checked by [`validator::ProtocolValidator`] against the
//! assistant's stated decision, and handed to a tool executor.

pub mod client_registry;
pub mod config;
pub mod demux;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod provider;
pub mod providers;
pub mod router;
pub mod sink;
pub mod stream;
pub mod telemetry;
pub mod tool_call;
pub mod validator;
pub mod worker;
#[cfg(test)]
pub mod test_util;
