//! Telemetry for stream runs.
//!
//! Spans and logs go through `tracing`. Structured per-run records go to a
//! [`TelemetrySink`] handed to the worker at construction; nothing is
//! recorded when no sink is installed.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

/// Implement this to receive run and validation records.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - Calls happen on the run's task; keep them cheap and never panic.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_run(&self, trace: RunTrace);

    /// Optional per-validation record; default no-op.
    fn record_validation(&self, _log: ValidationLog) {}
}
