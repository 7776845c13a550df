//! Drives one stream run: tokens in, classified events out, tool calls
//! validated and executed after the stream ends.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing_futures::Instrument;

use crate::demux::{DemuxSettings, TagDemultiplexer};
use crate::error::{CoreResult, ParseResult};
use crate::model::{ChatRequest, ToolCall, ToolDefinition};
use crate::provider::{TokenProvider, TokenStream};
use crate::sink::EventSink;
use crate::stream::{
    EventKind, STATUS_CANCELLED, STATUS_COMPLETE, STATUS_TOOL_REJECTED, STATUS_TOOL_RESULT,
    StreamEvent,
};
use crate::telemetry::{
    KEY_EVENTS, KEY_LATENCY_MS, KEY_OUTCOME, KEY_TOOL_CALLS, RunTrace, TelemetrySink,
    ValidationLog,
};
use crate::tool_call::parse_tool_call;
use crate::validator::{ProtocolValidator, extract_decision};

/// Runs a validated tool call. Failures are reported in the `tool_result`
/// status, not as run errors.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> CoreResult<Value>;
}

/// Sender half of a run's cancel signal.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Receiver half; dropping the handle without cancelling means "never".
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(Arc::new(tx)), CancelSignal(rx))
}

/// Labels and allow-list for one run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub run_id: String,
    pub provider: String,
    pub model: String,
    pub allowed_tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Complete,
    Cancelled,
    Error,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub outcome: RunOutcome,
    /// Events handed to the sink, terminal event included.
    pub events: u64,
    /// Completed function-call regions.
    pub tool_calls: u32,
    /// All `content` text, in order.
    pub content: String,
}

/// A finished function-call region and where it sat in the content.
struct CompletedCall {
    text: String,
    /// Length of the run's content when the region opened.
    content_at: usize,
}

/// Per-run bookkeeping over the events we emit.
struct Tally<'a> {
    sink: &'a dyn EventSink,
    events: u64,
    content: String,
    current_call: Option<CompletedCall>,
    calls: Vec<CompletedCall>,
}

impl<'a> Tally<'a> {
    fn new(sink: &'a dyn EventSink) -> Self {
        Self {
            sink,
            events: 0,
            content: String::new(),
            current_call: None,
            calls: Vec::new(),
        }
    }

    async fn emit(&mut self, event: StreamEvent) -> CoreResult<()> {
        match (event.kind, event.as_text()) {
            (EventKind::Content, Some(t)) => self.content.push_str(t),
            (EventKind::ToolCallStart, _) => {
                self.current_call = Some(CompletedCall {
                    text: String::new(),
                    content_at: self.content.len(),
                })
            }
            (EventKind::ToolCallDelta, Some(t)) => {
                if let Some(c) = &mut self.current_call {
                    c.text.push_str(t);
                }
            }
            (EventKind::ToolCallEnd, Some(t)) => {
                if let Some(mut c) = self.current_call.take() {
                    c.text.push_str(t);
                    self.calls.push(c);
                }
            }
            _ => {}
        }
        self.events += 1;
        self.sink.emit(event).await
    }

    async fn emit_all(&mut self, events: Vec<StreamEvent>) -> CoreResult<()> {
        for ev in events {
            self.emit(ev).await?;
        }
        Ok(())
    }
}

pub struct StreamWorker {
    settings: DemuxSettings,
    validator: ProtocolValidator,
    executor: Arc<dyn ToolExecutor>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    validate_tool_calls: bool,
}

impl StreamWorker {
    pub fn new(settings: DemuxSettings, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            settings,
            validator: ProtocolValidator::new(),
            executor,
            telemetry: None,
            validate_tool_calls: true,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn validate_tool_calls(mut self, on: bool) -> Self {
        self.validate_tool_calls = on;
        self
    }

    /// Open a stream on `provider` and run it. The run id doubles as the
    /// upstream request id unless the request already carries one. A stream
    /// that fails to open still produces a terminal `error` event.
    pub async fn run_request(
        &self,
        provider: &dyn TokenProvider,
        mut req: ChatRequest,
        run_id: &str,
        sink: &dyn EventSink,
        cancel: CancelSignal,
    ) -> CoreResult<RunSummary> {
        req.request_id.get_or_insert_with(|| run_id.to_string());
        let ctx = RunContext {
            run_id: run_id.to_string(),
            provider: provider.name().to_string(),
            model: req.model.clone(),
            allowed_tools: req.tools.clone().unwrap_or_default(),
        };
        match provider.stream_tokens(req).await {
            Ok(tokens) => self.run(&ctx, tokens, sink, cancel).await,
            Err(e) => {
                tracing::warn!(run_id, provider = provider.name(), error = %e, "stream failed to open");
                let mut tally = Tally::new(sink);
                tally.emit(StreamEvent::error(e.to_string())).await?;
                Ok(self.finish_run(&ctx, tally, 0, RunOutcome::Error, Some(e.to_string()), Instant::now()))
            }
        }
    }

    pub async fn run(
        &self,
        ctx: &RunContext,
        source: TokenStream,
        sink: &dyn EventSink,
        cancel: CancelSignal,
    ) -> CoreResult<RunSummary> {
        let span = tracing::info_span!(
            "stream_run",
            run.id = %ctx.run_id,
            llm.provider = %ctx.provider,
            llm.model = %ctx.model,
            events.count = tracing::field::Empty,
            tool.calls = tracing::field::Empty,
            run.outcome = tracing::field::Empty,
            latency.ms = tracing::field::Empty,
        );
        let started = Instant::now();
        let summary = self
            .drive(ctx, source, sink, cancel)
            .instrument(span.clone())
            .await?;
        span.record(KEY_EVENTS, summary.events);
        span.record(KEY_TOOL_CALLS, summary.tool_calls);
        span.record(KEY_OUTCOME, summary.outcome.as_str());
        span.record(KEY_LATENCY_MS, started.elapsed().as_millis() as u64);
        Ok(summary)
    }

    async fn drive(
        &self,
        ctx: &RunContext,
        mut source: TokenStream,
        sink: &dyn EventSink,
        mut cancel: CancelSignal,
    ) -> CoreResult<RunSummary> {
        let started = Instant::now();
        let mut demux = TagDemultiplexer::new(&self.settings);
        let mut tally = Tally::new(sink);

        loop {
            let deadline = demux.next_flush_deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("run cancelled");
                    tally.emit_all(demux.cancel()).await?;
                    tally.emit(StreamEvent::status(STATUS_CANCELLED, Map::new())).await?;
                    let calls = tally.calls.len() as u32;
                    return Ok(self.finish_run(ctx, tally, calls, RunOutcome::Cancelled, None, started));
                }
                _ = sleep_until(deadline.unwrap_or(started)), if deadline.is_some() => {
                    if let Some(ev) = demux.poll_flush(Instant::now()) {
                        tally.emit(ev).await?;
                    }
                }
                next = source.next() => match next {
                    Some(Ok(token)) => {
                        let now = Instant::now();
                        match catch_unwind(AssertUnwindSafe(|| demux.process_at(&token, now))) {
                            Ok(events) => tally.emit_all(events).await?,
                            Err(panic) => {
                                let msg = format!("classification failed: {}", panic_message(&*panic));
                                tracing::error!(%msg, "demultiplexer panicked");
                                match catch_unwind(AssertUnwindSafe(|| demux.finish())) {
                                    Ok(events) => tally.emit_all(events).await?,
                                    Err(_) => tracing::error!("buffered text lost; flush panicked too"),
                                }
                                tally.emit(StreamEvent::error(msg.clone())).await?;
                                let calls = tally.calls.len() as u32;
                                return Ok(self.finish_run(ctx, tally, calls, RunOutcome::Error, Some(msg), started));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "upstream failed mid-stream");
                        tally.emit_all(demux.finish()).await?;
                        tally.emit(StreamEvent::error(e.to_string())).await?;
                        let calls = tally.calls.len() as u32;
                        return Ok(self.finish_run(ctx, tally, calls, RunOutcome::Error, Some(e.to_string()), started));
                    }
                    None => break,
                },
            }
        }

        tally.emit_all(demux.finish()).await?;
        let calls = std::mem::take(&mut tally.calls);
        for i in 0..calls.len() {
            if cancel.is_cancelled() {
                tally.emit(StreamEvent::status(STATUS_CANCELLED, Map::new())).await?;
                return Ok(self.finish_run(ctx, tally, calls.len() as u32, RunOutcome::Cancelled, None, started));
            }
            let context = decision_context(&tally.content, &calls, i);
            let status = self.handle_call(ctx, &calls[i].text, context).await;
            tally.emit(status).await?;
        }
        let mut extra = Map::new();
        extra.insert("tool_calls".into(), json!(calls.len()));
        tally.emit(StreamEvent::status(STATUS_COMPLETE, extra)).await?;
        Ok(self.finish_run(ctx, tally, calls.len() as u32, RunOutcome::Complete, None, started))
    }

    /// Parse, validate and execute one completed call; returns the status
    /// event describing what happened.
    async fn handle_call(&self, ctx: &RunContext, text: &str, content: &str) -> StreamEvent {
        let call = match parse_tool_call(text) {
            ParseResult::Ok(call) => call,
            ParseResult::Incomplete => {
                return rejected(None, None, "tool call text ended early".into(), None);
            }
            ParseResult::Malformed(reason) => return rejected(None, None, reason, None),
        };
        let name = call.function.name.clone();

        if self.validate_tool_calls {
            let outcome = self.validator.validate(content, &call, &ctx.allowed_tools);
            if let Some(t) = &self.telemetry {
                t.record_validation(ValidationLog {
                    run_id: Some(ctx.run_id.clone()),
                    tool_name: name.clone(),
                    valid: outcome.valid,
                    code: outcome.error.map(|c| c.as_str().to_string()),
                    message: outcome.message.clone(),
                    decision: outcome.telemetry.clone(),
                });
            }
            if !outcome.valid {
                return rejected(
                    Some(&name),
                    outcome.error.map(|c| c.as_str()),
                    outcome.message.unwrap_or_default(),
                    outcome.telemetry,
                );
            }
        }

        let mut extra = Map::new();
        extra.insert("tool".into(), Value::String(name.clone()));
        match self.executor.execute(&call).await {
            Ok(result) => {
                extra.insert("result".into(), result);
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool execution failed");
                extra.insert("error".into(), Value::String(e.to_string()));
            }
        }
        StreamEvent::status(STATUS_TOOL_RESULT, extra)
    }

    fn finish_run(
        &self,
        ctx: &RunContext,
        tally: Tally<'_>,
        tool_calls: u32,
        outcome: RunOutcome,
        error: Option<String>,
        started: Instant,
    ) -> RunSummary {
        if let Some(t) = &self.telemetry {
            t.record_run(
                RunTrace::new()
                    .run_id(&ctx.run_id)
                    .provider(&ctx.provider)
                    .model(&ctx.model)
                    .latency_ms(started.elapsed().as_millis() as u64)
                    .events(tally.events)
                    .tool_calls(tool_calls)
                    .outcome(outcome.as_str())
                    .error_message_opt(error.as_deref()),
            );
        }
        RunSummary {
            run_id: ctx.run_id.clone(),
            outcome,
            events: tally.events,
            tool_calls,
            content: tally.content,
        }
    }
}

/// Content a call is validated against: the text between the previous call
/// and this one. When no decision record precedes the call, the window
/// extends up to the next call so a trailing decision still counts.
fn decision_context<'c>(content: &'c str, calls: &[CompletedCall], i: usize) -> &'c str {
    let from = if i == 0 { 0 } else { calls[i - 1].content_at };
    let before = &content[from..calls[i].content_at];
    if extract_decision(before).is_some() {
        return before;
    }
    let to = calls.get(i + 1).map_or(content.len(), |c| c.content_at);
    &content[from..to]
}

fn rejected(tool: Option<&str>, code: Option<&str>, message: String, decision: Option<Value>) -> StreamEvent {
    let mut extra = Map::new();
    if let Some(tool) = tool {
        extra.insert("tool".into(), Value::String(tool.into()));
    }
    extra.insert("code".into(), code.map_or(Value::Null, |c| Value::String(c.into())));
    extra.insert("message".into(), Value::String(message));
    if let Some(d) = decision {
        extra.insert("telemetry".into(), d);
    }
    StreamEvent::status(STATUS_TOOL_REJECTED, extra)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::TagStreamError;
    use crate::provider::ScriptedProvider;
    use crate::telemetry::test_span::install_capture;
    use crate::telemetry::{KEY_MODEL, KEY_PROVIDER, KEY_RUN_ID};
    use crate::test_util::{CollectSink, RecordingExecutor, RecordingTelemetry, flight_tools};

    fn worker(exec: Arc<RecordingExecutor>) -> StreamWorker {
        StreamWorker::new(DemuxSettings::default(), exec)
    }

    fn ctx() -> RunContext {
        RunContext {
            run_id: "run-1".into(),
            provider: "scripted".into(),
            model: "deepseek-r1".into(),
            allowed_tools: flight_tools(),
        }
    }

    fn tokens(list: &[&str]) -> TokenStream {
        let owned: Vec<CoreResult<String>> = list.iter().map(|s| Ok(s.to_string())).collect();
        futures::stream::iter(owned).boxed()
    }

    const DECISION: &str = "```json\n{\"tool_name\": \"get_flight_times\", \"why\": \"asked\"}\n```\n";

    #[tokio::test]
    async fn valid_call_is_executed_after_stream() {
        let exec = Arc::new(RecordingExecutor::returning(json!({"minutes": 330})));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        let summary = worker(exec.clone())
            .run(
                &ctx(),
                tokens(&[
                    "<think>plan</think>",
                    DECISION,
                    "<fc>{\"name\": \"get_flight_times\", ",
                    "\"arguments\": {\"departure\": \"LAX\", \"arrival\": \"JFK\"}}</fc>",
                ]),
                &sink,
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Complete);
        assert_eq!(summary.tool_calls, 1);
        assert_eq!(exec.calls()[0].function.name, "get_flight_times");

        let events = sink.events();
        let statuses: Vec<&str> = events.iter().filter_map(|e| e.status_value()).collect();
        assert_eq!(statuses, vec![STATUS_TOOL_RESULT, STATUS_COMPLETE]);
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(summary.events, events.len() as u64);
    }

    #[tokio::test]
    async fn drifted_call_is_rejected_and_not_executed() {
        let exec = Arc::new(RecordingExecutor::returning(json!(null)));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        worker(exec.clone())
            .with_telemetry(telemetry.clone())
            .run(
                &ctx(),
                tokens(&[
                    "{\"tool_name\": \"get_weather\"}",
                    "<fc>{\"name\": \"get_flight_times\", \"arguments\": {}}</fc>",
                ]),
                &sink,
                cancel,
            )
            .await
            .unwrap();

        assert!(exec.calls().is_empty());
        let rejected = sink
            .events()
            .into_iter()
            .find(|e| e.status_value() == Some(STATUS_TOOL_REJECTED))
            .unwrap();
        let crate::stream::Payload::Map(m) = &rejected.payload else { panic!() };
        assert_eq!(m["code"], json!("DRIFT_DETECTED"));
        assert_eq!(m["tool"], json!("get_flight_times"));

        let logs = telemetry.validations();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].code.as_deref(), Some("DRIFT_DETECTED"));
        assert_eq!(telemetry.runs()[0].outcome.as_deref(), Some("complete"));
    }

    #[tokio::test]
    async fn validation_can_be_disabled() {
        let exec = Arc::new(RecordingExecutor::returning(json!("ok")));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        worker(exec.clone())
            .validate_tool_calls(false)
            .run(&ctx(), tokens(&["<fc>{\"name\": \"anything\"}</fc>"]), &sink, cancel)
            .await
            .unwrap();
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn unparseable_call_is_rejected_without_code() {
        let exec = Arc::new(RecordingExecutor::returning(json!(null)));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        worker(exec.clone())
            .run(&ctx(), tokens(&["<fc>call it now</fc>"]), &sink, cancel)
            .await
            .unwrap();
        let ev = sink
            .events()
            .into_iter()
            .find(|e| e.status_value() == Some(STATUS_TOOL_REJECTED))
            .unwrap();
        let crate::stream::Payload::Map(m) = &ev.payload else { panic!() };
        assert_eq!(m["code"], Value::Null);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn executor_failure_is_reported_in_tool_result() {
        let exec = Arc::new(RecordingExecutor::failing("sandbox down"));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        let summary = worker(exec)
            .validate_tool_calls(false)
            .run(&ctx(), tokens(&["<fc>{\"name\": \"f\"}</fc>"]), &sink, cancel)
            .await
            .unwrap();
        assert_eq!(summary.outcome, RunOutcome::Complete);
        let ev = sink
            .events()
            .into_iter()
            .find(|e| e.status_value() == Some(STATUS_TOOL_RESULT))
            .unwrap();
        let crate::stream::Payload::Map(m) = &ev.payload else { panic!() };
        assert!(m["error"].as_str().unwrap().contains("sandbox down"));
    }

    #[tokio::test]
    async fn upstream_error_flushes_then_emits_error() {
        let exec = Arc::new(RecordingExecutor::returning(json!(null)));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        let source = ScriptedProvider::new(["hello <fc>{\"na"])
            .failing_with("connection reset")
            .stream_tokens(ChatRequest::user("m", "q"))
            .await
            .unwrap();
        let summary = worker(exec.clone())
            .run(&ctx(), source, &sink, cancel)
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Error);
        let events = sink.events();
        let n = events.len();
        assert_eq!(events[n - 2], StreamEvent::tool_call_end("{\"na"));
        assert_eq!(events[n - 1].kind, EventKind::Error);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_flushes_between_slow_tokens() {
        let exec = Arc::new(RecordingExecutor::returning(json!(null)));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        let source = ScriptedProvider::new(["<fc>{\"name\":", " \"f\"", "}</fc>"])
            .with_delay(Duration::from_millis(200))
            .stream_tokens(ChatRequest::user("m", "q"))
            .await
            .unwrap();
        worker(exec)
            .validate_tool_calls(false)
            .run(&ctx(), source, &sink, cancel)
            .await
            .unwrap();

        let events = sink.events();
        let deltas: Vec<&str> = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolCallDelta)
            .filter_map(|e| e.as_text())
            .collect();
        assert_eq!(deltas, vec!["{\"name\":", " \"f\""]);
        let end = events.iter().find(|e| e.kind == EventKind::ToolCallEnd).unwrap();
        assert_eq!(end.as_text(), Some("}"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_flushes_and_ends_with_cancelled() {
        let exec = Arc::new(RecordingExecutor::returning(json!(null)));
        let sink = CollectSink::default();
        let (handle, cancel) = cancel_pair();
        let source = ScriptedProvider::new(["<fc>{\"name\"", ": \"f\"}", "</fc>", "never"])
            .with_delay(Duration::from_millis(20))
            .stream_tokens(ChatRequest::user("m", "q"))
            .await
            .unwrap();

        let w = worker(exec.clone());
        let c = ctx();
        let run = w.run(&c, source, &sink, cancel);
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        };
        let (summary, _) = tokio::join!(run, canceller);
        let summary = summary.unwrap();

        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        let events = sink.events();
        let last = events.last().unwrap();
        assert_eq!(last.status_value(), Some(STATUS_CANCELLED));
        let end = &events[events.len() - 2];
        assert_eq!(end.kind, EventKind::ToolCallEnd);
        let call_text: String = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::ToolCallDelta | EventKind::ToolCallEnd))
            .filter_map(|e| e.as_text())
            .collect();
        assert_eq!(call_text, "{\"name\": \"f\"}");
        assert!(exec.calls().is_empty());
        assert!(!events.iter().any(|e| e.as_text() == Some("never")));
    }

    #[tokio::test]
    async fn sink_failure_aborts_the_run() {
        let exec = Arc::new(RecordingExecutor::returning(json!(null)));
        let (sink, rx) = crate::sink::ChannelSink::channel(1);
        drop(rx);
        let (_h, cancel) = cancel_pair();
        let err = worker(exec)
            .run(&ctx(), tokens(&["hi"]), &sink, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TagStreamError::Sink(_)));
    }

    #[tokio::test]
    async fn open_failure_becomes_error_event() {
        struct Down;
        #[async_trait]
        impl TokenProvider for Down {
            fn name(&self) -> &str {
                "down"
            }
            async fn stream_tokens(&self, _req: ChatRequest) -> CoreResult<TokenStream> {
                Err(TagStreamError::ProviderUnavailable { provider: "down".into() })
            }
        }

        let exec = Arc::new(RecordingExecutor::returning(json!(null)));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        let summary = worker(exec)
            .run_request(&Down, ChatRequest::user("m", "q"), "run-2", &sink, cancel)
            .await
            .unwrap();
        assert_eq!(summary.outcome, RunOutcome::Error);
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.events()[0].kind, EventKind::Error);
    }

    #[tokio::test]
    async fn each_call_is_checked_against_its_own_decision() {
        let exec = Arc::new(RecordingExecutor::returning(json!("ok")));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        let summary = worker(exec.clone())
            .run(
                &ctx(),
                tokens(&[
                    DECISION,
                    "<fc>{\"name\": \"get_flight_times\", \"arguments\": {\"departure\": \"LAX\", \"arrival\": \"JFK\"}}</fc>",
                    "Now the math.\n```json\n{\"tool_name\": \"code_interpreter\"}\n```\n",
                    "<fc>{\"name\": \"code_interpreter\", \"arguments\": {\"code\": \"1+1\"}}</fc>",
                ]),
                &sink,
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(summary.tool_calls, 2);
        let names: Vec<String> = exec.calls().into_iter().map(|c| c.function.name).collect();
        assert_eq!(names, vec!["get_flight_times", "code_interpreter"]);
        let events = sink.events();
        let statuses: Vec<&str> = events.iter().filter_map(|e| e.status_value()).collect();
        assert_eq!(statuses, vec![STATUS_TOOL_RESULT, STATUS_TOOL_RESULT, STATUS_COMPLETE]);
    }

    #[test]
    fn decision_after_the_call_still_counts() {
        let content = "before ```json\n{\"tool_name\": \"f\"}\n```\n";
        let calls = vec![CompletedCall {
            text: "{\"name\": \"f\"}".into(),
            content_at: "before ".len(),
        }];
        assert_eq!(decision_context(content, &calls, 0), content);
    }

    #[tokio::test]
    async fn classifier_panic_flushes_buffers_before_error() {
        let exec = Arc::new(RecordingExecutor::returning(json!(null)));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        let settings = DemuxSettings {
            panic_on: Some("BOOM"),
            ..DemuxSettings::default()
        };
        let summary = StreamWorker::new(settings, exec.clone())
            .run(&ctx(), tokens(&["hello <fc>{\"na", "BOOM"]), &sink, cancel)
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Error);
        let events = sink.events();
        let n = events.len();
        assert_eq!(events[n - 2], StreamEvent::tool_call_end("{\"na"));
        assert_eq!(events[n - 1].kind, EventKind::Error);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn cancel_between_tool_calls_skips_the_rest() {
        struct CancelOnFirst {
            handle: CancelHandle,
            calls: std::sync::Mutex<u32>,
        }
        #[async_trait]
        impl ToolExecutor for CancelOnFirst {
            async fn execute(&self, _call: &ToolCall) -> CoreResult<Value> {
                *self.calls.lock().unwrap() += 1;
                self.handle.cancel();
                Ok(json!("done"))
            }
        }

        let (handle, cancel) = cancel_pair();
        let exec = Arc::new(CancelOnFirst {
            handle,
            calls: std::sync::Mutex::new(0),
        });
        let sink = CollectSink::default();
        let summary = StreamWorker::new(DemuxSettings::default(), exec.clone())
            .validate_tool_calls(false)
            .run(
                &ctx(),
                tokens(&["<fc>{\"name\": \"a\"}</fc>", "<fc>{\"name\": \"b\"}</fc>"]),
                &sink,
                cancel,
            )
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(*exec.calls.lock().unwrap(), 1);
        let events = sink.events();
        let statuses: Vec<&str> = events.iter().filter_map(|e| e.status_value()).collect();
        assert_eq!(statuses, vec![STATUS_TOOL_RESULT, STATUS_CANCELLED]);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn run_request_sends_run_id_upstream() {
        struct Echo(std::sync::Mutex<Option<String>>);
        #[async_trait]
        impl TokenProvider for Echo {
            fn name(&self) -> &str {
                "echo"
            }
            async fn stream_tokens(&self, req: ChatRequest) -> CoreResult<TokenStream> {
                *self.0.lock().unwrap() = req.request_id;
                Ok(futures::stream::empty::<CoreResult<String>>().boxed())
            }
        }

        let provider = Echo(std::sync::Mutex::new(None));
        let exec = Arc::new(RecordingExecutor::returning(json!(null)));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        worker(exec)
            .run_request(&provider, ChatRequest::user("m", "q"), "run-9", &sink, cancel)
            .await
            .unwrap();
        assert_eq!(provider.0.lock().unwrap().as_deref(), Some("run-9"));
    }

    #[tokio::test]
    async fn run_span_records_counts() {
        let (store, _guard) = install_capture();
        let exec = Arc::new(RecordingExecutor::returning(json!(null)));
        let sink = CollectSink::default();
        let (_h, cancel) = cancel_pair();
        worker(exec)
            .run(&ctx(), tokens(&["hello"]), &sink, cancel)
            .await
            .unwrap();

        let fields = store.fields_of("stream_run").unwrap();
        assert_eq!(fields.get(KEY_RUN_ID).map(String::as_str), Some("run-1"));
        assert_eq!(fields.get(KEY_PROVIDER).map(String::as_str), Some("scripted"));
        assert_eq!(fields.get(KEY_MODEL).map(String::as_str), Some("deepseek-r1"));
        assert!(fields.contains_key(KEY_LATENCY_MS));
        assert_eq!(fields.get(KEY_EVENTS).map(String::as_str), Some("2"));
        assert_eq!(fields.get(KEY_OUTCOME).map(String::as_str), Some("complete"));
    }
}
