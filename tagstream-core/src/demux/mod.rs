//! Tag demultiplexer: splits a raw token stream into typed events.
//!
//! Recognised tags are `<think>`, `</think>`, `<fc>` and `</fc>` (names come
//! from [`TagsCfg`]). A tag may straddle any number of tokens; the trailing
//! fragment of a token that could still become a tag is held back, so no
//! tag is ever split across two events and no fragment leaks into text.

pub mod accumulator;
pub mod code;

use std::borrow::Cow;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tokio::time::{Duration, Instant};

use crate::config::{CodeCfg, Config, StreamCfg, TagsCfg};
use crate::error::{CoreResult, TagStreamError};
use crate::stream::StreamEvent;

pub use accumulator::FunctionCallAccumulator;
pub use code::CodeBlockDetector;

/// Whitespace run allowed at each gap of a noisy tag (`<`, `/`, name, `>`).
/// Bounding it keeps every held fragment short.
const MAX_TAG_SPACE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    OpenReasoning,
    CloseReasoning,
    OpenFunctionCall,
    CloseFunctionCall,
}

/// Compiled tag table shared by every demultiplexer built from one config.
#[derive(Debug)]
pub struct TagTable {
    reasoning: String,
    function_call: String,
    noise: Regex,
    split: Regex,
}

impl TagTable {
    pub fn new(cfg: &TagsCfg) -> CoreResult<Self> {
        let reasoning = cfg.reasoning.to_ascii_lowercase();
        let function_call = cfg.function_call.to_ascii_lowercase();
        let names = format!(
            "{}|{}",
            regex::escape(&reasoning),
            regex::escape(&function_call)
        );
        let compile = |pattern: String| {
            Regex::new(&pattern)
                .map_err(|e| TagStreamError::Validation(format!("invalid tag table: {e}")))
        };
        Ok(Self {
            noise: compile(format!(
                r"(?i)<\s{{0,{MAX_TAG_SPACE}}}(/\s{{0,{MAX_TAG_SPACE}}})?({names})\s{{0,{MAX_TAG_SPACE}}}>"
            ))?,
            split: compile(format!(r"<(/?)({names})>"))?,
            reasoning,
            function_call,
        })
    }

    /// Default `think`/`fc` table.
    pub fn shared_default() -> Arc<Self> {
        static DEFAULT: Lazy<Arc<TagTable>> = Lazy::new(|| {
            Arc::new(TagTable::new(&TagsCfg::default()).expect("default tag table compiles"))
        });
        DEFAULT.clone()
    }

    /// Collapse case and whitespace variants (`<FC >`, `< /think>`) into the
    /// canonical lowercase form.
    pub fn normalize<'a>(&self, text: &'a str) -> Cow<'a, str> {
        self.noise.replace_all(text, |caps: &Captures<'_>| {
            let slash = if caps.get(1).is_some() { "/" } else { "" };
            format!("<{slash}{}>", caps[2].to_ascii_lowercase())
        })
    }

    /// Whether `fragment` (starting at `<`, no `>` yet) may still turn into a
    /// recognised tag once more text arrives.
    pub fn could_complete(&self, fragment: &str) -> bool {
        if fragment.contains('>') {
            return false;
        }
        let Some(rest) = fragment.strip_prefix('<') else {
            return false;
        };
        let Some(rest) = skip_tag_space(rest) else {
            return false;
        };
        let rest = match rest.strip_prefix('/') {
            Some(after) => match skip_tag_space(after) {
                Some(after) => after,
                None => return false,
            },
            None => rest,
        };
        let name_len = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (name, tail) = rest.split_at(name_len);
        if !tail.trim().is_empty() || skip_tag_space(tail).is_none() {
            return false;
        }
        let name = name.to_ascii_lowercase();
        [&self.reasoning, &self.function_call].iter().any(|tag| {
            if tail.is_empty() {
                tag.starts_with(&name)
            } else {
                **tag == name
            }
        })
    }

    fn classify(&self, caps: &Captures<'_>) -> Tag {
        let closing = !caps[1].is_empty();
        let reasoning = &caps[2] == self.reasoning;
        match (reasoning, closing) {
            (true, false) => Tag::OpenReasoning,
            (true, true) => Tag::CloseReasoning,
            (false, false) => Tag::OpenFunctionCall,
            (false, true) => Tag::CloseFunctionCall,
        }
    }
}

/// Leading whitespace stripped, or `None` if the run is longer than a noisy
/// tag allows.
fn skip_tag_space(s: &str) -> Option<&str> {
    let rest = s.trim_start();
    let skipped = s[..s.len() - rest.len()].chars().count();
    (skipped <= MAX_TAG_SPACE).then_some(rest)
}

/// Per-handler demultiplexer settings; cheap to clone.
#[derive(Debug, Clone)]
pub struct DemuxSettings {
    pub table: Arc<TagTable>,
    pub debounce: Duration,
    pub stream_reasoning: bool,
    pub code_marker: String,
    pub code_language: String,
    pub code_flush_chars: usize,
    /// Panic on any token containing this text; exercises the worker's
    /// panic boundary.
    #[cfg(test)]
    pub(crate) panic_on: Option<&'static str>,
}

impl Default for DemuxSettings {
    fn default() -> Self {
        let stream = StreamCfg::default();
        let code = CodeCfg::default();
        Self {
            table: TagTable::shared_default(),
            debounce: stream.debounce(),
            stream_reasoning: stream.stream_reasoning,
            code_marker: code.marker,
            code_language: code.language,
            code_flush_chars: stream.code_flush_chars,
            #[cfg(test)]
            panic_on: None,
        }
    }
}

impl DemuxSettings {
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        Ok(Self {
            table: Arc::new(TagTable::new(&cfg.tags)?),
            debounce: cfg.stream.debounce(),
            stream_reasoning: cfg.stream.stream_reasoning,
            code_marker: cfg.code.marker.clone(),
            code_language: cfg.code.language.clone(),
            code_flush_chars: cfg.stream.code_flush_chars,
            #[cfg(test)]
            panic_on: None,
        })
    }
}

enum Segment<'a> {
    Text(&'a str),
    Tag(Tag, &'a str),
}

/// Stream-local demultiplexer state. One instance per run, never shared.
#[derive(Debug)]
pub struct TagDemultiplexer {
    table: Arc<TagTable>,
    stream_reasoning: bool,
    partial_tag: String,
    in_reasoning: bool,
    in_function_call: bool,
    fc: FunctionCallAccumulator,
    code: CodeBlockDetector,
    #[cfg(test)]
    panic_on: Option<&'static str>,
}

impl TagDemultiplexer {
    pub fn new(settings: &DemuxSettings) -> Self {
        Self {
            table: settings.table.clone(),
            stream_reasoning: settings.stream_reasoning,
            partial_tag: String::new(),
            in_reasoning: false,
            in_function_call: false,
            fc: FunctionCallAccumulator::new(settings.debounce),
            code: CodeBlockDetector::new(
                &settings.code_marker,
                &settings.code_language,
                settings.code_flush_chars,
            ),
            #[cfg(test)]
            panic_on: settings.panic_on,
        }
    }

    pub fn in_reasoning(&self) -> bool {
        self.in_reasoning
    }

    pub fn in_function_call(&self) -> bool {
        self.in_function_call
    }

    pub fn in_code(&self) -> bool {
        self.code.in_code()
    }

    pub fn partial_tag(&self) -> &str {
        &self.partial_tag
    }

    pub fn process(&mut self, token: &str) -> Vec<StreamEvent> {
        self.process_at(token, Instant::now())
    }

    /// Classify one raw token. `now` drives the function-call debounce.
    pub fn process_at(&mut self, token: &str, now: Instant) -> Vec<StreamEvent> {
        if token.is_empty() {
            return Vec::new();
        }
        #[cfg(test)]
        if let Some(p) = self.panic_on
            && token.contains(p)
        {
            panic!("classifier fault on {token:?}");
        }
        let mut raw = std::mem::take(&mut self.partial_tag);
        raw.push_str(token);
        let text = self.table.normalize(&raw).into_owned();

        let body_end = match text.rfind('<') {
            Some(i) if self.table.could_complete(&text[i..]) => i,
            _ => text.len(),
        };
        let (body, held) = text.split_at(body_end);
        self.partial_tag = held.to_string();

        let table = self.table.clone();
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in table.split.captures_iter(body) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > last {
                segments.push(Segment::Text(&body[last..whole.start()]));
            }
            segments.push(Segment::Tag(table.classify(&caps), whole.as_str()));
            last = whole.end();
        }
        if last < body.len() {
            segments.push(Segment::Text(&body[last..]));
        }

        let mut out = Vec::new();
        for segment in segments {
            match segment {
                Segment::Text(t) => self.literal(t, &mut out),
                Segment::Tag(tag, raw) => self.on_tag(tag, raw, now, &mut out),
            }
        }
        if let Some(ev) = self.poll_flush(now) {
            out.push(ev);
        }
        out
    }

    /// Debounce flush without a new token; `None` if nothing is due.
    pub fn poll_flush(&mut self, now: Instant) -> Option<StreamEvent> {
        if self.in_function_call && self.fc.is_due(now) {
            self.fc.flush(now).map(StreamEvent::tool_call_delta)
        } else {
            None
        }
    }

    /// When the buffered function-call text becomes due, if any.
    pub fn next_flush_deadline(&self) -> Option<Instant> {
        if self.in_function_call {
            self.fc.deadline()
        } else {
            None
        }
    }

    /// End of stream (or cancellation): release the held fragment as text
    /// of the current region, close an open function call, flush code.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let now = Instant::now();
        let mut out = Vec::new();
        let held = std::mem::take(&mut self.partial_tag);
        if !held.is_empty() {
            self.literal(&held, &mut out);
        }
        if self.in_function_call {
            self.in_function_call = false;
            out.push(StreamEvent::tool_call_end(
                self.fc.flush(now).unwrap_or_default(),
            ));
        }
        self.in_reasoning = false;
        out.extend(self.code.finish());
        out
    }

    /// Best-effort flush before a `cancelled` status. Same draining as
    /// [`finish`](Self::finish); kept separate so the two exits log apart.
    pub fn cancel(&mut self) -> Vec<StreamEvent> {
        tracing::debug!(
            in_function_call = self.in_function_call,
            in_code = self.code.in_code(),
            "demultiplexer cancelled"
        );
        self.finish()
    }

    fn on_tag(&mut self, tag: Tag, raw: &str, now: Instant, out: &mut Vec<StreamEvent>) {
        match tag {
            Tag::OpenReasoning if !self.in_reasoning && !self.in_function_call => {
                out.extend(self.code.release());
                self.in_reasoning = true;
                if self.stream_reasoning {
                    out.push(StreamEvent::reasoning(raw));
                }
            }
            Tag::CloseReasoning if self.in_reasoning => {
                self.in_reasoning = false;
                if self.stream_reasoning {
                    out.push(StreamEvent::reasoning(raw));
                }
            }
            Tag::OpenFunctionCall if !self.in_reasoning && !self.in_function_call => {
                out.extend(self.code.release());
                self.in_function_call = true;
                self.fc.start(now);
                out.push(StreamEvent::tool_call_start());
            }
            Tag::CloseFunctionCall if self.in_function_call => {
                self.in_function_call = false;
                out.push(StreamEvent::tool_call_end(
                    self.fc.flush(now).unwrap_or_default(),
                ));
            }
            _ => {
                tracing::debug!(tag = raw, "misplaced tag treated as text");
                self.literal(raw, out);
            }
        }
    }

    fn literal(&mut self, text: &str, out: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        if self.in_function_call {
            self.fc.push(text);
        } else if self.in_reasoning {
            out.push(StreamEvent::reasoning(text));
        } else {
            out.extend(self.code.classify(text));
        }
    }
}
