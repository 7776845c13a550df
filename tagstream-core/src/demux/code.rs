//! Code-interpreter detection inside the plain content sub-stream.
//!
//! Some providers emit a code-interpreter call as raw JSON in the content
//! channel, e.g. `{"name": "code_interpreter", "arguments": {"code": "..."}}`.
//! The detector matches the configured opening marker (whitespace tolerant,
//! across any number of tokens), swallows it, and re-tags the JSON string
//! body as `code` events, decoding escapes on the way.

use crate::stream::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Scanning,
    Code,
    /// Closing quote seen; swallowing `}` and whitespace.
    Trailer { braces_left: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Escape {
    None,
    Backslash,
    Unicode(String),
}

#[derive(Debug, PartialEq, Eq)]
enum MarkerMatch {
    Full { start: usize, end: usize },
    Partial { start: usize },
    None,
}

#[derive(Debug)]
pub struct CodeBlockDetector {
    /// Marker with whitespace removed.
    marker: Vec<char>,
    open_braces: usize,
    fence_open: String,
    flush_chars: usize,
    mode: Mode,
    pending: String,
    line: String,
    line_chars: usize,
    escape: Escape,
    high_surrogate: Option<u32>,
    at_line_start: bool,
}

impl CodeBlockDetector {
    pub fn new(marker: &str, language: &str, flush_chars: usize) -> Self {
        let marker: Vec<char> = marker.chars().filter(|c| !c.is_whitespace()).collect();
        let opens = marker.iter().filter(|c| **c == '{').count();
        let closes = marker.iter().filter(|c| **c == '}').count();
        Self {
            marker,
            open_braces: opens.saturating_sub(closes),
            fence_open: format!("```{language}\n"),
            flush_chars: flush_chars.max(1),
            mode: Mode::Scanning,
            pending: String::new(),
            line: String::new(),
            line_chars: 0,
            escape: Escape::None,
            high_surrogate: None,
            at_line_start: true,
        }
    }

    pub fn in_code(&self) -> bool {
        self.mode == Mode::Code
    }

    /// Classify one piece of content text into `content` and `code` events.
    pub fn classify(&mut self, text: &str) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        let mut rest = text.to_string();
        while !rest.is_empty() {
            rest = match self.mode {
                Mode::Scanning => self.scan(&rest, &mut out),
                Mode::Code => self.code(&rest, &mut out),
                Mode::Trailer { .. } => self.trailer(&rest),
            };
        }
        out
    }

    /// Release held text without ending code mode. Used when a tag switches
    /// the stream away from content so ordering is preserved.
    pub fn release(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        match self.mode {
            Mode::Scanning => {
                if !self.pending.is_empty() {
                    out.push(StreamEvent::content(std::mem::take(&mut self.pending)));
                }
            }
            Mode::Code => self.flush_line(&mut out),
            Mode::Trailer { .. } => {}
        }
        out
    }

    /// End of stream: flush everything, closing an open code block.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = self.release();
        if self.mode == Mode::Code {
            match std::mem::replace(&mut self.escape, Escape::None) {
                Escape::Backslash => {
                    self.orphan_surrogate(&mut out);
                    self.push_code_char('\\', &mut out);
                }
                Escape::Unicode(hex) => self.literal_unicode(&hex, &mut out),
                Escape::None => self.orphan_surrogate(&mut out),
            }
            self.flush_line(&mut out);
            self.close_fence(&mut out);
        }
        self.mode = Mode::Scanning;
        self.escape = Escape::None;
        self.high_surrogate = None;
        out
    }

    fn scan(&mut self, text: &str, out: &mut Vec<StreamEvent>) -> String {
        self.pending.push_str(text);
        match self.match_marker(&self.pending) {
            MarkerMatch::None => {
                out.push(StreamEvent::content(std::mem::take(&mut self.pending)));
                String::new()
            }
            MarkerMatch::Partial { start } => {
                if start > 0 {
                    let held = self.pending.split_off(start);
                    out.push(StreamEvent::content(std::mem::replace(&mut self.pending, held)));
                }
                String::new()
            }
            MarkerMatch::Full { start, end } => {
                let after = self.pending[end..].to_string();
                self.pending.truncate(start);
                if !self.pending.is_empty() {
                    out.push(StreamEvent::content(std::mem::take(&mut self.pending)));
                }
                tracing::debug!("code interpreter marker detected");
                self.mode = Mode::Code;
                self.at_line_start = true;
                self.emit_code(self.fence_open.clone(), out);
                after
            }
        }
    }

    fn code(&mut self, text: &str, out: &mut Vec<StreamEvent>) -> String {
        for (i, c) in text.char_indices() {
            match std::mem::replace(&mut self.escape, Escape::None) {
                Escape::Backslash => {
                    self.unescape(c, out);
                    continue;
                }
                Escape::Unicode(mut hex) if c.is_ascii_hexdigit() => {
                    hex.push(c);
                    if hex.len() < 4 {
                        self.escape = Escape::Unicode(hex);
                    } else {
                        self.unicode(&hex, out);
                    }
                    continue;
                }
                // Short `\u` escape: keep it verbatim, then read `c` as usual.
                Escape::Unicode(hex) => self.literal_unicode(&hex, out),
                Escape::None => {}
            }
            match c {
                '\\' => self.escape = Escape::Backslash,
                '"' => {
                    self.orphan_surrogate(out);
                    self.flush_line(out);
                    self.close_fence(out);
                    self.mode = Mode::Trailer {
                        braces_left: self.open_braces,
                    };
                    if self.open_braces == 0 {
                        self.mode = Mode::Scanning;
                    }
                    return text[i + c.len_utf8()..].to_string();
                }
                _ => {
                    self.orphan_surrogate(out);
                    self.push_code_char(c, out);
                }
            }
        }
        String::new()
    }

    fn trailer(&mut self, text: &str) -> String {
        for (i, c) in text.char_indices() {
            if c.is_whitespace() {
                continue;
            }
            if let Mode::Trailer { braces_left } = self.mode
                && c == '}'
                && braces_left > 0
            {
                if braces_left == 1 {
                    self.mode = Mode::Scanning;
                    return text[i + 1..].to_string();
                }
                self.mode = Mode::Trailer {
                    braces_left: braces_left - 1,
                };
                continue;
            }
            self.mode = Mode::Scanning;
            return text[i..].to_string();
        }
        String::new()
    }

    fn unescape(&mut self, c: char, out: &mut Vec<StreamEvent>) {
        let decoded = match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            '"' | '\\' | '/' => c,
            'u' => {
                self.escape = Escape::Unicode(String::new());
                return;
            }
            other => {
                self.orphan_surrogate(out);
                self.push_code_char('\\', out);
                other
            }
        };
        self.orphan_surrogate(out);
        self.push_code_char(decoded, out);
    }

    fn unicode(&mut self, hex: &str, out: &mut Vec<StreamEvent>) {
        let Ok(unit) = u32::from_str_radix(hex, 16) else {
            self.literal_unicode(hex, out);
            return;
        };
        let decoded = match (self.high_surrogate.take(), unit) {
            (None, 0xD800..=0xDBFF) => {
                self.high_surrogate = Some(unit);
                return;
            }
            (Some(high), 0xDC00..=0xDFFF) => {
                char::from_u32(0x10000 + ((high - 0xD800) << 10) + (unit - 0xDC00))
            }
            (Some(_), _) => {
                self.push_code_char(char::REPLACEMENT_CHARACTER, out);
                char::from_u32(unit)
            }
            (None, _) => char::from_u32(unit),
        };
        self.push_code_char(decoded.unwrap_or(char::REPLACEMENT_CHARACTER), out);
    }

    /// An escape that ended before four hex digits, kept as written.
    fn literal_unicode(&mut self, hex: &str, out: &mut Vec<StreamEvent>) {
        self.orphan_surrogate(out);
        self.push_code_char('\\', out);
        self.push_code_char('u', out);
        for c in hex.chars() {
            self.push_code_char(c, out);
        }
    }

    /// A high surrogate not followed by a low one decodes to U+FFFD.
    fn orphan_surrogate(&mut self, out: &mut Vec<StreamEvent>) {
        if self.high_surrogate.take().is_some() {
            self.push_code_char(char::REPLACEMENT_CHARACTER, out);
        }
    }

    fn push_code_char(&mut self, c: char, out: &mut Vec<StreamEvent>) {
        self.line.push(c);
        self.line_chars += 1;
        if c == '\n' || self.line_chars >= self.flush_chars {
            self.flush_line(out);
        }
    }

    fn flush_line(&mut self, out: &mut Vec<StreamEvent>) {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.emit_code(line, out);
        }
        self.line_chars = 0;
    }

    fn close_fence(&mut self, out: &mut Vec<StreamEvent>) {
        let fence = if self.at_line_start { "```\n" } else { "\n```\n" };
        self.emit_code(fence.to_string(), out);
    }

    fn emit_code(&mut self, text: String, out: &mut Vec<StreamEvent>) {
        self.at_line_start = text.ends_with('\n');
        out.push(StreamEvent::code(text));
    }

    /// Earliest position in `text` where the marker matches fully or could
    /// still match once more text arrives.
    fn match_marker(&self, text: &str) -> MarkerMatch {
        let Some(&first) = self.marker.first() else {
            return MarkerMatch::None;
        };
        for (start, c) in text.char_indices() {
            if c != first {
                continue;
            }
            let mut matched = 0;
            let mut mismatch = false;
            for (i, c) in text[start..].char_indices() {
                if matched > 0 && c.is_whitespace() {
                    continue;
                }
                if c != self.marker[matched] {
                    mismatch = true;
                    break;
                }
                matched += 1;
                if matched == self.marker.len() {
                    return MarkerMatch::Full {
                        start,
                        end: start + i + c.len_utf8(),
                    };
                }
            }
            if !mismatch {
                return MarkerMatch::Partial { start };
            }
        }
        MarkerMatch::None
    }
}
