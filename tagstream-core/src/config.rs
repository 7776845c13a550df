use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use crate::error::{CoreResult, TagStreamError};

/// Demultiplexer knobs. The debounce interval and code flush threshold were
/// tuned by hand upstream, so both stay configurable.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Function-call buffer flush interval in milliseconds (default 80ms)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Code lines longer than this are flushed without waiting for `\n`
    #[serde(default = "default_code_flush_chars")]
    pub code_flush_chars: usize,
    /// Echo `<think>`/`</think>` markers as reasoning events
    #[serde(default = "default_true")]
    pub stream_reasoning: bool,
    /// Run the protocol validator before executing a tool call
    #[serde(default = "default_true")]
    pub validate_tool_calls: bool,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            code_flush_chars: default_code_flush_chars(),
            stream_reasoning: true,
            validate_tool_calls: true,
        }
    }
}

impl StreamCfg {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_debounce_ms() -> u64 {
    80
}
fn default_code_flush_chars() -> usize {
    100
}
fn default_true() -> bool {
    true
}

/// Tag names (without angle brackets) recognised in the raw stream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TagsCfg {
    #[serde(default = "default_reasoning_tag")]
    pub reasoning: String,
    #[serde(default = "default_fc_tag")]
    pub function_call: String,
}

impl Default for TagsCfg {
    fn default() -> Self {
        Self {
            reasoning: default_reasoning_tag(),
            function_call: default_fc_tag(),
        }
    }
}

fn default_reasoning_tag() -> String {
    "think".into()
}
fn default_fc_tag() -> String {
    "fc".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CodeCfg {
    /// Text that opens a code-interpreter call inside plain content.
    #[serde(default = "default_code_marker")]
    pub marker: String,
    /// Language tag for the synthetic fenced block.
    #[serde(default = "default_code_language")]
    pub language: String,
}

impl Default for CodeCfg {
    fn default() -> Self {
        Self {
            marker: default_code_marker(),
            language: default_code_language(),
        }
    }
}

fn default_code_marker() -> String {
    r#"{"name": "code_interpreter", "arguments": {"code": ""#.into()
}
fn default_code_language() -> String {
    "python".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderCfg {
    /// Base URL of the OpenAI-compatible endpoint, without `/v1`.
    pub base_url: String,
    /// Name of the environment variable that contains the API key.
    /// Local runtimes such as Ollama need none.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Case-insensitive substring of the model id, e.g. "deepseek-r1"
    pub pattern: String,
    /// Provider to stream from when this rule wins
    pub provider: String,
    /// Per-handler override of `stream.stream_reasoning`
    #[serde(default)]
    pub stream_reasoning: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RoutingCfg {
    pub default: String,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamCfg,
    #[serde(default)]
    pub tags: TagsCfg,
    #[serde(default)]
    pub code: CodeCfg,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderCfg>,
    pub routing: RoutingCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Config with every default and a single default provider name.
    pub fn with_default_provider(name: impl Into<String>) -> Self {
        Self {
            stream: StreamCfg::default(),
            tags: TagsCfg::default(),
            code: CodeCfg::default(),
            providers: BTreeMap::new(),
            routing: RoutingCfg {
                default: name.into(),
                rules: vec![],
            },
            http: HttpCfg::default(),
        }
    }

    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| TagStreamError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| TagStreamError::Other(e.into()))?
            }
            Some("toml") => {
                toml::from_str::<Self>(s).map_err(|e| TagStreamError::Other(e.into()))?
            }
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| TagStreamError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| TagStreamError::Other(e.into())))?,
        };
        cfg.check()?;
        Ok(cfg)
    }

    fn check(&self) -> CoreResult<()> {
        for (label, tag) in [
            ("tags.reasoning", &self.tags.reasoning),
            ("tags.function_call", &self.tags.function_call),
        ] {
            if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(TagStreamError::Validation(format!(
                    "{label} must be a non-empty alphanumeric tag name, got '{tag}'"
                )));
            }
        }
        if self.tags.reasoning.eq_ignore_ascii_case(&self.tags.function_call) {
            return Err(TagStreamError::Validation(
                "reasoning and function_call tags must differ".into(),
            ));
        }
        if self.code.marker.trim().is_empty() {
            return Err(TagStreamError::Validation("code.marker must not be empty".into()));
        }
        if self.stream.code_flush_chars == 0 {
            return Err(TagStreamError::Validation(
                "stream.code_flush_chars must be positive".into(),
            ));
        }
        Ok(())
    }
}
