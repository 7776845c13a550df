//! Streaming client for OpenAI-compatible chat endpoints (DeepSeek, Ollama,
//! vLLM, OpenRouter, ...).

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreResult, TagStreamError};
use crate::http_client::{HttpClient, RequestCtx, SseStream};
use crate::model::{ChatMessage, ChatRequest, ToolDefinition};
use crate::normalizer::normalize_chat;
use crate::provider::{TokenProvider, TokenStream};

#[derive(Debug, Clone)]
pub struct OpenAiCompatible {
    http: HttpClient,
    base: String,
    name: String,
    api_key: Option<SecretString>,
    reasoning_tag: String,
}

impl OpenAiCompatible {
    pub fn new(
        name: impl Into<String>,
        http: HttpClient,
        base: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Self {
        Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            name: name.into(),
            api_key,
            reasoning_tag: "think".into(),
        }
    }

    /// Tag name used to wrap `reasoning_content` deltas.
    pub fn with_reasoning_tag(mut self, tag: impl Into<String>) -> Self {
        self.reasoning_tag = tag.into();
        self
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        OpenAiCompatible::new(
            "local",
            HttpClient::new_default().unwrap(),
            server_base,
            Some(SecretString::from("test-key".to_string())),
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(key) = &self.api_key {
            h.push((
                "Authorization".to_string(),
                format!("Bearer {}", key.expose_secret()),
            ));
        }
        h
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct WireChatReq<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

/// Turns SSE lines into raw tokens.
///
/// Reasoning that arrives in the separate `reasoning_content` field is
/// wrapped in the reasoning tags so downstream sees a single format.
#[derive(Debug)]
pub struct DeltaDecoder {
    provider: String,
    open_tag: String,
    close_tag: String,
    in_reasoning: bool,
    done: bool,
}

impl DeltaDecoder {
    pub fn new(provider: &str, reasoning_tag: &str) -> Self {
        Self {
            provider: provider.to_string(),
            open_tag: format!("<{reasoning_tag}>"),
            close_tag: format!("</{reasoning_tag}>"),
            in_reasoning: false,
            done: false,
        }
    }

    /// `[DONE]` seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn decode(&mut self, line: &str) -> CoreResult<Vec<String>> {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            // comments, `event:`, `id:`, keep-alives
            return Ok(Vec::new());
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            self.done = true;
            return Ok(self.finish());
        }

        let chunk: WireChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(provider = %self.provider, error = %e, "skipping undecodable chunk");
                return Ok(Vec::new());
            }
        };
        if let Some(err) = chunk.error {
            let code = match err.code {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => "error".to_string(),
                Some(other) => other.to_string(),
            };
            return Err(TagStreamError::ProviderError {
                provider: self.provider.clone(),
                code,
                message: err.message.unwrap_or_default(),
            });
        }

        let mut out = Vec::new();
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(out);
        };
        if let Some(r) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
            if !self.in_reasoning {
                self.in_reasoning = true;
                out.push(self.open_tag.clone());
            }
            out.push(r);
        }
        if let Some(c) = choice.delta.content.filter(|c| !c.is_empty()) {
            out.extend(self.close_reasoning());
            out.push(c);
        }
        if choice.finish_reason.is_some() {
            out.extend(self.close_reasoning());
        }
        Ok(out)
    }

    /// Close a reasoning block left open by an abrupt end.
    pub fn finish(&mut self) -> Vec<String> {
        self.close_reasoning().into_iter().collect()
    }

    fn close_reasoning(&mut self) -> Option<String> {
        if self.in_reasoning {
            self.in_reasoning = false;
            Some(self.close_tag.clone())
        } else {
            None
        }
    }
}

struct DecodeState {
    lines: SseStream,
    decoder: DeltaDecoder,
    pending: VecDeque<String>,
    ended: bool,
}

fn decode_lines(lines: SseStream, decoder: DeltaDecoder) -> TokenStream {
    let state = DecodeState {
        lines,
        decoder,
        pending: VecDeque::new(),
        ended: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(t) = st.pending.pop_front() {
                return Some((Ok(t), st));
            }
            if st.ended {
                return None;
            }
            match st.lines.next().await {
                Some(Ok(line)) => match st.decoder.decode(&line.line) {
                    Ok(tokens) => {
                        st.pending.extend(tokens);
                        st.ended = st.decoder.is_done();
                    }
                    Err(e) => {
                        st.ended = true;
                        return Some((Err(e), st));
                    }
                },
                Some(Err(e)) => {
                    st.ended = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.ended = true;
                    let tail = st.decoder.finish();
                    st.pending.extend(tail);
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl TokenProvider for OpenAiCompatible {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_tokens(&self, req: ChatRequest) -> CoreResult<TokenStream> {
        let req = normalize_chat(req);
        let payload = WireChatReq {
            model: &req.model,
            messages: &req.messages,
            stream: true,
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_output_tokens,
            stop: req.stop_sequences.as_deref(),
            tools: req.tools.as_deref(),
        };
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = format!("{}/v1/chat/completions", self.base);
        tracing::debug!(provider = %self.name, model = %req.model, %url, "opening token stream");
        let ctx = RequestCtx {
            run_id: req.request_id.as_deref(),
        };
        let lines = self
            .http
            .post_sse_lines(&self.name, &url, &payload, &hdrs, &ctx)
            .await?;
        Ok(decode_lines(lines, DeltaDecoder::new(&self.name, &self.reasoning_tag)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    fn sse(chunks: &[Value]) -> String {
        let mut body = String::from(": keep-alive\n\n");
        for c in chunks {
            body.push_str(&format!("data: {c}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn decoder_wraps_reasoning_content() {
        let mut d = DeltaDecoder::new("deepseek", "think");
        let mut out = Vec::new();
        for line in [
            r#"data: {"choices":[{"delta":{"reasoning_content":"Let me"}}]}"#,
            r#"data: {"choices":[{"delta":{"reasoning_content":" think."}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":"Answer","reasoning_content":null}}]}"#,
            "data: [DONE]",
        ] {
            out.extend(d.decode(line).unwrap());
        }
        assert_eq!(out, vec!["<think>", "Let me", " think.", "</think>", "Answer"]);
        assert!(d.is_done());
    }

    #[test]
    fn decoder_closes_reasoning_on_finish_reason_and_eof() {
        let mut d = DeltaDecoder::new("p", "think");
        let out = d
            .decode(r#"data: {"choices":[{"delta":{"reasoning_content":"r"},"finish_reason":"length"}]}"#)
            .unwrap();
        assert_eq!(out, vec!["<think>", "r", "</think>"]);

        let mut d = DeltaDecoder::new("p", "think");
        d.decode(r#"data: {"choices":[{"delta":{"reasoning_content":"r"}}]}"#).unwrap();
        assert_eq!(d.finish(), vec!["</think>"]);
        assert!(d.finish().is_empty());
    }

    #[test]
    fn decoder_maps_error_payload() {
        let mut d = DeltaDecoder::new("deepseek", "think");
        let err = d
            .decode(r#"data: {"error":{"message":"context too long","code":400}}"#)
            .unwrap_err();
        match err {
            TagStreamError::ProviderError { provider, code, message } => {
                assert_eq!(provider, "deepseek");
                assert_eq!(code, "400");
                assert_eq!(message, "context too long");
            }
            other => panic!("expected ProviderError, got: {other:?}"),
        }
    }

    #[test]
    fn decoder_ignores_noise() {
        let mut d = DeltaDecoder::new("p", "think");
        assert!(d.decode(": ping").unwrap().is_empty());
        assert!(d.decode("event: message").unwrap().is_empty());
        assert!(d.decode("data: not json").unwrap().is_empty());
        assert!(d.decode(r#"data: {"choices":[]}"#).unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_tokens_posts_stream_request() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer test-key")
                .json_body_partial(r#"{"model": "deepseek-r1", "stream": true}"#);
            then.status(200).header("content-type", "text/event-stream").body(sse(&[
                json!({"choices":[{"delta":{"reasoning_content":"hmm"}}]}),
                json!({"choices":[{"delta":{"content":"<fc>{\"name\":"}}]}),
                json!({"choices":[{"delta":{"content":"\"f\"}</fc>"},"finish_reason":"stop"}]}),
            ]));
        });

        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let tokens: Vec<String> = provider
            .stream_tokens(ChatRequest::user("deepseek-r1", "hi"))
            .await
            .unwrap()
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(
            tokens,
            vec!["<think>", "hmm", "</think>", "<fc>{\"name\":", "\"f\"}</fc>"]
        );
        m.assert();
    }

    #[tokio::test]
    async fn request_id_is_sent_as_header() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("x-request-id", "run-42");
            then.status(200).body(sse(&[json!({"choices":[{"delta":{"content":"ok"}}]})]));
        });
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let mut req = ChatRequest::user("m", "hi");
        req.request_id = Some("run-42".into());
        let tokens: Vec<String> = provider
            .stream_tokens(req)
            .await
            .unwrap()
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["ok"]);
        m.assert();
    }

    #[tokio::test]
    async fn mid_stream_error_ends_the_stream() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(sse(&[
                json!({"choices":[{"delta":{"content":"partial"}}]}),
                json!({"error":{"message":"overloaded","code":"server_busy"}}),
                json!({"choices":[{"delta":{"content":"never"}}]}),
            ]));
        });
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let items: Vec<CoreResult<String>> = provider
            .stream_tokens(ChatRequest::user("m", "hi"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(matches!(
            &items[1],
            Err(TagStreamError::ProviderError { code, .. }) if code == "server_busy"
        ));
    }

    #[tokio::test]
    async fn unauthorized_is_provider_error() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(401).body(r#"{"error":"bad key"}"#);
        });
        let provider = OpenAiCompatible::new_for_tests(&server.base_url());
        let err = provider
            .stream_tokens(ChatRequest::user("m", "hi"))
            .await
            .err()
            .unwrap();
        match err {
            TagStreamError::ProviderError { provider, code, .. } => {
                assert_eq!(provider, "local");
                assert_eq!(code, "401");
            }
            other => panic!("expected ProviderError, got: {other:?}"),
        }
    }
}
