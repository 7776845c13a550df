use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::Stream;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::config::HttpCfg;
use crate::error::{CoreResult, TagStreamError};

/// Per-request tracing context forwarded as headers.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub run_id: Option<&'a str>,
}

/// One line of an SSE body, already split on `\n` (CRLF tolerated).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseLine {
    pub line: String,
}

pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseLine>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| TagStreamError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("tagstream/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    /// POST JSON and return the response body as a stream of SSE lines.
    /// Lines are yielded raw; callers decide what `data:` means.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        provider: &str,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<SseStream> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.run_id {
            req = req.header("X-Request-Id", rid);
        }

        let resp = req.send().await.map_err(|e| {
            tracing::debug!(provider, error = %e, "request failed before a response");
            TagStreamError::ProviderUnavailable {
                provider: provider.to_string(),
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let ra = parse_retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(provider, status, ra, &body));
        }
        if let Some(id) = extract_request_id(resp.headers()) {
            tracing::debug!(provider, upstream_request_id = %id, "stream opened");
        }

        Ok(Box::pin(LineStream::new(
            provider,
            Box::pin(resp.bytes_stream()),
        )))
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["x-request-id", "request-id", "x-amzn-requestid"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    // Only the delta-seconds form; HTTP-dates are ignored.
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

pub(crate) fn map_http_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> TagStreamError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => TagStreamError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if s.is_server_error() => TagStreamError::ProviderUnavailable {
            provider: provider.to_string(),
        },
        s => TagStreamError::ProviderError {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}

/// Splits a byte stream into lines. Bytes are buffered until a full line is
/// available so multi-byte characters split across chunks survive intact.
struct LineStream {
    provider: String,
    inner: ByteStream,
    buf: Vec<u8>,
    done: bool,
}

impl LineStream {
    fn new(provider: &str, inner: ByteStream) -> Self {
        Self {
            provider: provider.to_string(),
            inner,
            buf: Vec::new(),
            done: false,
        }
    }

    fn take_line(&mut self, end: usize) -> SseLine {
        let mut raw: Vec<u8> = self.buf.drain(..end).collect();
        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        SseLine {
            line: String::from_utf8_lossy(&raw).into_owned(),
        }
    }
}

impl Stream for LineStream {
    type Item = CoreResult<SseLine>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
                let line = self.take_line(idx + 1);
                return Poll::Ready(Some(Ok(line)));
            }
            if self.done {
                return Poll::Ready(None);
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.buf.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    tracing::debug!(provider = %self.provider, error = %e, "stream body failed");
                    return Poll::Ready(Some(Err(TagStreamError::ProviderUnavailable {
                        provider: self.provider.clone(),
                    })));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if self.buf.is_empty() {
                        return Poll::Ready(None);
                    }
                    let len = self.buf.len();
                    let line = self.take_line(len);
                    return Poll::Ready(Some(Ok(line)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
