use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::{CoreResult, TagStreamError};
use crate::model::ChatRequest;

/// Raw model output, one token (or token group) per item, tags and all.
pub type TokenStream = BoxStream<'static, CoreResult<String>>;

/// Anything that can produce a token stream for a chat request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Open the stream. Errors here mean the request never started; errors
    /// yielded by the stream mean it broke mid-way.
    async fn stream_tokens(&self, req: ChatRequest) -> CoreResult<TokenStream>;
}

/// Replays a fixed token list. Used by `replay` and by tests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    tokens: Vec<String>,
    delay: Option<Duration>,
    fail_with: Option<String>,
}

impl ScriptedProvider {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sleep this long before each token.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Yield an upstream error after the last token.
    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }
}

#[async_trait]
impl TokenProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_tokens(&self, _req: ChatRequest) -> CoreResult<TokenStream> {
        let delay = self.delay;
        let tokens = stream::iter(self.tokens.clone()).then(move |t| async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            Ok(t)
        });
        let tail = stream::iter(self.fail_with.clone().map(|message| {
            Err(TagStreamError::ProviderError {
                provider: "scripted".into(),
                code: "stream".into(),
                message,
            })
        }));
        Ok(tokens.chain(tail).boxed())
    }
}
