use thiserror::Error;

/// Core error type for tagstream.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
///
/// Classification of tokens never produces one of these: malformed input
/// degrades to literal text, and validator rejections are plain values.
#[derive(Debug, Error)]
pub enum TagStreamError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("event sink rejected event: {0}")]
    Sink(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, TagStreamError>;

/// Outcome of parsing input that may still be arriving.
///
/// `Incomplete` means "wait for more input", `Malformed` means "give up".
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult<T> {
    Ok(T),
    Incomplete,
    Malformed(String),
}

impl<T> ParseResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseResult<U> {
        match self {
            Self::Ok(v) => ParseResult::Ok(f(v)),
            Self::Incomplete => ParseResult::Incomplete,
            Self::Malformed(m) => ParseResult::Malformed(m),
        }
    }
}
