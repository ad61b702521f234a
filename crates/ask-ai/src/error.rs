//! Error types for ask-ai

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Result type alias using ask-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a provider
#[derive(Error, Debug)]
pub enum Error {
    /// The provider answered with zero candidates/choices
    #[error("No response from {provider}")]
    EmptyResponse { provider: String },

    /// Non-2xx HTTP status or network failure
    #[error("{}", transport_message(.status, .body))]
    Transport { status: Option<u16>, body: String },

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stream data line that could not be understood
    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    /// Rate limit reported by the provider
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// No API key configured for the provider
    #[error("No API key configured for {provider}")]
    MissingCredential { provider: String },

    /// Configuration names a provider/model combination we cannot call
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),
}

fn transport_message(status: &Option<u16>, body: &str) -> String {
    match (*status, body.is_empty()) {
        (Some(status), true) => format!("API error: {}", status),
        (Some(status), false) => format!("API error ({}): {}", status, body),
        (None, _) => format!("Network error: {}", body),
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport {
            status: e.status().map(|s| s.as_u16()),
            body: e.to_string(),
        }
    }
}

/// Phrases providers use when rejecting a request for quota reasons.
static RATE_LIMIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)rate.?limit",
        r"(?i)too.?many.?requests",
        r"(?i)resource.?(has.?been.?)?exhausted",
        r"(?i)quota.?exceeded",
        r"\b429\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Check whether an error message reads like a rate-limit rejection
pub fn is_rate_limit_message(message: &str) -> bool {
    RATE_LIMIT_PATTERNS.iter().any(|re| re.is_match(message))
}

impl Error {
    /// Create a transport error from an HTTP status and response body
    pub fn transport(status: u16, body: impl Into<String>) -> Self {
        Self::Transport {
            status: Some(status),
            body: body.into(),
        }
    }

    /// Create a transport error for a failure with no HTTP status
    pub fn network(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            body: message.into(),
        }
    }

    /// Create an empty-response error for a provider
    pub fn empty_response(provider: impl Into<String>) -> Self {
        Self::EmptyResponse {
            provider: provider.into(),
        }
    }

    /// Check if this error should trigger the rate-limit backoff
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Error::RateLimited(_) => true,
            Error::Transport { status, body } => {
                *status == Some(429) || is_rate_limit_message(body)
            }
            _ => false,
        }
    }

    /// Check if a non-streaming failure may be retried over the streaming transport.
    ///
    /// Configuration problems never are: the same payload would fail the same way.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Json(_) | Error::EmptyResponse { .. }
        )
    }

    /// Check if this error is recovered locally and must not end a turn
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::MalformedChunk(_))
    }
}
