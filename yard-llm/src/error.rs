use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A backend handle could not be built for the requested model.
    #[error("backend configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("{0}")]
    RateLimited(RateLimitInfo),
}

impl LlmError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub fn rate_limit(&self) -> Option<&RateLimitInfo> {
        match self {
            Self::RateLimited(info) => Some(info),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

/// Raw timing hints captured from a rejected call. Values are kept as sent
/// by the provider; interpretation happens at the routing layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub status: u16,
    pub retry_after: Option<String>,
    pub requests_reset: Option<String>,
    pub tokens_reset: Option<String>,
    pub body: String,
}

const REQUESTS_RESET_HEADERS: [&str; 3] = [
    "x-ratelimit-reset-requests",
    "x-ratelimit-requests-reset",
    "anthropic-ratelimit-requests-reset",
];

const TOKENS_RESET_HEADERS: [&str; 3] = [
    "x-ratelimit-reset-tokens",
    "x-ratelimit-tokens-reset",
    "anthropic-ratelimit-tokens-reset",
];

impl RateLimitInfo {
    pub fn from_headers(status: u16, headers: &reqwest::header::HeaderMap, body: String) -> Self {
        Self {
            status,
            retry_after: header_value(headers, &["retry-after"]),
            requests_reset: header_value(headers, &REQUESTS_RESET_HEADERS),
            tokens_reset: header_value(headers, &TOKENS_RESET_HEADERS),
            body,
        }
    }

    pub fn has_timing_hints(&self) -> bool {
        self.retry_after.is_some() || self.requests_reset.is_some() || self.tokens_reset.is_some()
    }
}

impl fmt::Display for RateLimitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate limited status={}", self.status)?;
        if let Some(v) = &self.retry_after {
            write!(f, " retry_after={v}")?;
        }
        if let Some(v) = &self.requests_reset {
            write!(f, " requests_reset={v}")?;
        }
        if let Some(v) = &self.tokens_reset {
            write!(f, " tokens_reset={v}")?;
        }
        if !self.body.is_empty() {
            write!(f, " body={}", self.body)?;
        }
        Ok(())
    }
}

fn header_value(headers: &reqwest::header::HeaderMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToOwned::to_owned)
    })
}

/// Statuses that mean "try again later on another route" rather than a hard failure.
pub(crate) fn is_rate_limit_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 529
}
