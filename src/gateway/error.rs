// Gateway error types
//
// Upstream failures carry the numeric status and body so callers can thread
// the real code outward instead of parsing error strings.

use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Non-2xx response from the upstream (or a proxy check URL).
    #[error("upstream returned {status}: {body}")]
    Http { status: u16, body: String },

    /// The provider has no usable key at all.
    #[error("no valid API key available for provider '{provider}'")]
    NoApiKey { provider: String },

    /// Connect/timeout/decode failures before a status line was seen.
    #[error("request failed: {0}")]
    Network(String),
}

impl UpstreamError {
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: body.into(),
        }
    }

    /// HTTP status to report to the client.
    pub fn status(&self) -> u16 {
        match self {
            Self::Http { status, .. } => *status,
            Self::NoApiKey { .. } | Self::Network(_) => 500,
        }
    }

    /// Message to report to the client and the error log.
    pub fn message(&self) -> String {
        match self {
            Self::Http { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }

    /// OpenAI-style error body: `{"error": {"code", "message"}}`.
    pub fn to_error_body(&self) -> serde_json::Value {
        json!({
            "error": {
                "code": self.status(),
                "message": self.message(),
            }
        })
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}
