use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

/// Substrings of transport error messages that indicate a dropped connection rather than a
/// rejected request.
const TRANSIENT_NETWORK_PATTERNS: &[&str] = &[
    "connection reset",
    "econnreset",
    "terminated",
    "socket hang up",
    "broken pipe",
    "connection closed",
    "timed out",
    "timeout",
    "unexpected eof",
    "incomplete body",
    "error decoding response body",
    "connection refused",
];

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{provider} api error status={status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),

    #[error("tool pairing error: {0}")]
    ToolPairing(String),

    #[error("no usable {provider} credential (checked: {})", checked.join(", "))]
    Authentication {
        provider: String,
        checked: Vec<String>,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn api(provider: &str, status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            provider: provider.to_string(),
            status,
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a fresh attempt of the same request may succeed.
    ///
    /// 429 and 5xx are transient, other 4xx are not. Stream parse and pairing failures are
    /// local to one attempt: the vendor regenerates from scratch on the next one.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Network(message) => {
                let lower = message.to_ascii_lowercase();
                TRANSIENT_NETWORK_PATTERNS
                    .iter()
                    .any(|pattern| lower.contains(pattern))
            }
            Self::StreamParse(_) | Self::ToolPairing(_) => true,
            Self::InvalidInput(_)
            | Self::ResponseFormat(_)
            | Self::Authentication { .. }
            | Self::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::Api {
                provider: "http".to_string(),
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        if e.is_decode() {
            return Self::ResponseFormat(e.to_string());
        }
        if e.is_timeout() {
            return Self::Network(format!("request timed out: {e}"));
        }
        if e.is_connect() {
            return Self::Network(format!("connection refused: {e}"));
        }
        if e.is_body() {
            return Self::Network(format!("incomplete body: {e}"));
        }
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
