//! Error taxonomy shared by the subscribe loop, heartbeat and transports.

/// Errors surfaced by this crate.
///
/// Every variant is cheap to clone so that it can travel inside a
/// [`Status`](crate::Status) to several listeners.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("access denied: {message}")]
    AccessDenied {
        message: String,
        channels: Vec<String>,
        groups: Vec<String>,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("rate limited by service")]
    RateLimited,

    #[error("request rejected: status={status}, {message}")]
    BadRequest { status: u16, message: String },
}

impl Error {
    /// Whether the subscribe loop recovers from this error on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NetworkUnreachable(_) | Error::Timeout | Error::RateLimited
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
