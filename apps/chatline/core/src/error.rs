use crate::limiter::RateLimitError;
use crate::protocol::TransportError;

/// Why an outbound send did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    #[error("Session paused due to connection issues")]
    SessionPaused,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("rate limiter unavailable: {0}")]
    Limiter(String),
}

impl SendError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            SendError::RateLimitExceeded => "rate_limited",
            SendError::SessionPaused => "paused",
            SendError::Transport(_) => "transport",
            SendError::Limiter(_) => "limiter",
        }
    }
}

impl From<RateLimitError> for SendError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded => SendError::RateLimitExceeded,
            RateLimitError::Store(message) => SendError::Limiter(message),
        }
    }
}
