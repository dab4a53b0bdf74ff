use serde::{Deserialize, Serialize};

/// Transport-level failures. Retryable variants never terminate the
/// connection or affect other topics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[non_exhaustive]
pub enum RelayError {
    #[error("relay connection closed")]
    ConnectionClosed,

    #[error("publish not acknowledged within the ack window")]
    PublishTimeout,

    #[error("publish queue overflow, oldest entry dropped")]
    Backpressure,

    #[error("relay client stopped")]
    ClientStopped,

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("relay protocol error: {reason}")]
    Protocol { reason: String },
}

impl RelayError {
    /// Transient failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::PublishTimeout | Self::Backpressure
        )
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport { reason: reason.into() }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol { reason: reason.into() }
    }
}
