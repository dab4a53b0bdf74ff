use thiserror::Error;
use waltz_kms::KmsError;
use waltz_relay::RelayError;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no response within the request window")]
    RequestTimeout,

    #[error("dispatcher stopped")]
    DispatcherStopped,

    #[error("payload serialization failed: {reason}")]
    Serialization { reason: String },

    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl RpcError {
    /// Whether retrying the same request with the same id is reasonable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestTimeout => true,
            Self::Relay(err) => err.is_retryable(),
            Self::DispatcherStopped | Self::Serialization { .. } | Self::Kms(_) => false,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { reason: err.to_string() }
    }
}
