use thiserror::Error;
use waltz_kms::KmsError;
use waltz_relay::RelayError;
use waltz_rpc::RpcError;
use waltz_storage::StorageError;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("malformed pairing uri: {reason}")]
    MalformedUri { reason: String },

    #[error("pairing already exists for topic {topic}")]
    PairingAlreadyExists { topic: String },

    #[error("no pairing for topic {topic}")]
    UnknownPairing { topic: String },

    #[error("no session for topic {topic}")]
    UnknownSession { topic: String },

    #[error("no pending proposal with id {id}")]
    UnknownProposal { id: u64 },

    #[error("proposal {id} expired")]
    ProposalExpired { id: u64 },

    #[error("session expired")]
    SessionExpired,

    #[error("invalid expiry: {reason}")]
    InvalidExpiry { reason: String },

    #[error("event {name} not authorized by the session namespaces")]
    UnauthorizedEvent { name: String },

    #[error("peer answered with error {code}: {message}")]
    Peer { code: i64, message: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SignError {
    pub fn malformed_uri(reason: impl Into<String>) -> Self {
        Self::MalformedUri { reason: reason.into() }
    }

    pub fn invalid_expiry(reason: impl Into<String>) -> Self {
        Self::InvalidExpiry { reason: reason.into() }
    }
}
