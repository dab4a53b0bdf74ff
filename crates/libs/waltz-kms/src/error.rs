use serde::{Deserialize, Serialize};

/// Errors produced by key management and envelope operations.
///
/// `KeyNotFound` is fatal for the operation that hit it (the topic is
/// unusable and should be cleaned up); the envelope variants mean the
/// offending message must be dropped, never retried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[non_exhaustive]
pub enum KmsError {
    #[error("no key material for {id}")]
    KeyNotFound { id: String },

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("secret store error: {reason}")]
    Store { reason: String },

    #[error("invalid key material: {reason}")]
    InvalidKey { reason: String },
}

impl KmsError {
    pub fn key_not_found(id: impl Into<String>) -> Self {
        Self::KeyNotFound { id: id.into() }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope { reason: reason.into() }
    }
}
