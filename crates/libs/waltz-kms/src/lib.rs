//! Key management and envelope codec for the waltz session protocol.
//!
//! This crate owns every piece of key material in the system:
//!
//! - **[`Kms`]** — X25519 key pairs, Diffie-Hellman agreement with
//!   HKDF-SHA256 derivation, and topic-keyed symmetric key storage behind a
//!   pluggable [`SecretStore`].
//! - **[`Envelope`]** — the AEAD sealbox wire unit. Type0 carries ciphertext
//!   for a topic whose symmetric key both sides already hold; Type1
//!   additionally attaches the sender's one-time public key for the
//!   handshake-time proposal.
//!
//! Private key material never leaves the secret store and is never logged.

mod envelope;
mod error;
mod keys;

pub use envelope::{Envelope, OpenedPayload, ENVELOPE_TYPE0, ENVELOPE_TYPE1};
pub use error::KmsError;
pub use keys::{InMemorySecretStore, Kms, PublicKey, SecretStore, SymKey, Topic};
