//! Peer-to-peer session establishment and JSON-RPC messaging.
//!
//! Two untrusted parties bootstrap trust through an out-of-band pairing
//! URI, negotiate a session over an untrusted relay, and exchange opaque
//! chain-scoped requests for the session's lifetime. Everything on the
//! wire is sealed with per-topic symmetric keys; the relay sees only
//! topics and ciphertext.
//!
//! The [`SignClient`] is the single entry point: construct it with a
//! transport, a secret store, and a record store, consume its event
//! stream, and call [`SignClient::start`] to go online.

mod client;
mod config;
mod engine;
mod error;
mod methods;
mod pairing;
mod session;
mod types;
mod uri;
mod wire;

pub use client::SignClient;
pub use config::SignConfig;
pub use error::SignError;
pub use methods::SignMethod;
pub use types::{
    Metadata, Pairing, Proposal, ProposalNamespace, ProposalNamespaces, RelayProtocol, Session,
    SessionNamespace, SessionNamespaces, Side, SignEvent,
};
pub use uri::{PairingUri, URI_VERSION};

pub use waltz_rpc::{RpcErrorBody, RpcOutcome};
