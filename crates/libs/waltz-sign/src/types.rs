//! Public record types held by the engines and surfaced to the host.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use waltz_kms::{PublicKey, Topic};

/// Application self-description exchanged during pairing and settlement.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,
}

/// Relay routing options carried in URIs and proposals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProtocol {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Default for RelayProtocol {
    fn default() -> Self {
        Self { protocol: "irn".to_owned(), data: None }
    }
}

/// What a proposer asks for, keyed by namespace (e.g. `eip155`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalNamespace {
    pub chains: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// What the responder granted: accounts instead of bare chains.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNamespace {
    pub accounts: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

pub type ProposalNamespaces = BTreeMap<String, ProposalNamespace>;
pub type SessionNamespaces = BTreeMap<String, SessionNamespace>;

/// Which side controls the session (issues updates and events).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Peer,
}

/// Bootstrap channel shared out-of-band via URI. Pending until the first
/// proposal arrives from the peer, then active.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pairing {
    pub topic: Topic,
    pub relay: RelayProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<Metadata>,
    /// Unix seconds.
    pub expiry: u64,
    pub active: bool,
}

/// A proposal waiting for the host's approve/reject decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub id: u64,
    pub pairing_topic: Topic,
    pub proposer_public: PublicKey,
    pub proposer_metadata: Metadata,
    pub required_namespaces: ProposalNamespaces,
    pub relay: RelayProtocol,
    /// Unix seconds; auto-rejected past this.
    pub expiry: u64,
}

/// A settled encrypted channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub topic: Topic,
    pub relay: RelayProtocol,
    pub controller: Side,
    pub self_public: PublicKey,
    pub peer_public: PublicKey,
    pub peer_metadata: Metadata,
    pub namespaces: SessionNamespaces,
    /// Unix seconds.
    pub expiry: u64,
    /// False on the responder until the first inbound message on the
    /// session topic proves the proposer settled too.
    pub acknowledged: bool,
}

/// Everything the engines surface to the host. Delivered once each over
/// a single-consumer channel; no ordering promised across topics.
#[derive(Clone, Debug)]
pub enum SignEvent {
    SessionProposal(Proposal),
    SessionSettled(Session),
    SessionRejected { pairing_topic: Topic, code: i64, message: String },
    SessionRequest { topic: Topic, id: u64, chain_id: String, method: String, params: Value },
    SessionUpdated { topic: Topic, namespaces: SessionNamespaces },
    SessionExtended { topic: Topic, expiry: u64 },
    SessionEvent { topic: Topic, name: String, data: Value, chain_id: String },
    SessionDeleted { topic: Topic, reason: String },
    PairingDeleted { topic: Topic },
    Ping { topic: Topic },
}
