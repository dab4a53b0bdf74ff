//! Serde bodies for the protocol's RPC params and results, camelCase on
//! the wire, plus the protocol-level error codes both sides understand.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use waltz_kms::PublicKey;

use crate::types::{Metadata, ProposalNamespaces, RelayProtocol, SessionNamespaces};

pub(crate) const CODE_INVALID_PARAMS: i64 = -32602;
pub(crate) const CODE_USER_REJECTED: i64 = 5000;
pub(crate) const CODE_INVALID_EXPIRY: i64 = 5001;
pub(crate) const CODE_UNAUTHORIZED_EVENT: i64 = 5002;
pub(crate) const CODE_USER_DISCONNECTED: i64 = 6000;
pub(crate) const CODE_NO_SESSION: i64 = 7002;
pub(crate) const CODE_EXPIRED: i64 = 8000;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Participant {
    pub public_key: PublicKey,
    pub metadata: Metadata,
}

/// `wc_sessionPropose` params.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProposeParams {
    pub relay: RelayProtocol,
    pub proposer: Participant,
    pub required_namespaces: ProposalNamespaces,
}

/// Result of a successful `wc_sessionPropose`: the settlement. The
/// responder's public key lets the proposer run its half of the key
/// agreement.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SettleResult {
    pub relay: RelayProtocol,
    pub responder: Participant,
    pub namespaces: SessionNamespaces,
    pub expiry: u64,
}

/// `wc_sessionRequest` params: an opaque method call scoped to a chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionRequestParams {
    pub chain_id: String,
    pub request: RequestPayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RequestPayload {
    pub method: String,
    pub params: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct UpdateParams {
    pub namespaces: SessionNamespaces,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ExtendParams {
    pub expiry: u64,
}

/// `wc_sessionEvent` params.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventParams {
    pub chain_id: String,
    pub event: EventPayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct EventPayload {
    pub name: String,
    pub data: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct DeleteParams {
    pub code: i64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propose_params_use_camel_case() {
        let params = ProposeParams {
            relay: RelayProtocol::default(),
            proposer: Participant {
                public_key: PublicKey::from_bytes([3; 32]),
                metadata: Metadata::default(),
            },
            required_namespaces: ProposalNamespaces::new(),
        };
        let value = serde_json::to_value(&params).expect("serialize");
        assert!(value["proposer"].get("publicKey").is_some());
        assert!(value.get("requiredNamespaces").is_some());
    }

    #[test]
    fn request_params_nest_the_call() {
        let params = SessionRequestParams {
            chain_id: "eip155:1".into(),
            request: RequestPayload {
                method: "eth_sendTransaction".into(),
                params: serde_json::json!([{"to": "0x00"}]),
            },
        };
        let value = serde_json::to_value(&params).expect("serialize");
        assert_eq!(value["chainId"], "eip155:1");
        assert_eq!(value["request"]["method"], "eth_sendTransaction");
    }
}
