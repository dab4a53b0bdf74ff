//! The closed set of protocol methods. Anything outside this enum is
//! answered with a JSON-RPC method-not-found error, never dispatched
//! dynamically.

use std::time::Duration;

use waltz_rpc::PublishOptions;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignMethod {
    SessionPropose,
    /// Reserved by the wire protocol; this implementation settles through
    /// the propose response instead and answers it method-not-found.
    SessionSettle,
    SessionUpdate,
    SessionExtend,
    SessionRequest,
    SessionEvent,
    SessionDelete,
    SessionPing,
    PairingPing,
    PairingDelete,
}

impl SignMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionPropose => "wc_sessionPropose",
            Self::SessionSettle => "wc_sessionSettle",
            Self::SessionUpdate => "wc_sessionUpdate",
            Self::SessionExtend => "wc_sessionExtend",
            Self::SessionRequest => "wc_sessionRequest",
            Self::SessionEvent => "wc_sessionEvent",
            Self::SessionDelete => "wc_sessionDelete",
            Self::SessionPing => "wc_sessionPing",
            Self::PairingPing => "wc_pairingPing",
            Self::PairingDelete => "wc_pairingDelete",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "wc_sessionPropose" => Some(Self::SessionPropose),
            "wc_sessionSettle" => Some(Self::SessionSettle),
            "wc_sessionUpdate" => Some(Self::SessionUpdate),
            "wc_sessionExtend" => Some(Self::SessionExtend),
            "wc_sessionRequest" => Some(Self::SessionRequest),
            "wc_sessionEvent" => Some(Self::SessionEvent),
            "wc_sessionDelete" => Some(Self::SessionDelete),
            "wc_sessionPing" => Some(Self::SessionPing),
            "wc_pairingPing" => Some(Self::PairingPing),
            "wc_pairingDelete" => Some(Self::PairingDelete),
            _ => None,
        }
    }

    /// Relay tag for the request; the response uses tag + 1.
    pub fn tag(&self) -> u32 {
        match self {
            Self::PairingDelete => 1000,
            Self::PairingPing => 1002,
            Self::SessionPropose => 1100,
            Self::SessionSettle => 1102,
            Self::SessionUpdate => 1104,
            Self::SessionExtend => 1106,
            Self::SessionRequest => 1108,
            Self::SessionEvent => 1110,
            Self::SessionDelete => 1112,
            Self::SessionPing => 1114,
        }
    }

    /// Relay retention for an undelivered request.
    pub fn ttl(&self) -> Duration {
        let secs = match self {
            Self::SessionPropose | Self::SessionSettle => 5 * MINUTE,
            Self::SessionRequest | Self::SessionEvent => 5 * MINUTE,
            Self::SessionPing | Self::PairingPing => 30,
            Self::SessionUpdate | Self::SessionExtend => DAY,
            Self::SessionDelete | Self::PairingDelete => DAY,
        };
        Duration::from_secs(secs)
    }

    /// Whether the relay should wake the peer's push channel.
    pub fn prompt(&self) -> bool {
        matches!(self, Self::SessionPropose | Self::SessionRequest)
    }

    pub fn request_options(&self) -> PublishOptions {
        PublishOptions { ttl: self.ttl(), tag: self.tag(), prompt: self.prompt() }
    }

    pub fn response_options(&self) -> PublishOptions {
        PublishOptions { ttl: self.ttl(), tag: self.tag() + 1, prompt: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SignMethod; 10] = [
        SignMethod::SessionPropose,
        SignMethod::SessionSettle,
        SignMethod::SessionUpdate,
        SignMethod::SessionExtend,
        SignMethod::SessionRequest,
        SignMethod::SessionEvent,
        SignMethod::SessionDelete,
        SignMethod::SessionPing,
        SignMethod::PairingPing,
        SignMethod::PairingDelete,
    ];

    #[test]
    fn names_round_trip() {
        for method in ALL {
            assert_eq!(SignMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(SignMethod::parse("wc_sessionApprove"), None);
        assert_eq!(SignMethod::parse(""), None);
    }

    #[test]
    fn request_and_response_tags_are_distinct() {
        let mut tags: Vec<u32> =
            ALL.iter().flat_map(|m| [m.tag(), m.response_options().tag]).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), ALL.len() * 2);
    }
}
