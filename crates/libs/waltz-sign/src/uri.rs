//! Out-of-band pairing URI:
//! `wc:{topic}@{version}?relay-protocol={p}&symKey={hex}&expiryTimestamp={unix}`.
//!
//! The URI deliberately carries the pairing symmetric key; it is only ever
//! shared over the out-of-band channel (QR code, deep link).

use std::fmt;
use std::str::FromStr;

use waltz_kms::{SymKey, Topic};

use crate::error::SignError;
use crate::types::RelayProtocol;

pub const URI_VERSION: u32 = 2;

#[derive(Clone, Debug)]
pub struct PairingUri {
    pub topic: Topic,
    pub version: u32,
    pub relay: RelayProtocol,
    pub sym_key: SymKey,
    /// Unix seconds; absent in URIs minted by older peers.
    pub expiry: Option<u64>,
}

impl PairingUri {
    pub fn new(topic: Topic, relay: RelayProtocol, sym_key: SymKey, expiry: u64) -> Self {
        Self { topic, version: URI_VERSION, relay, sym_key, expiry: Some(expiry) }
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wc:{}@{}?relay-protocol={}",
            self.topic.to_hex(),
            self.version,
            self.relay.protocol
        )?;
        if let Some(data) = &self.relay.data {
            write!(f, "&relay-data={data}")?;
        }
        write!(f, "&symKey={}", self.sym_key.to_hex())?;
        if let Some(expiry) = self.expiry {
            write!(f, "&expiryTimestamp={expiry}")?;
        }
        Ok(())
    }
}

impl FromStr for PairingUri {
    type Err = SignError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let rest = value
            .strip_prefix("wc:")
            .ok_or_else(|| SignError::malformed_uri("missing wc: scheme"))?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);

        let (head, query) = rest
            .split_once('?')
            .ok_or_else(|| SignError::malformed_uri("missing query"))?;
        let (topic_hex, version) = head
            .split_once('@')
            .ok_or_else(|| SignError::malformed_uri("missing @version"))?;
        let topic: Topic = topic_hex
            .parse()
            .map_err(|err| SignError::malformed_uri(format!("topic: {err}")))?;
        let version: u32 = version
            .parse()
            .map_err(|_| SignError::malformed_uri(format!("bad version: {version}")))?;

        let mut protocol = None;
        let mut data = None;
        let mut sym_key = None;
        let mut expiry = None;
        for pair in query.split('&') {
            let (key, val) = pair
                .split_once('=')
                .ok_or_else(|| SignError::malformed_uri(format!("bad query pair: {pair}")))?;
            match key {
                "relay-protocol" => protocol = Some(val.to_owned()),
                "relay-data" => data = Some(val.to_owned()),
                "symKey" => {
                    let key: SymKey = val
                        .parse()
                        .map_err(|err| SignError::malformed_uri(format!("symKey: {err}")))?;
                    sym_key = Some(key);
                }
                "expiryTimestamp" => {
                    let at: u64 = val.parse().map_err(|_| {
                        SignError::malformed_uri(format!("bad expiryTimestamp: {val}"))
                    })?;
                    expiry = Some(at);
                }
                // Unknown parameters are tolerated for forward compatibility.
                _ => {}
            }
        }

        let protocol =
            protocol.ok_or_else(|| SignError::malformed_uri("missing relay-protocol"))?;
        let sym_key = sym_key.ok_or_else(|| SignError::malformed_uri("missing symKey"))?;
        Ok(Self { topic, version, relay: RelayProtocol { protocol, data }, sym_key, expiry })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PairingUri {
        PairingUri::new(
            Topic::from_bytes([0xab; 32]),
            RelayProtocol::default(),
            SymKey::from_bytes([0xcd; 32]),
            1_700_000_000,
        )
    }

    #[test]
    fn round_trips_through_display() {
        let uri = sample();
        let text = uri.to_string();
        assert!(text.starts_with("wc:abab"));
        let parsed: PairingUri = text.parse().expect("parse");
        assert_eq!(parsed.topic, uri.topic);
        assert_eq!(parsed.version, URI_VERSION);
        assert_eq!(parsed.sym_key, uri.sym_key);
        assert_eq!(parsed.expiry, Some(1_700_000_000));
        assert_eq!(parsed.relay, uri.relay);
    }

    #[test]
    fn accepts_scheme_with_slashes_and_unknown_params() {
        let text = format!(
            "wc://{}@2?relay-protocol=irn&symKey={}&methods=wc_sessionPropose",
            Topic::from_bytes([1; 32]).to_hex(),
            SymKey::from_bytes([2; 32]).to_hex()
        );
        let parsed: PairingUri = text.parse().expect("parse");
        assert_eq!(parsed.expiry, None);
        assert_eq!(parsed.relay.protocol, "irn");
    }

    #[test]
    fn rejects_missing_scheme_version_and_key() {
        assert!(matches!(
            "http://example".parse::<PairingUri>(),
            Err(SignError::MalformedUri { .. })
        ));
        let no_version = format!(
            "wc:{}?relay-protocol=irn&symKey={}",
            Topic::from_bytes([1; 32]).to_hex(),
            SymKey::from_bytes([2; 32]).to_hex()
        );
        assert!(matches!(no_version.parse::<PairingUri>(), Err(SignError::MalformedUri { .. })));
        let no_key = format!("wc:{}@2?relay-protocol=irn", Topic::from_bytes([1; 32]).to_hex());
        assert!(matches!(no_key.parse::<PairingUri>(), Err(SignError::MalformedUri { .. })));
    }

    #[test]
    fn rejects_short_topic_and_bad_hex() {
        let short = format!("wc:abcd@2?relay-protocol=irn&symKey={}", "11".repeat(32));
        assert!(matches!(short.parse::<PairingUri>(), Err(SignError::MalformedUri { .. })));
        let bad_key = format!(
            "wc:{}@2?relay-protocol=irn&symKey=zz",
            Topic::from_bytes([1; 32]).to_hex()
        );
        assert!(matches!(bad_key.parse::<PairingUri>(), Err(SignError::MalformedUri { .. })));
    }
}
