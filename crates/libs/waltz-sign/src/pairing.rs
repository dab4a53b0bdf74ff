//! Pairing lifecycle: out-of-band bootstrap channels that carry session
//! proposals. One pairing may negotiate any number of sessions.

use std::time::Duration;

use serde_json::json;
use waltz_kms::{Kms, Topic};
use waltz_rpc::RpcOutcome;

use crate::engine::{now, Engine, PAIRINGS};
use crate::error::SignError;
use crate::methods::SignMethod;
use crate::types::{Pairing, RelayProtocol};
use crate::uri::PairingUri;
use crate::wire::{DeleteParams, CODE_USER_DISCONNECTED};

/// Fallback lifetime for URIs minted without an expiry.
const URI_FALLBACK_TTL: u64 = 5 * 60;

/// Wait bound for teardown/ping acknowledgments; short because the peer
/// may already be gone.
const FAREWELL_WAIT: Duration = Duration::from_secs(30);

impl Engine {
    /// Mints a fresh pairing: pre-shared symmetric key, derived topic,
    /// live subscription, and the URI to hand across the out-of-band
    /// channel.
    pub(crate) async fn create_pairing(&self) -> Result<(Pairing, PairingUri), SignError> {
        let (topic, key) = self.kms.generate_sym_key()?;
        let expiry = now() + self.config.pairing_ttl.as_secs();
        let pairing = Pairing {
            topic,
            relay: RelayProtocol::default(),
            peer_metadata: None,
            expiry,
            active: false,
        };
        self.records.set(PAIRINGS, &topic.to_hex(), &pairing)?;
        if let Err(err) = self.relay.subscribe(topic).await {
            self.records.delete(PAIRINGS, &topic.to_hex()).ok();
            self.kms.delete_sym_key(&topic).ok();
            return Err(err.into());
        }
        let uri = PairingUri::new(topic, pairing.relay.clone(), key, expiry);
        log::info!("pairing {topic} created");
        Ok((pairing, uri))
    }

    /// Adopts a peer's pairing URI: registers the pre-shared key and
    /// subscribes, leaving the pairing pending until a proposal arrives.
    pub(crate) async fn pair(&self, uri: &PairingUri) -> Result<Pairing, SignError> {
        let topic = uri.topic;
        if Kms::derive_topic(&uri.sym_key) != topic {
            return Err(SignError::malformed_uri("topic does not match symKey"));
        }
        if self.records.get::<Pairing>(PAIRINGS, &topic.to_hex())?.is_some() {
            return Err(SignError::PairingAlreadyExists { topic: topic.to_hex() });
        }
        let expiry = uri.expiry.unwrap_or_else(|| now() + URI_FALLBACK_TTL);
        if now() > expiry {
            return Err(SignError::invalid_expiry("pairing uri already expired"));
        }
        // Record and key land before the subscription: the relay mailbox may
        // deliver a retained proposal the instant the subscribe is acked, and
        // its handler must already find the pairing.
        self.kms.set_sym_key(&topic, &uri.sym_key)?;
        let pairing =
            Pairing { topic, relay: uri.relay.clone(), peer_metadata: None, expiry, active: false };
        self.records.set(PAIRINGS, &topic.to_hex(), &pairing)?;
        if let Err(err) = self.relay.subscribe(topic).await {
            self.records.delete(PAIRINGS, &topic.to_hex()).ok();
            self.kms.delete_sym_key(&topic).ok();
            return Err(err.into());
        }
        log::info!("paired on {topic}");
        Ok(pairing)
    }

    pub(crate) async fn ping_pairing(&self, topic: Topic) -> Result<(), SignError> {
        self.pairing(&topic)?;
        let outcome = self
            .dispatcher
            .request(
                topic,
                SignMethod::PairingPing.as_str(),
                json!({}),
                None,
                SignMethod::PairingPing.request_options(),
                FAREWELL_WAIT,
            )
            .await?;
        match outcome {
            RpcOutcome::Success(_) => Ok(()),
            RpcOutcome::Failure(body) => {
                Err(SignError::Peer { code: body.code, message: body.message })
            }
        }
    }

    /// Notifies the peer, then tears down the local pairing state. The
    /// farewell is best-effort: an unreachable peer does not keep the
    /// pairing alive.
    pub(crate) async fn disconnect_pairing(&self, topic: Topic) -> Result<(), SignError> {
        self.pairing(&topic)?;
        let params = DeleteParams {
            code: CODE_USER_DISCONNECTED,
            message: "user disconnected".to_owned(),
        };
        if let Err(err) = self
            .dispatcher
            .request(
                topic,
                SignMethod::PairingDelete.as_str(),
                serde_json::to_value(&params).unwrap_or_default(),
                None,
                SignMethod::PairingDelete.request_options(),
                FAREWELL_WAIT,
            )
            .await
        {
            log::debug!("pairing delete farewell on {topic}: {err}");
        }
        let _guard = self.locks.acquire(topic).await;
        self.purge_pairing(&topic).await
    }

    pub(crate) fn pairings(&self) -> Result<Vec<Pairing>, SignError> {
        let mut pairings: Vec<Pairing> = self
            .records
            .get_all::<Pairing>(PAIRINGS)?
            .into_iter()
            .map(|(_, pairing)| pairing)
            .collect();
        pairings.sort_by_key(|pairing| pairing.expiry);
        Ok(pairings)
    }
}
