//! Session lifecycle: proposal, settlement, request/response exchange,
//! mutation, and teardown.
//!
//! Settlement rides on the JSON-RPC layer itself: the responder's approval
//! is the *response* to `wc_sessionPropose`, carrying the responder public
//! key and agreed namespaces. The proposer then runs its half of the key
//! agreement, so both sides converge on the same session topic without a
//! separate settle round-trip.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use waltz_kms::{Kms, PublicKey, Topic};
use waltz_rpc::{RpcError, RpcErrorBody, RpcOutcome};

use crate::engine::{now, Engine, PAIRINGS, PROPOSALS, SESSIONS};
use crate::error::SignError;
use crate::methods::SignMethod;
use crate::types::{
    Proposal, ProposalNamespaces, RelayProtocol, Session, SessionNamespaces, Side, SignEvent,
};
use crate::uri::PairingUri;
use crate::wire::{
    DeleteParams, EventParams, EventPayload, ExtendParams, Participant, ProposeParams,
    RequestPayload, SessionRequestParams, SettleResult, UpdateParams, CODE_EXPIRED,
    CODE_USER_DISCONNECTED, CODE_USER_REJECTED,
};

const FAREWELL_WAIT: Duration = Duration::from_secs(30);

impl Engine {
    /// Proposes a session. Without a pairing topic a fresh pairing is
    /// minted and its URI returned for out-of-band delivery; with one, the
    /// proposal goes out on the existing pairing and no URI is needed.
    ///
    /// The settlement wait runs in the background: the outcome surfaces as
    /// a [`SignEvent::SessionSettled`] or [`SignEvent::SessionRejected`].
    pub(crate) async fn connect(
        self: &Arc<Self>,
        required_namespaces: ProposalNamespaces,
        pairing_topic: Option<Topic>,
    ) -> Result<Option<PairingUri>, SignError> {
        let (pairing_topic, uri) = match pairing_topic {
            Some(topic) => {
                self.pairing(&topic)?;
                (topic, None)
            }
            None => {
                let (pairing, uri) = self.create_pairing().await?;
                (pairing.topic, Some(uri))
            }
        };

        let self_public = self.kms.generate_key_pair()?;
        let params = ProposeParams {
            relay: RelayProtocol::default(),
            proposer: Participant {
                public_key: self_public,
                metadata: self.config.metadata.clone(),
            },
            required_namespaces,
        };
        let body = serde_json::to_value(&params).map_err(RpcError::from)?;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            // The proposal travels as a type 1 envelope so the responder
            // learns the session key even though only the pairing key is
            // shared yet.
            let outcome = engine
                .dispatcher
                .request(
                    pairing_topic,
                    SignMethod::SessionPropose.as_str(),
                    body,
                    Some(self_public),
                    SignMethod::SessionPropose.request_options(),
                    engine.config.proposal_window,
                )
                .await;
            engine.finish_proposal(pairing_topic, self_public, outcome).await;
        });

        Ok(uri)
    }

    async fn finish_proposal(
        &self,
        pairing_topic: Topic,
        self_public: PublicKey,
        outcome: Result<RpcOutcome, RpcError>,
    ) {
        match outcome {
            Ok(RpcOutcome::Success(value)) => {
                match self.settle_proposer(pairing_topic, self_public, value).await {
                    Ok(session) => self.emit(SignEvent::SessionSettled(session)).await,
                    Err(err) => {
                        log::warn!("settlement on pairing {pairing_topic} failed: {err}");
                        self.discard_proposer_key(&self_public);
                    }
                }
            }
            Ok(RpcOutcome::Failure(body)) => {
                log::info!(
                    "proposal on pairing {pairing_topic} rejected ({}): {}",
                    body.code,
                    body.message
                );
                self.discard_proposer_key(&self_public);
                self.emit(SignEvent::SessionRejected {
                    pairing_topic,
                    code: body.code,
                    message: body.message,
                })
                .await;
            }
            Err(err) => {
                log::warn!("proposal on pairing {pairing_topic} got no settlement: {err}");
                self.discard_proposer_key(&self_public);
                // The host is waiting on an event either way; an expired
                // proposal surfaces like a rejection.
                self.emit(SignEvent::SessionRejected {
                    pairing_topic,
                    code: CODE_EXPIRED,
                    message: "no settlement before the proposal window lapsed".to_owned(),
                })
                .await;
            }
        }
    }

    fn discard_proposer_key(&self, self_public: &PublicKey) {
        if let Err(err) = self.kms.delete_key_pair(self_public) {
            log::debug!("proposer key cleanup: {err}");
        }
    }

    /// Proposer half of settlement: derive the session key from the
    /// responder's public key, subscribe the topic, persist the session.
    async fn settle_proposer(
        &self,
        pairing_topic: Topic,
        self_public: PublicKey,
        value: Value,
    ) -> Result<Session, SignError> {
        let settle: SettleResult = serde_json::from_value(value).map_err(RpcError::from)?;
        let key = self.kms.key_agreement(&self_public, &settle.responder.public_key)?;
        let topic = Kms::derive_topic(&key);
        let _guard = self.locks.acquire(topic).await;
        self.kms.set_sym_key(&topic, &key)?;
        self.relay.subscribe(topic).await?;
        let session = Session {
            topic,
            relay: settle.relay,
            controller: Side::Peer,
            self_public,
            peer_public: settle.responder.public_key,
            peer_metadata: settle.responder.metadata.clone(),
            namespaces: settle.namespaces,
            expiry: settle.expiry,
            acknowledged: true,
        };
        self.records.set(SESSIONS, &topic.to_hex(), &session)?;

        // Settlement proves the pairing works.
        if let Ok(mut pairing) = self.pairing(&pairing_topic) {
            pairing.active = true;
            pairing.peer_metadata = Some(settle.responder.metadata);
            let _ = self.records.set(PAIRINGS, &pairing_topic.to_hex(), &pairing);
        }
        log::info!("session {topic} settled (proposer side)");
        Ok(session)
    }

    /// Responder-side arrival of `wc_sessionPropose` on a pairing topic.
    pub(crate) async fn on_propose(&self, inbound: waltz_rpc::InboundRpc) -> Result<(), SignError> {
        let options = SignMethod::SessionPropose.response_options();
        let mut pairing = match self.pairing(&inbound.topic) {
            Ok(pairing) => pairing,
            Err(_) => {
                log::warn!("dropping proposal on unknown pairing {}", inbound.topic);
                return Ok(());
            }
        };
        let params: ProposeParams = match serde_json::from_value(inbound.params) {
            Ok(params) => params,
            Err(err) => {
                self.answer(
                    inbound.topic,
                    inbound.id,
                    RpcOutcome::Failure(RpcErrorBody::new(
                        crate::wire::CODE_INVALID_PARAMS,
                        format!("invalid proposal: {err}"),
                    )),
                    options,
                )
                .await;
                return Ok(());
            }
        };

        // First proposal activates the pairing.
        pairing.active = true;
        pairing.peer_metadata = Some(params.proposer.metadata.clone());
        self.records.set(PAIRINGS, &inbound.topic.to_hex(), &pairing)?;

        let proposal = Proposal {
            id: inbound.id,
            pairing_topic: inbound.topic,
            proposer_public: params.proposer.public_key,
            proposer_metadata: params.proposer.metadata,
            required_namespaces: params.required_namespaces,
            relay: params.relay,
            expiry: now() + self.config.proposal_window.as_secs(),
        };
        self.records.set(PROPOSALS, &proposal.id.to_string(), &proposal)?;
        self.emit(SignEvent::SessionProposal(proposal)).await;
        Ok(())
    }

    /// Approves a pending proposal. Settlement is atomic as observed by the
    /// caller: either the session exists with its key, subscription, and
    /// record, or every partial step has been rolled back.
    pub(crate) async fn approve(
        &self,
        proposal_id: u64,
        namespaces: SessionNamespaces,
    ) -> Result<Session, SignError> {
        let proposal: Proposal = self
            .records
            .get(PROPOSALS, &proposal_id.to_string())?
            .ok_or(SignError::UnknownProposal { id: proposal_id })?;
        if now() > proposal.expiry {
            self.records.delete(PROPOSALS, &proposal_id.to_string())?;
            return Err(SignError::ProposalExpired { id: proposal_id });
        }
        let _guard = self.locks.acquire(proposal.pairing_topic).await;

        let self_public = self.kms.generate_key_pair()?;
        let key = self.kms.key_agreement(&self_public, &proposal.proposer_public)?;
        let topic = Kms::derive_topic(&key);
        let expiry = now() + self.config.session_ttl.as_secs();

        self.kms.set_sym_key(&topic, &key)?;
        if let Err(err) = self.relay.subscribe(topic).await {
            self.rollback_settlement(&topic, &self_public, false).await;
            return Err(err.into());
        }
        let session = Session {
            topic,
            relay: proposal.relay.clone(),
            controller: Side::Local,
            self_public,
            peer_public: proposal.proposer_public,
            peer_metadata: proposal.proposer_metadata.clone(),
            namespaces: namespaces.clone(),
            expiry,
            // Unacknowledged until the proposer shows up on the session
            // topic; a proposer that died mid-settlement leaves this
            // session identifiable for cleanup.
            acknowledged: false,
        };
        if let Err(err) = self.records.set(SESSIONS, &topic.to_hex(), &session) {
            self.rollback_settlement(&topic, &self_public, true).await;
            return Err(err.into());
        }

        let settle = SettleResult {
            relay: session.relay.clone(),
            responder: Participant { public_key: self_public, metadata: self.config.metadata.clone() },
            namespaces,
            expiry,
        };
        let body = serde_json::to_value(&settle).map_err(RpcError::from)?;
        if let Err(err) = self
            .dispatcher
            .respond(
                proposal.pairing_topic,
                proposal.id,
                RpcOutcome::Success(body),
                None,
                SignMethod::SessionPropose.response_options(),
            )
            .await
        {
            self.records.delete(SESSIONS, &topic.to_hex()).ok();
            self.rollback_settlement(&topic, &self_public, true).await;
            return Err(err.into());
        }

        self.records.delete(PROPOSALS, &proposal_id.to_string())?;
        log::info!("session {topic} settled (responder side)");
        Ok(session)
    }

    async fn rollback_settlement(&self, topic: &Topic, self_public: &PublicKey, subscribed: bool) {
        if let Err(err) = self.kms.delete_sym_key(topic) {
            log::debug!("settlement rollback key cleanup: {err}");
        }
        if let Err(err) = self.kms.delete_key_pair(self_public) {
            log::debug!("settlement rollback key pair cleanup: {err}");
        }
        if subscribed {
            if let Err(err) = self.relay.unsubscribe(*topic).await {
                log::debug!("settlement rollback unsubscribe: {err}");
            }
        }
    }

    /// Rejects a pending proposal; the proposer sees the reason verbatim.
    pub(crate) async fn reject(&self, proposal_id: u64, reason: &str) -> Result<(), SignError> {
        let proposal: Proposal = self
            .records
            .get(PROPOSALS, &proposal_id.to_string())?
            .ok_or(SignError::UnknownProposal { id: proposal_id })?;
        self.records.delete(PROPOSALS, &proposal_id.to_string())?;
        self.dispatcher
            .respond(
                proposal.pairing_topic,
                proposal.id,
                RpcOutcome::Failure(RpcErrorBody::new(CODE_USER_REJECTED, reason)),
                None,
                SignMethod::SessionPropose.response_options(),
            )
            .await?;
        Ok(())
    }

    /// An opaque chain-scoped call to the peer, resolved with the peer's
    /// result. Expired sessions fail locally before any network traffic.
    pub(crate) async fn request(
        &self,
        topic: Topic,
        chain_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, SignError> {
        let session = self.session(&topic)?;
        if now() > session.expiry {
            return Err(SignError::SessionExpired);
        }
        let body = SessionRequestParams {
            chain_id: chain_id.to_owned(),
            request: RequestPayload { method: method.to_owned(), params },
        };
        let outcome = self
            .dispatcher
            .request(
                topic,
                SignMethod::SessionRequest.as_str(),
                serde_json::to_value(&body).map_err(RpcError::from)?,
                None,
                SignMethod::SessionRequest.request_options(),
                self.config.request_timeout,
            )
            .await?;
        match outcome {
            RpcOutcome::Success(result) => Ok(result),
            RpcOutcome::Failure(body) => {
                Err(SignError::Peer { code: body.code, message: body.message })
            }
        }
    }

    /// Answers an inbound session request surfaced as
    /// [`SignEvent::SessionRequest`].
    pub(crate) async fn respond(
        &self,
        topic: Topic,
        id: u64,
        outcome: RpcOutcome,
    ) -> Result<(), SignError> {
        self.session(&topic)?;
        self.dispatcher
            .respond(topic, id, outcome, None, SignMethod::SessionRequest.response_options())
            .await?;
        Ok(())
    }

    pub(crate) async fn update(
        &self,
        topic: Topic,
        namespaces: SessionNamespaces,
    ) -> Result<(), SignError> {
        // The topic lock is never held across the peer round-trip: the
        // inbound loop needs it to serve the peer's own mutations, and two
        // sides updating at once would otherwise deadlock until timeout.
        {
            let _guard = self.locks.acquire(topic).await;
            let session = self.session(&topic)?;
            if now() > session.expiry {
                return Err(SignError::SessionExpired);
            }
        }
        let body = UpdateParams { namespaces: namespaces.clone() };
        let outcome = self
            .dispatcher
            .request(
                topic,
                SignMethod::SessionUpdate.as_str(),
                serde_json::to_value(&body).map_err(RpcError::from)?,
                None,
                SignMethod::SessionUpdate.request_options(),
                self.config.request_timeout,
            )
            .await?;
        match outcome {
            RpcOutcome::Success(_) => {
                let _guard = self.locks.acquire(topic).await;
                let mut session = self.session(&topic)?;
                session.namespaces = namespaces;
                self.records.set(SESSIONS, &topic.to_hex(), &session)?;
                Ok(())
            }
            RpcOutcome::Failure(body) => {
                Err(SignError::Peer { code: body.code, message: body.message })
            }
        }
    }

    /// Pushes the session expiry out to `new_expiry` (unix seconds), which
    /// must exceed the current expiry and stay within the allowed ceiling.
    pub(crate) async fn extend(&self, topic: Topic, new_expiry: u64) -> Result<(), SignError> {
        {
            let _guard = self.locks.acquire(topic).await;
            let session = self.session(&topic)?;
            if new_expiry <= session.expiry {
                return Err(SignError::invalid_expiry("new expiry must exceed the current one"));
            }
            if new_expiry > now() + self.config.max_session_ttl.as_secs() {
                return Err(SignError::invalid_expiry("new expiry exceeds the maximum session ttl"));
            }
        }
        let body = ExtendParams { expiry: new_expiry };
        let outcome = self
            .dispatcher
            .request(
                topic,
                SignMethod::SessionExtend.as_str(),
                serde_json::to_value(&body).map_err(RpcError::from)?,
                None,
                SignMethod::SessionExtend.request_options(),
                self.config.request_timeout,
            )
            .await?;
        match outcome {
            RpcOutcome::Success(_) => {
                let _guard = self.locks.acquire(topic).await;
                let mut session = self.session(&topic)?;
                session.expiry = new_expiry;
                self.records.set(SESSIONS, &topic.to_hex(), &session)?;
                Ok(())
            }
            RpcOutcome::Failure(body) => {
                Err(SignError::Peer { code: body.code, message: body.message })
            }
        }
    }

    pub(crate) async fn ping_session(&self, topic: Topic) -> Result<(), SignError> {
        self.session(&topic)?;
        let outcome = self
            .dispatcher
            .request(
                topic,
                SignMethod::SessionPing.as_str(),
                json!({}),
                None,
                SignMethod::SessionPing.request_options(),
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

    /// Emits a session event the agreed namespaces authorize.
    pub(crate) async fn emit_event(
        &self,
        topic: Topic,
        name: &str,
        data: Value,
        chain_id: &str,
    ) -> Result<(), SignError> {
        let session = self.session(&topic)?;
        if now() > session.expiry {
            return Err(SignError::SessionExpired);
        }
        let authorized = session.namespaces.values().any(|ns| ns.events.iter().any(|e| e == name));
        if !authorized {
            return Err(SignError::UnauthorizedEvent { name: name.to_owned() });
        }
        let body = EventParams {
            chain_id: chain_id.to_owned(),
            event: EventPayload { name: name.to_owned(), data },
        };
        let outcome = self
            .dispatcher
            .request(
                topic,
                SignMethod::SessionEvent.as_str(),
                serde_json::to_value(&body).map_err(RpcError::from)?,
                None,
                SignMethod::SessionEvent.request_options(),
                self.config.request_timeout,
            )
            .await?;
        match outcome {
            RpcOutcome::Success(_) => Ok(()),
            RpcOutcome::Failure(body) => {
                Err(SignError::Peer { code: body.code, message: body.message })
            }
        }
    }

    /// Ends a session: delete RPC to the peer (best-effort), then local
    /// purge of record, key, and subscription.
    pub(crate) async fn disconnect_session(
        &self,
        topic: Topic,
        reason: &str,
    ) -> Result<(), SignError> {
        self.session(&topic)?;
        let params =
            DeleteParams { code: CODE_USER_DISCONNECTED, message: reason.to_owned() };
        // Farewell outside the topic lock; the peer may be disconnecting at
        // the same moment and its delete handler needs the lock on its side.
        if let Err(err) = self
            .dispatcher
            .request(
                topic,
                SignMethod::SessionDelete.as_str(),
                serde_json::to_value(&params).unwrap_or_default(),
                None,
                SignMethod::SessionDelete.request_options(),
                FAREWELL_WAIT,
            )
            .await
        {
            log::debug!("session delete farewell on {topic}: {err}");
        }
        let _guard = self.locks.acquire(topic).await;
        self.purge_session(&topic).await
    }

    pub(crate) fn sessions(&self) -> Result<Vec<Session>, SignError> {
        let mut sessions: Vec<Session> = self
            .records
            .get_all::<Session>(SESSIONS)?
            .into_iter()
            .map(|(_, session)| session)
            .collect();
        sessions.sort_by_key(|session| session.expiry);
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pairing;

    #[test]
    fn session_record_serde_round_trips() {
        let session = Session {
            topic: Topic::from_bytes([1; 32]),
            relay: RelayProtocol::default(),
            controller: Side::Local,
            self_public: waltz_kms::PublicKey::from_bytes([2; 32]),
            peer_public: waltz_kms::PublicKey::from_bytes([3; 32]),
            peer_metadata: crate::types::Metadata::default(),
            namespaces: SessionNamespaces::new(),
            expiry: 1_700_000_000,
            acknowledged: false,
        };
        let value = serde_json::to_value(&session).expect("serialize");
        let back: Session = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.topic, session.topic);
        assert_eq!(back.controller, Side::Local);
        assert!(!back.acknowledged);
    }

    #[test]
    fn pairing_record_serde_round_trips() {
        let pairing = Pairing {
            topic: Topic::from_bytes([1; 32]),
            relay: RelayProtocol::default(),
            peer_metadata: None,
            expiry: 1_700_000_000,
            active: false,
        };
        let value = serde_json::to_value(&pairing).expect("serialize");
        let back: Pairing = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.topic, pairing.topic);
        assert!(!back.active);
    }
}
