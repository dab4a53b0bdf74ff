//! Shared engine state and inbound protocol dispatch. Pairing and session
//! operations live in their own modules as further `impl Engine` blocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, OwnedMutexGuard};
use waltz_kms::{Kms, Topic};
use waltz_relay::RelayClient;
use waltz_rpc::{Dispatcher, InboundRpc, PublishOptions, RpcErrorBody, RpcOutcome};
use waltz_storage::Records;

use crate::config::SignConfig;
use crate::error::SignError;
use crate::methods::SignMethod;
use crate::types::{Pairing, Session, SignEvent};
use crate::wire::{
    DeleteParams, EventParams, ExtendParams, SessionRequestParams, UpdateParams,
    CODE_EXPIRED, CODE_INVALID_EXPIRY, CODE_INVALID_PARAMS, CODE_NO_SESSION,
    CODE_UNAUTHORIZED_EVENT,
};

pub(crate) const PAIRINGS: &str = "pairings";
pub(crate) const SESSIONS: &str = "sessions";
pub(crate) const PROPOSALS: &str = "proposals";

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// One async mutex per topic: mutations of the same pairing or session
/// queue behind each other while unrelated topics proceed concurrently.
#[derive(Default)]
pub(crate) struct TopicLocks {
    inner: StdMutex<HashMap<Topic, Arc<tokio::sync::Mutex<()>>>>,
}

impl TopicLocks {
    pub(crate) async fn acquire(&self, topic: Topic) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.inner.lock().expect("topic lock table poisoned");
            // Entries the map alone still references are idle; prune them
            // here so purged topics do not accumulate.
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(table.entry(topic).or_default())
        };
        lock.lock_owned().await
    }

    /// Drops the topic's entry if nothing holds or awaits it. Removing a
    /// still-referenced mutex would let a later `acquire` mint a second
    /// one alongside the live guard, so those entries stay until idle.
    pub(crate) fn release(&self, topic: &Topic) {
        if let Ok(mut table) = self.inner.lock() {
            if let Some(lock) = table.get(topic) {
                if Arc::strong_count(lock) == 1 {
                    table.remove(topic);
                }
            }
        }
    }
}

pub(crate) struct Engine {
    pub(crate) kms: Kms,
    pub(crate) relay: RelayClient,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) records: Records,
    pub(crate) config: SignConfig,
    pub(crate) events: mpsc::Sender<SignEvent>,
    pub(crate) locks: TopicLocks,
}

impl Engine {
    pub(crate) fn new(
        kms: Kms,
        relay: RelayClient,
        dispatcher: Dispatcher,
        records: Records,
        config: SignConfig,
        events: mpsc::Sender<SignEvent>,
    ) -> Self {
        Self { kms, relay, dispatcher, records, config, events, locks: TopicLocks::default() }
    }

    pub(crate) async fn emit(&self, event: SignEvent) {
        // The host dropping its receiver only mutes notifications.
        let _ = self.events.send(event).await;
    }

    pub(crate) fn session(&self, topic: &Topic) -> Result<Session, SignError> {
        self.records
            .get::<Session>(SESSIONS, &topic.to_hex())?
            .ok_or_else(|| SignError::UnknownSession { topic: topic.to_hex() })
    }

    pub(crate) fn pairing(&self, topic: &Topic) -> Result<Pairing, SignError> {
        self.records
            .get::<Pairing>(PAIRINGS, &topic.to_hex())?
            .ok_or_else(|| SignError::UnknownPairing { topic: topic.to_hex() })
    }

    /// Entry point for every deduplicated inbound request off the relay.
    pub(crate) async fn handle_inbound(&self, inbound: InboundRpc) {
        self.note_session_traffic(&inbound.topic);

        let Some(method) = SignMethod::parse(&inbound.method) else {
            log::debug!("unknown method {} on {}", inbound.method, inbound.topic);
            self.answer(
                inbound.topic,
                inbound.id,
                RpcOutcome::Failure(RpcErrorBody::method_not_found(&inbound.method)),
                fallback_response_options(),
            )
            .await;
            return;
        };

        if let Err(err) = self.dispatch(method, inbound).await {
            log::warn!("inbound {} failed: {err}", method.as_str());
        }
    }

    /// Any traffic on a session topic proves the peer holds the agreed key,
    /// so a not-yet-acknowledged responder session flips to acknowledged.
    fn note_session_traffic(&self, topic: &Topic) {
        let Ok(Some(mut session)) = self.records.get::<Session>(SESSIONS, &topic.to_hex())
        else {
            return;
        };
        if !session.acknowledged {
            session.acknowledged = true;
            if let Err(err) = self.records.set(SESSIONS, &topic.to_hex(), &session) {
                log::warn!("failed to persist acknowledgement for {topic}: {err}");
            }
        }
    }

    async fn dispatch(&self, method: SignMethod, inbound: InboundRpc) -> Result<(), SignError> {
        match method {
            SignMethod::SessionPropose => self.on_propose(inbound).await,
            // Settlement travels as the propose response; a standalone
            // settle request is outside the supported set.
            SignMethod::SessionSettle => {
                self.answer(
                    inbound.topic,
                    inbound.id,
                    RpcOutcome::Failure(RpcErrorBody::method_not_found(&inbound.method)),
                    method.response_options(),
                )
                .await;
                Ok(())
            }
            SignMethod::SessionUpdate => self.on_update(inbound).await,
            SignMethod::SessionExtend => self.on_extend(inbound).await,
            SignMethod::SessionRequest => self.on_request(inbound).await,
            SignMethod::SessionEvent => self.on_event(inbound).await,
            SignMethod::SessionDelete => self.on_session_delete(inbound).await,
            SignMethod::SessionPing => self.on_ping(inbound, true).await,
            SignMethod::PairingPing => self.on_ping(inbound, false).await,
            SignMethod::PairingDelete => self.on_pairing_delete(inbound).await,
        }
    }

    async fn on_update(&self, inbound: InboundRpc) -> Result<(), SignError> {
        let options = SignMethod::SessionUpdate.response_options();
        let _guard = self.locks.acquire(inbound.topic).await;
        let mut session = match self.session(&inbound.topic) {
            Ok(session) => session,
            Err(_) => {
                self.answer(inbound.topic, inbound.id, no_session(), options).await;
                return Ok(());
            }
        };
        let params: UpdateParams = match serde_json::from_value(inbound.params) {
            Ok(params) => params,
            Err(err) => {
                self.answer(inbound.topic, inbound.id, invalid_params(&err), options).await;
                return Ok(());
            }
        };
        session.namespaces = params.namespaces.clone();
        self.records.set(SESSIONS, &inbound.topic.to_hex(), &session)?;
        self.answer(inbound.topic, inbound.id, RpcOutcome::Success(true.into()), options).await;
        self.emit(SignEvent::SessionUpdated {
            topic: inbound.topic,
            namespaces: params.namespaces,
        })
        .await;
        Ok(())
    }

    async fn on_extend(&self, inbound: InboundRpc) -> Result<(), SignError> {
        let options = SignMethod::SessionExtend.response_options();
        let _guard = self.locks.acquire(inbound.topic).await;
        let mut session = match self.session(&inbound.topic) {
            Ok(session) => session,
            Err(_) => {
                self.answer(inbound.topic, inbound.id, no_session(), options).await;
                return Ok(());
            }
        };
        let params: ExtendParams = match serde_json::from_value(inbound.params) {
            Ok(params) => params,
            Err(err) => {
                self.answer(inbound.topic, inbound.id, invalid_params(&err), options).await;
                return Ok(());
            }
        };
        let ceiling = now() + self.config.max_session_ttl.as_secs();
        if params.expiry <= session.expiry || params.expiry > ceiling {
            self.answer(
                inbound.topic,
                inbound.id,
                RpcOutcome::Failure(RpcErrorBody::new(
                    CODE_INVALID_EXPIRY,
                    "requested expiry must exceed the current one within the allowed ttl",
                )),
                options,
            )
            .await;
            return Ok(());
        }
        session.expiry = params.expiry;
        self.records.set(SESSIONS, &inbound.topic.to_hex(), &session)?;
        self.answer(inbound.topic, inbound.id, RpcOutcome::Success(true.into()), options).await;
        self.emit(SignEvent::SessionExtended { topic: inbound.topic, expiry: params.expiry })
            .await;
        Ok(())
    }

    async fn on_request(&self, inbound: InboundRpc) -> Result<(), SignError> {
        let options = SignMethod::SessionRequest.response_options();
        let session = match self.session(&inbound.topic) {
            Ok(session) => session,
            Err(_) => {
                self.answer(inbound.topic, inbound.id, no_session(), options).await;
                return Ok(());
            }
        };
        if now() > session.expiry {
            self.answer(
                inbound.topic,
                inbound.id,
                RpcOutcome::Failure(RpcErrorBody::new(CODE_EXPIRED, "session expired")),
                options,
            )
            .await;
            return Ok(());
        }
        let params: SessionRequestParams = match serde_json::from_value(inbound.params) {
            Ok(params) => params,
            Err(err) => {
                self.answer(inbound.topic, inbound.id, invalid_params(&err), options).await;
                return Ok(());
            }
        };
        // The host answers through `respond` with the same request id.
        self.emit(SignEvent::SessionRequest {
            topic: inbound.topic,
            id: inbound.id,
            chain_id: params.chain_id,
            method: params.request.method,
            params: params.request.params,
        })
        .await;
        Ok(())
    }

    async fn on_event(&self, inbound: InboundRpc) -> Result<(), SignError> {
        let options = SignMethod::SessionEvent.response_options();
        let session = match self.session(&inbound.topic) {
            Ok(session) => session,
            Err(_) => {
                self.answer(inbound.topic, inbound.id, no_session(), options).await;
                return Ok(());
            }
        };
        let params: EventParams = match serde_json::from_value(inbound.params) {
            Ok(params) => params,
            Err(err) => {
                self.answer(inbound.topic, inbound.id, invalid_params(&err), options).await;
                return Ok(());
            }
        };
        let authorized =
            session.namespaces.values().any(|ns| ns.events.iter().any(|e| *e == params.event.name));
        if !authorized {
            self.answer(
                inbound.topic,
                inbound.id,
                RpcOutcome::Failure(RpcErrorBody::new(
                    CODE_UNAUTHORIZED_EVENT,
                    format!("event {} not in session namespaces", params.event.name),
                )),
                options,
            )
            .await;
            return Ok(());
        }
        self.answer(inbound.topic, inbound.id, RpcOutcome::Success(true.into()), options).await;
        self.emit(SignEvent::SessionEvent {
            topic: inbound.topic,
            name: params.event.name,
            data: params.event.data,
            chain_id: params.chain_id,
        })
        .await;
        Ok(())
    }

    async fn on_session_delete(&self, inbound: InboundRpc) -> Result<(), SignError> {
        let options = SignMethod::SessionDelete.response_options();
        let _guard = self.locks.acquire(inbound.topic).await;
        if self.session(&inbound.topic).is_err() {
            self.answer(inbound.topic, inbound.id, no_session(), options).await;
            return Ok(());
        }
        let params: DeleteParams = serde_json::from_value(inbound.params).unwrap_or(DeleteParams {
            code: CODE_NO_SESSION,
            message: "deleted".to_owned(),
        });
        // Acknowledge while the topic key still exists, then tear down.
        self.answer(inbound.topic, inbound.id, RpcOutcome::Success(true.into()), options).await;
        self.purge_session(&inbound.topic).await?;
        self.emit(SignEvent::SessionDeleted { topic: inbound.topic, reason: params.message })
            .await;
        Ok(())
    }

    async fn on_pairing_delete(&self, inbound: InboundRpc) -> Result<(), SignError> {
        let options = SignMethod::PairingDelete.response_options();
        let _guard = self.locks.acquire(inbound.topic).await;
        if self.pairing(&inbound.topic).is_err() {
            self.answer(inbound.topic, inbound.id, no_session(), options).await;
            return Ok(());
        }
        self.answer(inbound.topic, inbound.id, RpcOutcome::Success(true.into()), options).await;
        self.purge_pairing(&inbound.topic).await?;
        self.emit(SignEvent::PairingDeleted { topic: inbound.topic }).await;
        Ok(())
    }

    async fn on_ping(&self, inbound: InboundRpc, session_level: bool) -> Result<(), SignError> {
        let (known, options) = if session_level {
            (self.session(&inbound.topic).is_ok(), SignMethod::SessionPing.response_options())
        } else {
            (self.pairing(&inbound.topic).is_ok(), SignMethod::PairingPing.response_options())
        };
        if !known {
            self.answer(inbound.topic, inbound.id, no_session(), options).await;
            return Ok(());
        }
        self.answer(inbound.topic, inbound.id, RpcOutcome::Success(true.into()), options).await;
        self.emit(SignEvent::Ping { topic: inbound.topic }).await;
        Ok(())
    }

    /// Best-effort response publish; failures are logged, never escalated,
    /// so one bad answer cannot take down the inbound loop.
    pub(crate) async fn answer(
        &self,
        topic: Topic,
        id: u64,
        outcome: RpcOutcome,
        options: PublishOptions,
    ) {
        if let Err(err) = self.dispatcher.respond(topic, id, outcome, None, options).await {
            log::warn!("response for {id} on {topic} failed: {err}");
        }
    }

    /// Removes the session record, its keys, its subscription, and its lock.
    pub(crate) async fn purge_session(&self, topic: &Topic) -> Result<(), SignError> {
        if let Ok(session) = self.session(topic) {
            if let Err(err) = self.kms.delete_key_pair(&session.self_public) {
                log::debug!("session key pair cleanup for {topic}: {err}");
            }
        }
        self.records.delete(SESSIONS, &topic.to_hex())?;
        self.kms.delete_sym_key(topic)?;
        if let Err(err) = self.relay.unsubscribe(*topic).await {
            log::debug!("unsubscribe during session purge of {topic}: {err}");
        }
        self.locks.release(topic);
        Ok(())
    }

    pub(crate) async fn purge_pairing(&self, topic: &Topic) -> Result<(), SignError> {
        self.records.delete(PAIRINGS, &topic.to_hex())?;
        self.kms.delete_sym_key(topic)?;
        if let Err(err) = self.relay.unsubscribe(*topic).await {
            log::debug!("unsubscribe during pairing purge of {topic}: {err}");
        }
        self.locks.release(topic);
        Ok(())
    }

    /// One pass of the expiry sweep over pairings, sessions, and pending
    /// proposals.
    pub(crate) async fn sweep_expired(&self) {
        let cutoff = now();

        let pairings = self.records.get_all::<Pairing>(PAIRINGS).unwrap_or_default();
        for (_, pairing) in pairings {
            if cutoff > pairing.expiry {
                log::info!("pairing {} expired", pairing.topic);
                if let Err(err) = self.purge_pairing(&pairing.topic).await {
                    log::warn!("expired pairing cleanup failed: {err}");
                }
                self.emit(SignEvent::PairingDeleted { topic: pairing.topic }).await;
            }
        }

        let sessions = self.records.get_all::<Session>(SESSIONS).unwrap_or_default();
        for (_, session) in sessions {
            if cutoff > session.expiry {
                log::info!("session {} expired", session.topic);
                if let Err(err) = self.purge_session(&session.topic).await {
                    log::warn!("expired session cleanup failed: {err}");
                }
                self.emit(SignEvent::SessionDeleted {
                    topic: session.topic,
                    reason: "session expired".to_owned(),
                })
                .await;
            }
        }

        let proposals =
            self.records.get_all::<crate::types::Proposal>(PROPOSALS).unwrap_or_default();
        for (id, proposal) in proposals {
            if cutoff > proposal.expiry {
                log::info!("proposal {} expired, auto-rejecting", proposal.id);
                // Peer is notified only when still reachable; the record
                // goes either way.
                self.answer(
                    proposal.pairing_topic,
                    proposal.id,
                    RpcOutcome::Failure(RpcErrorBody::new(CODE_EXPIRED, "proposal expired")),
                    SignMethod::SessionPropose.response_options(),
                )
                .await;
                if let Err(err) = self.records.delete(PROPOSALS, &id) {
                    log::warn!("expired proposal cleanup failed: {err}");
                }
            }
        }
    }
}

fn no_session() -> RpcOutcome {
    RpcOutcome::Failure(RpcErrorBody::new(CODE_NO_SESSION, "no matching session for topic"))
}

fn invalid_params(err: &serde_json::Error) -> RpcOutcome {
    RpcOutcome::Failure(RpcErrorBody::new(CODE_INVALID_PARAMS, format!("invalid params: {err}")))
}

/// Responses to methods outside the supported set have no method-derived
/// tag; a neutral one with a short retention is used.
fn fallback_response_options() -> PublishOptions {
    PublishOptions { ttl: Duration::from_secs(300), tag: 0, prompt: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_keeps_a_held_topic_lock() {
        let locks = TopicLocks::default();
        let topic = Topic::from_bytes([9; 32]);
        let guard = locks.acquire(topic).await;
        locks.release(&topic);

        // The live guard must still be the only holder: a second acquire
        // has to wait instead of getting a fresh mutex.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire(topic)).await;
        assert!(blocked.is_err(), "lock must still be held across release");

        drop(guard);
        tokio::time::timeout(Duration::from_millis(200), locks.acquire(topic))
            .await
            .expect("lock is free once the guard drops");
    }
}
