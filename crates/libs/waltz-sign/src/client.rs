use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use waltz_kms::{Kms, SecretStore, Topic};
use waltz_relay::{ConnectionState, RelayClient, RelayTransport};
use waltz_rpc::{Dispatcher, RpcOutcome};
use waltz_storage::{RecordStore, Records};

use crate::config::SignConfig;
use crate::engine::{Engine, PAIRINGS, SESSIONS};
use crate::error::SignError;
use crate::types::{
    Pairing, ProposalNamespaces, Session, SessionNamespaces, SignEvent,
};
use crate::uri::PairingUri;

const EVENT_BUFFER: usize = 64;
const INBOUND_RPC_BUFFER: usize = 64;

/// The protocol client: pairing plus session engines over one relay
/// connection. Construction wires the tasks; [`start`](Self::start)
/// restores persisted state and connects.
///
/// Clones are cheap and share the same engine.
#[derive(Clone)]
pub struct SignClient {
    engine: Arc<Engine>,
}

impl SignClient {
    /// Builds the client and hands back the event stream the host must
    /// consume. Events are delivered once, in per-topic order.
    pub fn new(
        config: SignConfig,
        transport: Arc<dyn RelayTransport>,
        secrets: Arc<dyn SecretStore>,
        store: Arc<dyn RecordStore>,
    ) -> (Self, mpsc::Receiver<SignEvent>) {
        let kms = Kms::new(secrets);
        let records = Records::new(store);
        let (relay, inbound) = RelayClient::new(transport, config.relay.clone());
        let dispatcher = Dispatcher::new(kms.clone(), relay.clone());

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (rpc_tx, mut rpc_rx) = mpsc::channel(INBOUND_RPC_BUFFER);
        let _router = dispatcher.spawn_router(inbound, rpc_tx);

        let engine =
            Arc::new(Engine::new(kms, relay, dispatcher, records, config, event_tx));

        {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                while let Some(rpc) = rpc_rx.recv().await {
                    engine.handle_inbound(rpc).await;
                }
            });
        }
        {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(engine.config.sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    engine.sweep_expired().await;
                }
            });
        }

        (Self { engine }, event_rx)
    }

    /// Resubscribes every persisted pairing and session topic, then
    /// connects. Subscriptions are confirmed before the connection is
    /// reported up, so restored topics miss nothing.
    pub async fn start(&self) -> Result<(), SignError> {
        for (_, pairing) in self.engine.records.get_all::<Pairing>(PAIRINGS)? {
            self.engine.relay.subscribe(pairing.topic).await?;
        }
        for (_, session) in self.engine.records.get_all::<Session>(SESSIONS)? {
            self.engine.relay.subscribe(session.topic).await?;
        }
        self.engine.relay.connect().await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SignError> {
        self.engine.relay.disconnect().await?;
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.engine.relay.state()
    }

    // Pairing surface.

    pub async fn pair(&self, uri: &str) -> Result<Pairing, SignError> {
        let uri: PairingUri = uri.parse()?;
        self.engine.pair(&uri).await
    }

    pub async fn ping_pairing(&self, topic: Topic) -> Result<(), SignError> {
        self.engine.ping_pairing(topic).await
    }

    pub async fn disconnect_pairing(&self, topic: Topic) -> Result<(), SignError> {
        self.engine.disconnect_pairing(topic).await
    }

    pub fn pairings(&self) -> Result<Vec<Pairing>, SignError> {
        self.engine.pairings()
    }

    // Session surface.

    /// Proposes a session; returns a pairing URI when a fresh pairing had
    /// to be minted. Settlement or rejection arrives as an event.
    pub async fn connect(
        &self,
        required_namespaces: ProposalNamespaces,
        pairing_topic: Option<Topic>,
    ) -> Result<Option<PairingUri>, SignError> {
        self.engine.connect(required_namespaces, pairing_topic).await
    }

    pub async fn approve(
        &self,
        proposal_id: u64,
        namespaces: SessionNamespaces,
    ) -> Result<Session, SignError> {
        self.engine.approve(proposal_id, namespaces).await
    }

    pub async fn reject(&self, proposal_id: u64, reason: &str) -> Result<(), SignError> {
        self.engine.reject(proposal_id, reason).await
    }

    pub async fn request(
        &self,
        topic: Topic,
        chain_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, SignError> {
        self.engine.request(topic, chain_id, method, params).await
    }

    /// Answers an inbound [`SignEvent::SessionRequest`] by id.
    pub async fn respond(
        &self,
        topic: Topic,
        id: u64,
        outcome: RpcOutcome,
    ) -> Result<(), SignError> {
        self.engine.respond(topic, id, outcome).await
    }

    pub async fn update(
        &self,
        topic: Topic,
        namespaces: SessionNamespaces,
    ) -> Result<(), SignError> {
        self.engine.update(topic, namespaces).await
    }

    pub async fn extend(&self, topic: Topic, new_expiry: u64) -> Result<(), SignError> {
        self.engine.extend(topic, new_expiry).await
    }

    pub async fn ping(&self, topic: Topic) -> Result<(), SignError> {
        self.engine.ping_session(topic).await
    }

    pub async fn emit(
        &self,
        topic: Topic,
        event: &str,
        data: Value,
        chain_id: &str,
    ) -> Result<(), SignError> {
        self.engine.emit_event(topic, event, data, chain_id).await
    }

    pub async fn disconnect(&self, topic: Topic, reason: &str) -> Result<(), SignError> {
        self.engine.disconnect_session(topic, reason).await
    }

    pub fn sessions(&self) -> Result<Vec<Session>, SignError> {
        self.engine.sessions()
    }
}
