//! Full-stack scenarios: two clients (a proposing app and an approving
//! wallet) on one in-memory broker, from pairing through settlement,
//! requests, mutation, and teardown.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::sync::mpsc;
use waltz_kms::{InMemorySecretStore, Kms, SymKey, Topic};
use waltz_relay::{RelayClient, RelayConfig};
use waltz_rpc::{Dispatcher, PublishOptions};
use waltz_sign::{
    Metadata, PairingUri, ProposalNamespace, ProposalNamespaces, RelayProtocol, RpcErrorBody,
    RpcOutcome, SessionNamespace, SessionNamespaces, Side, SignClient, SignConfig, SignError,
    SignEvent,
};
use waltz_storage::InMemoryStore;
use waltz_test_support::RelayBroker;

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_secs()
}

fn config(name: &str) -> SignConfig {
    SignConfig {
        metadata: Metadata {
            name: name.to_owned(),
            url: format!("https://{name}.example"),
            ..Metadata::default()
        },
        relay: RelayConfig {
            ack_timeout: Duration::from_millis(500),
            publish_timeout: Duration::from_secs(2),
            backoff_initial: Duration::from_millis(20),
            backoff_max: Duration::from_millis(100),
            ..RelayConfig::default()
        },
        request_timeout: Duration::from_secs(3),
        proposal_window: Duration::from_secs(60),
        session_ttl: Duration::from_secs(24 * 60 * 60),
        // Sweeps stay out of the way unless a test opts in.
        sweep_interval: Duration::from_secs(3_600),
        ..SignConfig::default()
    }
}

async fn client(broker: &RelayBroker, config: SignConfig) -> (SignClient, mpsc::Receiver<SignEvent>) {
    let (client, events) = SignClient::new(
        config,
        Arc::new(broker.clone()),
        Arc::new(InMemorySecretStore::new()),
        Arc::new(InMemoryStore::new()),
    );
    client.start().await.expect("start");
    (client, events)
}

async fn next_event(events: &mut mpsc::Receiver<SignEvent>) -> SignEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

fn required_namespaces() -> ProposalNamespaces {
    let mut namespaces = ProposalNamespaces::new();
    namespaces.insert(
        "eip155".to_owned(),
        ProposalNamespace {
            chains: vec!["eip155:1".to_owned()],
            methods: vec!["eth_sendTransaction".to_owned(), "personal_sign".to_owned()],
            events: vec!["accountsChanged".to_owned()],
        },
    );
    namespaces
}

fn granted_namespaces() -> SessionNamespaces {
    let mut namespaces = SessionNamespaces::new();
    namespaces.insert(
        "eip155".to_owned(),
        SessionNamespace {
            accounts: vec!["eip155:1:0x00a329c0648769a73afac7f9381e08fb43dbea72".to_owned()],
            methods: vec!["eth_sendTransaction".to_owned(), "personal_sign".to_owned()],
            events: vec!["accountsChanged".to_owned()],
        },
    );
    namespaces
}

/// Runs the full pair → propose → approve flow and returns the pairing
/// and session topics.
async fn settle(
    dapp: &SignClient,
    dapp_events: &mut mpsc::Receiver<SignEvent>,
    wallet: &SignClient,
    wallet_events: &mut mpsc::Receiver<SignEvent>,
) -> (Topic, Topic) {
    let uri = dapp
        .connect(required_namespaces(), None)
        .await
        .expect("connect")
        .expect("fresh pairing yields a uri");
    let pairing = wallet.pair(&uri.to_string()).await.expect("pair");

    let proposal = match next_event(wallet_events).await {
        SignEvent::SessionProposal(proposal) => proposal,
        other => panic!("expected proposal, got {other:?}"),
    };
    let session = wallet.approve(proposal.id, granted_namespaces()).await.expect("approve");

    let settled = match next_event(dapp_events).await {
        SignEvent::SessionSettled(settled) => settled,
        other => panic!("expected settlement, got {other:?}"),
    };
    assert_eq!(settled.topic, session.topic);
    (pairing.topic, session.topic)
}

#[tokio::test]
async fn pair_propose_approve_settles_both_sides() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;

    let uri = dapp
        .connect(required_namespaces(), None)
        .await
        .expect("connect")
        .expect("uri");
    let pairing = wallet.pair(&uri.to_string()).await.expect("pair");
    assert!(!pairing.active);

    let proposal = match next_event(&mut wallet_events).await {
        SignEvent::SessionProposal(proposal) => proposal,
        other => panic!("expected proposal, got {other:?}"),
    };
    assert_eq!(proposal.required_namespaces, required_namespaces());
    assert_eq!(proposal.proposer_metadata.name, "dapp");
    assert_eq!(proposal.pairing_topic, pairing.topic);
    // The proposal activates the pairing and records the peer.
    let active = wallet.pairings().expect("pairings").remove(0);
    assert!(active.active);
    assert_eq!(active.peer_metadata.expect("peer metadata").name, "dapp");

    let wallet_session =
        wallet.approve(proposal.id, granted_namespaces()).await.expect("approve");
    assert_eq!(wallet_session.controller, Side::Local);
    assert!(!wallet_session.acknowledged);

    let dapp_session = match next_event(&mut dapp_events).await {
        SignEvent::SessionSettled(session) => session,
        other => panic!("expected settlement, got {other:?}"),
    };
    assert_eq!(dapp_session.topic, wallet_session.topic);
    assert_eq!(dapp_session.controller, Side::Peer);
    assert_eq!(dapp_session.namespaces, granted_namespaces());
    assert_eq!(dapp_session.peer_metadata.name, "wallet");
    assert!(dapp_session.acknowledged);

    // First traffic on the session topic acknowledges the wallet side.
    dapp.ping(dapp_session.topic).await.expect("ping");
    assert!(matches!(next_event(&mut wallet_events).await, SignEvent::Ping { .. }));
    let wallet_session = wallet.sessions().expect("sessions").remove(0);
    assert!(wallet_session.acknowledged);
}

#[tokio::test]
async fn proposal_published_before_pairing_is_delivered_on_pair() {
    let broker = RelayBroker::new();
    let (dapp, _dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;

    let uri = dapp.connect(required_namespaces(), None).await.expect("connect").expect("uri");
    // The proposal sits in the relay mailbox well before the peer scans
    // the uri; pairing must still surface it.
    tokio::time::sleep(Duration::from_millis(300)).await;

    wallet.pair(&uri.to_string()).await.expect("pair");
    match next_event(&mut wallet_events).await {
        SignEvent::SessionProposal(proposal) => {
            assert_eq!(proposal.proposer_metadata.name, "dapp");
        }
        other => panic!("expected proposal, got {other:?}"),
    }
}

#[tokio::test]
async fn reject_propagates_reason_and_creates_no_session() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;

    let uri = dapp.connect(required_namespaces(), None).await.expect("connect").expect("uri");
    wallet.pair(&uri.to_string()).await.expect("pair");
    let proposal = match next_event(&mut wallet_events).await {
        SignEvent::SessionProposal(proposal) => proposal,
        other => panic!("expected proposal, got {other:?}"),
    };

    wallet.reject(proposal.id, "wrong network").await.expect("reject");

    match next_event(&mut dapp_events).await {
        SignEvent::SessionRejected { code, message, .. } => {
            assert_eq!(code, 5000);
            assert_eq!(message, "wrong network");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(dapp.sessions().expect("sessions").is_empty());
    assert!(wallet.sessions().expect("sessions").is_empty());
}

#[tokio::test]
async fn request_resolves_with_wallet_result() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;
    let (_, session_topic) = settle(&dapp, &mut dapp_events, &wallet, &mut wallet_events).await;

    let responder = wallet.clone();
    let handler = tokio::spawn(async move {
        loop {
            match next_event(&mut wallet_events).await {
                SignEvent::SessionRequest { topic, id, chain_id, method, params } => {
                    assert_eq!(chain_id, "eip155:1");
                    assert_eq!(method, "personal_sign");
                    assert_eq!(params, json!(["0x68656c6c6f", "0x00a329c0"]));
                    responder
                        .respond(topic, id, RpcOutcome::Success(json!("0xsigned")))
                        .await
                        .expect("respond");
                    return;
                }
                SignEvent::Ping { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    });

    let result = dapp
        .request(session_topic, "eip155:1", "personal_sign", json!(["0x68656c6c6f", "0x00a329c0"]))
        .await
        .expect("request");
    assert_eq!(result, json!("0xsigned"));
    handler.await.expect("handler");
}

#[tokio::test]
async fn request_error_surfaces_peer_code_and_message() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;
    let (_, session_topic) = settle(&dapp, &mut dapp_events, &wallet, &mut wallet_events).await;

    let responder = wallet.clone();
    tokio::spawn(async move {
        if let SignEvent::SessionRequest { topic, id, .. } = next_event(&mut wallet_events).await
        {
            responder
                .respond(
                    topic,
                    id,
                    RpcOutcome::Failure(RpcErrorBody::new(4001, "user denied")),
                )
                .await
                .expect("respond");
        }
    });

    let err = dapp
        .request(session_topic, "eip155:1", "eth_sendTransaction", json!([{"to": "0x00"}]))
        .await
        .expect_err("denied");
    match err {
        SignError::Peer { code, message } => {
            assert_eq!(code, 4001);
            assert_eq!(message, "user denied");
        }
        other => panic!("expected peer error, got {other}"),
    }
}

#[tokio::test]
async fn session_and_pairing_pings_round_trip() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;
    let (pairing_topic, session_topic) =
        settle(&dapp, &mut dapp_events, &wallet, &mut wallet_events).await;

    dapp.ping(session_topic).await.expect("session ping");
    assert!(matches!(
        next_event(&mut wallet_events).await,
        SignEvent::Ping { topic } if topic == session_topic
    ));

    wallet.ping_pairing(pairing_topic).await.expect("pairing ping");
    assert!(matches!(
        next_event(&mut dapp_events).await,
        SignEvent::Ping { topic } if topic == pairing_topic
    ));
}

#[tokio::test]
async fn update_and_extend_propagate_to_the_peer() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;
    let (_, session_topic) = settle(&dapp, &mut dapp_events, &wallet, &mut wallet_events).await;

    let mut widened = granted_namespaces();
    if let Some(ns) = widened.get_mut("eip155") {
        ns.accounts.push("eip155:137:0x00a329c0648769a73afac7f9381e08fb43dbea72".to_owned());
    }
    wallet.update(session_topic, widened.clone()).await.expect("update");
    match next_event(&mut dapp_events).await {
        SignEvent::SessionUpdated { topic, namespaces } => {
            assert_eq!(topic, session_topic);
            assert_eq!(namespaces, widened);
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert_eq!(dapp.sessions().expect("sessions").remove(0).namespaces, widened);

    // Extend must land strictly beyond the current expiry and under the cap.
    let current = wallet.sessions().expect("sessions").remove(0).expiry;
    let err = wallet.extend(session_topic, current).await.expect_err("not beyond current");
    assert!(matches!(err, SignError::InvalidExpiry { .. }));
    let err = wallet
        .extend(session_topic, unix_now() + 30 * 24 * 60 * 60)
        .await
        .expect_err("beyond the cap");
    assert!(matches!(err, SignError::InvalidExpiry { .. }));

    let extended = unix_now() + 3 * 24 * 60 * 60;
    wallet.extend(session_topic, extended).await.expect("extend");
    match next_event(&mut dapp_events).await {
        SignEvent::SessionExtended { topic, expiry } => {
            assert_eq!(topic, session_topic);
            assert_eq!(expiry, extended);
        }
        other => panic!("expected extension, got {other:?}"),
    }
    assert_eq!(wallet.sessions().expect("sessions").remove(0).expiry, extended);
}

#[tokio::test]
async fn simultaneous_updates_resolve_without_deadlock() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;
    let (_, session_topic) = settle(&dapp, &mut dapp_events, &wallet, &mut wallet_events).await;

    let mut wallet_view = granted_namespaces();
    if let Some(ns) = wallet_view.get_mut("eip155") {
        ns.methods.push("eth_signTypedData".to_owned());
    }
    let mut dapp_view = granted_namespaces();
    if let Some(ns) = dapp_view.get_mut("eip155") {
        ns.events.push("chainChanged".to_owned());
    }

    // Both sides mutate the same session at once. Each must serve the
    // peer's update while its own round-trip is in flight.
    let started = std::time::Instant::now();
    let (from_wallet, from_dapp) = tokio::join!(
        wallet.update(session_topic, wallet_view),
        dapp.update(session_topic, dapp_view),
    );
    from_wallet.expect("wallet update");
    from_dapp.expect("dapp update");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "crossed updates must not stall until the request timeout"
    );
}

#[tokio::test]
async fn unanswered_proposal_surfaces_a_rejection_event() {
    let broker = RelayBroker::new();
    let mut dapp_config = config("dapp");
    dapp_config.proposal_window = Duration::from_millis(500);
    let (dapp, mut dapp_events) = client(&broker, dapp_config).await;

    let uri = dapp.connect(required_namespaces(), None).await.expect("connect").expect("uri");
    assert!(uri.to_string().starts_with("wc:"));

    // Nobody ever pairs; the proposer's host still learns the outcome.
    match next_event(&mut dapp_events).await {
        SignEvent::SessionRejected { code, .. } => assert_eq!(code, 8000),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(dapp.sessions().expect("sessions").is_empty());
}

#[tokio::test]
async fn emit_requires_namespace_authorization() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;
    let (_, session_topic) = settle(&dapp, &mut dapp_events, &wallet, &mut wallet_events).await;

    wallet
        .emit(session_topic, "accountsChanged", json!(["0x00a329c0"]), "eip155:1")
        .await
        .expect("authorized event");
    match next_event(&mut dapp_events).await {
        SignEvent::SessionEvent { name, data, chain_id, .. } => {
            assert_eq!(name, "accountsChanged");
            assert_eq!(data, json!(["0x00a329c0"]));
            assert_eq!(chain_id, "eip155:1");
        }
        other => panic!("expected session event, got {other:?}"),
    }

    let err = wallet
        .emit(session_topic, "chainChanged", json!("eip155:137"), "eip155:1")
        .await
        .expect_err("unauthorized event");
    assert!(matches!(err, SignError::UnauthorizedEvent { .. }));
}

#[tokio::test]
async fn disconnect_tears_down_both_sides() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;
    let (_, session_topic) = settle(&dapp, &mut dapp_events, &wallet, &mut wallet_events).await;

    dapp.disconnect(session_topic, "done with this dapp").await.expect("disconnect");
    assert!(dapp.sessions().expect("sessions").is_empty());

    match next_event(&mut wallet_events).await {
        SignEvent::SessionDeleted { topic, reason } => {
            assert_eq!(topic, session_topic);
            assert_eq!(reason, "done with this dapp");
        }
        other => panic!("expected deletion, got {other:?}"),
    }
    assert!(wallet.sessions().expect("sessions").is_empty());

    // The dead session rejects further requests locally.
    let err = dapp
        .request(session_topic, "eip155:1", "personal_sign", json!([]))
        .await
        .expect_err("session gone");
    assert!(matches!(err, SignError::UnknownSession { .. }));
}

#[tokio::test]
async fn second_session_reuses_the_active_pairing() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let (wallet, mut wallet_events) = client(&broker, config("wallet")).await;
    let (pairing_topic, first_topic) =
        settle(&dapp, &mut dapp_events, &wallet, &mut wallet_events).await;

    let uri = dapp
        .connect(required_namespaces(), Some(pairing_topic))
        .await
        .expect("connect over existing pairing");
    assert!(uri.is_none(), "existing pairing needs no uri");

    let proposal = match next_event(&mut wallet_events).await {
        SignEvent::SessionProposal(proposal) => proposal,
        other => panic!("expected proposal, got {other:?}"),
    };
    assert_eq!(proposal.pairing_topic, pairing_topic);
    let second = wallet.approve(proposal.id, granted_namespaces()).await.expect("approve");
    assert_ne!(second.topic, first_topic, "fresh key agreement per session");

    match next_event(&mut dapp_events).await {
        SignEvent::SessionSettled(settled) => assert_eq!(settled.topic, second.topic),
        other => panic!("expected settlement, got {other:?}"),
    }
    assert_eq!(dapp.sessions().expect("sessions").len(), 2);
    assert_eq!(wallet.sessions().expect("sessions").len(), 2);
}

#[tokio::test]
async fn expired_session_rejects_request_without_network_traffic() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;
    let mut wallet_config = config("wallet");
    // The wallet settles with an immediate expiry; the dapp adopts it.
    wallet_config.session_ttl = Duration::ZERO;
    let (wallet, mut wallet_events) = client(&broker, wallet_config).await;
    let (_, session_topic) = settle(&dapp, &mut dapp_events, &wallet, &mut wallet_events).await;

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let published_before = broker.publish_frames();
    let err = dapp
        .request(session_topic, "eip155:1", "personal_sign", json!([]))
        .await
        .expect_err("expired");
    assert!(matches!(err, SignError::SessionExpired));
    assert_eq!(broker.publish_frames(), published_before, "no network attempt");
}

#[tokio::test]
async fn unknown_method_is_answered_method_not_found() {
    let broker = RelayBroker::new();
    let (wallet, _wallet_events) = client(&broker, config("wallet")).await;

    let key = SymKey::from_bytes([0x5a; 32]);
    let topic = Kms::derive_topic(&key);
    let uri = PairingUri::new(topic, RelayProtocol::default(), key.clone(), unix_now() + 300);
    wallet.pair(&uri.to_string()).await.expect("pair");

    // A bare dispatcher peer speaking a method outside the supported set.
    let kms = Kms::new(Arc::new(InMemorySecretStore::new()));
    kms.set_sym_key(&topic, &key).expect("set key");
    let (relay, inbound) = RelayClient::new(Arc::new(broker.clone()), config("raw").relay);
    let dispatcher = Dispatcher::new(kms, relay.clone());
    let (rpc_tx, _rpc_rx) = mpsc::channel(8);
    let _ = dispatcher.spawn_router(inbound, rpc_tx);
    relay.connect().await.expect("connect");
    relay.subscribe(topic).await.expect("subscribe");

    let outcome = dispatcher
        .request(
            topic,
            "wc_sessionApprove",
            json!({}),
            None,
            PublishOptions { ttl: Duration::from_secs(300), tag: 1199, prompt: false },
            Duration::from_secs(3),
        )
        .await
        .expect("answered");
    match outcome {
        RpcOutcome::Failure(body) => assert_eq!(body.code, -32601),
        other => panic!("expected method-not-found, got {other:?}"),
    }
}

#[tokio::test]
async fn expiry_sweep_deletes_stale_pairings() {
    let broker = RelayBroker::new();
    let mut wallet_config = config("wallet");
    wallet_config.sweep_interval = Duration::from_millis(200);
    let (wallet, mut wallet_events) = client(&broker, wallet_config).await;

    let key = SymKey::from_bytes([0x66; 32]);
    let uri =
        PairingUri::new(Kms::derive_topic(&key), RelayProtocol::default(), key, unix_now() + 1);
    let pairing = wallet.pair(&uri.to_string()).await.expect("pair");

    match next_event(&mut wallet_events).await {
        SignEvent::PairingDeleted { topic } => assert_eq!(topic, pairing.topic),
        other => panic!("expected pairing deletion, got {other:?}"),
    }
    assert!(wallet.pairings().expect("pairings").is_empty());
}

#[tokio::test]
async fn restart_restores_sessions_and_resubscribes() {
    let broker = RelayBroker::new();
    let (dapp, mut dapp_events) = client(&broker, config("dapp")).await;

    let secrets = Arc::new(InMemorySecretStore::new());
    let store = Arc::new(InMemoryStore::new());
    let (wallet, mut wallet_events) = SignClient::new(
        config("wallet"),
        Arc::new(broker.clone()),
        secrets.clone(),
        store.clone(),
    );
    wallet.start().await.expect("start");
    let (_, session_topic) = settle(&dapp, &mut dapp_events, &wallet, &mut wallet_events).await;

    wallet.stop().await.expect("stop");
    drop(wallet);
    drop(wallet_events);

    let (revived, _revived_events) = SignClient::new(
        config("wallet"),
        Arc::new(broker.clone()),
        secrets,
        store,
    );
    revived.start().await.expect("restart");

    let restored = revived.sessions().expect("sessions");
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].topic, session_topic);

    // The revived wallet answers on the restored session topic.
    dapp.ping(session_topic).await.expect("ping after restart");
}
