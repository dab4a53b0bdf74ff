//! In-memory relay broker for integration tests.
//!
//! Implements the relay side of the `irn_*` wire protocol over channel-backed
//! connections: subscriptions, publish acks, fan-out to other subscribed
//! connections, and store-and-forward — published messages are retained and
//! handed to late subscribers of their topic, the way the production relay's
//! mailbox does. Knobs exist to sever every connection (reconnection tests),
//! reject connect attempts, and withhold publish acks (timeout tests).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use waltz_kms::Topic;
use waltz_relay::{RelayError, RelayTransport, TransportConn};

struct BrokerConn {
    id: u64,
    to_client: mpsc::Sender<String>,
    topics: HashSet<Topic>,
}

#[derive(Default)]
struct BrokerInner {
    connections: Mutex<Vec<BrokerConn>>,
    retained: Mutex<Vec<(Topic, String)>>,
    next_conn: AtomicU64,
    next_sub: AtomicU64,
    next_frame: AtomicU64,
    drop_publish_acks: AtomicBool,
    reject_connects: AtomicBool,
    subscribe_frames: AtomicU64,
    unsubscribe_frames: AtomicU64,
    publish_frames: AtomicU64,
}

/// Shared in-memory relay. Clone handles freely; all clones address the same
/// broker state.
#[derive(Clone, Default)]
pub struct RelayBroker {
    inner: Arc<BrokerInner>,
}

impl RelayBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Severs every live connection, as a dropped socket would.
    pub fn kill_connections(&self) {
        let mut connections =
            self.inner.connections.lock().expect("broker connections mutex poisoned");
        connections.clear();
    }

    /// When set, `irn_publish` frames are accepted but never acknowledged.
    pub fn set_drop_publish_acks(&self, drop: bool) {
        self.inner.drop_publish_acks.store(drop, Ordering::SeqCst);
    }

    /// When set, new transport connects fail.
    pub fn set_reject_connects(&self, reject: bool) {
        self.inner.reject_connects.store(reject, Ordering::SeqCst);
    }

    pub fn subscribe_frames(&self) -> u64 {
        self.inner.subscribe_frames.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_frames(&self) -> u64 {
        self.inner.unsubscribe_frames.load(Ordering::SeqCst)
    }

    pub fn publish_frames(&self) -> u64 {
        self.inner.publish_frames.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        self.inner.connections.lock().expect("broker connections mutex poisoned").len()
    }

    /// Distinct topics currently subscribed across live connections.
    pub fn subscribed_topics(&self) -> usize {
        let connections =
            self.inner.connections.lock().expect("broker connections mutex poisoned");
        let mut topics = HashSet::new();
        for conn in connections.iter() {
            topics.extend(conn.topics.iter().copied());
        }
        topics.len()
    }

    /// Delivers a raw message to every connection subscribed to `topic`,
    /// bypassing any client. Calling it twice simulates relay re-delivery.
    pub async fn inject(&self, topic: Topic, message: &str) {
        let targets = self.targets(topic, None);
        for target in targets {
            let frame = self.delivery_frame(topic, message);
            let _ = target.send(frame).await;
        }
    }

    fn targets(&self, topic: Topic, exclude: Option<u64>) -> Vec<mpsc::Sender<String>> {
        let connections =
            self.inner.connections.lock().expect("broker connections mutex poisoned");
        connections
            .iter()
            .filter(|conn| Some(conn.id) != exclude && conn.topics.contains(&topic))
            .map(|conn| conn.to_client.clone())
            .collect()
    }

    fn delivery_frame(&self, topic: Topic, message: &str) -> String {
        let id = self.inner.next_frame.fetch_add(1, Ordering::SeqCst) + 1_000_000;
        json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": "irn_subscription",
            "params": {
                "id": format!("sub-{id}"),
                "data": { "topic": topic.to_hex(), "message": message },
            },
        })
        .to_string()
    }

    fn with_conn<R>(&self, conn_id: u64, apply: impl FnOnce(&mut BrokerConn) -> R) -> Option<R> {
        let mut connections =
            self.inner.connections.lock().expect("broker connections mutex poisoned");
        connections.iter_mut().find(|conn| conn.id == conn_id).map(apply)
    }

    async fn serve(self, conn_id: u64, mut from_client: mpsc::Receiver<String>) {
        while let Some(text) = from_client.recv().await {
            // A severed connection must not keep consuming frames: anything
            // the client wrote before noticing the cut is lost, as it would
            // be on a dead socket.
            if self.with_conn(conn_id, |_| ()).is_none() {
                break;
            }
            let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            let Some(id) = frame.get("id").and_then(Value::as_u64) else {
                continue;
            };
            let method = frame.get("method").and_then(Value::as_str);
            let ack = match method {
                Some("irn_subscribe") => {
                    self.inner.subscribe_frames.fetch_add(1, Ordering::SeqCst);
                    let topic = frame
                        .pointer("/params/topic")
                        .and_then(Value::as_str)
                        .and_then(|value| value.parse::<Topic>().ok());
                    let Some(topic) = topic else {
                        continue;
                    };
                    self.with_conn(conn_id, |conn| {
                        conn.topics.insert(topic);
                    });
                    let sub = self.inner.next_sub.fetch_add(1, Ordering::SeqCst) + 1;
                    let ack = json!({ "id": id, "jsonrpc": "2.0", "result": format!("sub-{sub}") });

                    // Mailbox: messages published before this subscription are
                    // delivered right after the ack.
                    let backlog: Vec<String> = {
                        let retained =
                            self.inner.retained.lock().expect("broker retained mutex poisoned");
                        retained
                            .iter()
                            .filter(|(t, _)| *t == topic)
                            .map(|(_, message)| message.clone())
                            .collect()
                    };
                    if !backlog.is_empty() {
                        if let Some(to_client) =
                            self.with_conn(conn_id, |conn| conn.to_client.clone())
                        {
                            let _ = to_client.send(ack.to_string()).await;
                            for message in backlog {
                                let delivery = self.delivery_frame(topic, &message);
                                let _ = to_client.send(delivery).await;
                            }
                        }
                        continue;
                    }
                    Some(ack)
                }
                Some("irn_unsubscribe") => {
                    self.inner.unsubscribe_frames.fetch_add(1, Ordering::SeqCst);
                    let topic = frame
                        .pointer("/params/topic")
                        .and_then(Value::as_str)
                        .and_then(|value| value.parse::<Topic>().ok());
                    if let Some(topic) = topic {
                        self.with_conn(conn_id, |conn| {
                            conn.topics.remove(&topic);
                        });
                    }
                    Some(json!({ "id": id, "jsonrpc": "2.0", "result": true }))
                }
                Some("irn_publish") => {
                    self.inner.publish_frames.fetch_add(1, Ordering::SeqCst);
                    let topic = frame
                        .pointer("/params/topic")
                        .and_then(Value::as_str)
                        .and_then(|value| value.parse::<Topic>().ok());
                    let message = frame
                        .pointer("/params/message")
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned);
                    if let (Some(topic), Some(message)) = (topic, message) {
                        {
                            let mut retained = self
                                .inner
                                .retained
                                .lock()
                                .expect("broker retained mutex poisoned");
                            retained.push((topic, message.clone()));
                        }
                        let targets = self.targets(topic, Some(conn_id));
                        for target in targets {
                            let delivery = self.delivery_frame(topic, &message);
                            let _ = target.send(delivery).await;
                        }
                    }
                    if self.inner.drop_publish_acks.load(Ordering::SeqCst) {
                        None
                    } else {
                        Some(json!({ "id": id, "jsonrpc": "2.0", "result": true }))
                    }
                }
                // Client acks of deliveries and anything else: ignored.
                _ => None,
            };

            if let Some(ack) = ack {
                let Some(to_client) = self.with_conn(conn_id, |conn| conn.to_client.clone())
                else {
                    break;
                };
                if to_client.send(ack.to_string()).await.is_err() {
                    break;
                }
            }
        }
        let mut connections =
            self.inner.connections.lock().expect("broker connections mutex poisoned");
        connections.retain(|conn| conn.id != conn_id);
    }
}

#[async_trait]
impl RelayTransport for RelayBroker {
    async fn connect(&self) -> Result<TransportConn, RelayError> {
        if self.inner.reject_connects.load(Ordering::SeqCst) {
            return Err(RelayError::transport("broker rejecting connects"));
        }
        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
        let (client_tx, from_client) = mpsc::channel(64);
        let (to_client, client_rx) = mpsc::channel(64);

        {
            let mut connections =
                self.inner.connections.lock().expect("broker connections mutex poisoned");
            connections.push(BrokerConn { id: conn_id, to_client, topics: HashSet::new() });
        }
        tokio::spawn(self.clone().serve(conn_id, from_client));

        Ok(TransportConn { outbound: client_tx, inbound: client_rx })
    }
}

/// Convenience topic for tests.
pub fn test_topic(byte: u8) -> Topic {
    Topic::from_bytes([byte; 32])
}
