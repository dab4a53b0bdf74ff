use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use waltz_kms::Topic;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::transport::RelayTransport;
use crate::wire::{
    ack_frame, parse_frame, publish_frame, subscribe_frame, unsubscribe_frame, InboundFrame,
    PublishParams,
};

/// Server-assigned subscription handle. Invalid after unsubscribe or
/// connection loss; reconnection establishes fresh ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionId(pub String);

/// One delivery from a subscribed topic, still envelope-encoded.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub topic: Topic,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

enum Msg {
    Connect { reply: oneshot::Sender<Result<(), RelayError>> },
    Disconnect { reply: oneshot::Sender<()> },
    Subscribe { topic: Topic, reply: oneshot::Sender<Result<SubscriptionId, RelayError>> },
    Unsubscribe { topic: Topic, reply: oneshot::Sender<Result<(), RelayError>> },
    Publish { params: PublishParams, reply: oneshot::Sender<Result<(), RelayError>> },
    Frame { generation: u64, text: String },
    Closed { generation: u64 },
    Retry,
    EstablishTimeout { generation: u64 },
}

enum Waiter {
    /// One wire frame may satisfy several callers: subscribes issued while
    /// the first ack is outstanding attach here instead of re-sending.
    Subscribe {
        topic: Topic,
        replies: Vec<oneshot::Sender<Result<SubscriptionId, RelayError>>>,
    },
    Unsubscribe { reply: oneshot::Sender<Result<(), RelayError>> },
    Publish { params: PublishParams, reply: Option<oneshot::Sender<Result<(), RelayError>>> },
}

struct Queued {
    id: u64,
    params: PublishParams,
    reply: Option<oneshot::Sender<Result<(), RelayError>>>,
}

enum Phase {
    Disconnected,
    /// Connection is up but previously subscribed topics are not yet
    /// confirmed; deliveries seen meanwhile are held back.
    Resubscribing { pending_subs: HashMap<u64, Topic>, held_back: Vec<InboundMessage> },
    Connected,
}

/// Handle to the relay actor. Cheap to clone; all operations are routed
/// through one task that owns the connection.
#[derive(Clone)]
pub struct RelayClient {
    tx: mpsc::Sender<Msg>,
    state_rx: watch::Receiver<ConnectionState>,
    config: Arc<RelayConfig>,
}

impl fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayClient").field("state", &self.state()).finish()
    }
}

impl RelayClient {
    /// Spawns the client actor. The returned receiver is the single inbound
    /// message stream for all subscriptions, restartable across reconnects.
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        config: RelayConfig,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = Actor {
            transport,
            config: config.clone(),
            rx,
            self_tx: tx.downgrade(),
            inbound_tx,
            state_tx,
            phase: Phase::Disconnected,
            want_connected: false,
            generation: 0,
            next_frame_id: 1,
            backoff: config.backoff_initial,
            subscriptions: HashMap::new(),
            pending: HashMap::new(),
            queue: VecDeque::new(),
            connect_waiters: Vec::new(),
            conn_tx: None,
        };
        tokio::spawn(actor.run());

        (Self { tx, state_rx, config: Arc::new(config) }, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state transitions (reported as connected only after
    /// every tracked topic has been resubscribed). Only changes after the
    /// handout are observed; the value at handout counts as seen.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        let mut state_rx = self.state_rx.clone();
        state_rx.mark_unchanged();
        state_rx
    }

    /// Connects, resolving once the connection is established and all
    /// previously tracked topics are resubscribed.
    pub async fn connect(&self) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Connect { reply }).await?;
        rx.await.map_err(|_| RelayError::ClientStopped)?
    }

    pub async fn disconnect(&self) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Disconnect { reply }).await?;
        rx.await.map_err(|_| RelayError::ClientStopped)
    }

    /// Subscribes to a topic. Idempotent: a second subscribe for an already
    /// subscribed topic returns the existing id without a wire message.
    pub async fn subscribe(&self, topic: Topic) -> Result<SubscriptionId, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Subscribe { topic, reply }).await?;
        let ack = tokio::time::timeout(self.config.ack_timeout, rx)
            .await
            .map_err(|_| RelayError::transport("subscribe not acknowledged"))?;
        ack.map_err(|_| RelayError::ClientStopped)?
    }

    /// No-op when the topic is not subscribed.
    pub async fn unsubscribe(&self, topic: Topic) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Unsubscribe { topic, reply }).await?;
        let ack = tokio::time::timeout(self.config.ack_timeout, rx)
            .await
            .map_err(|_| RelayError::transport("unsubscribe not acknowledged"))?;
        ack.map_err(|_| RelayError::ClientStopped)?
    }

    /// Publishes a message; resolves only on server acknowledgment. While
    /// disconnected the publish waits in the bounded offline queue and is
    /// flushed on reconnect with the same frame id.
    pub async fn publish(&self, params: PublishParams) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Msg::Publish { params, reply }).await?;
        let ack = tokio::time::timeout(self.config.publish_timeout, rx)
            .await
            .map_err(|_| RelayError::PublishTimeout)?;
        ack.map_err(|_| RelayError::ClientStopped)?
    }

    async fn send(&self, msg: Msg) -> Result<(), RelayError> {
        self.tx.send(msg).await.map_err(|_| RelayError::ClientStopped)
    }
}

struct Actor {
    transport: Arc<dyn RelayTransport>,
    config: RelayConfig,
    rx: mpsc::Receiver<Msg>,
    self_tx: mpsc::WeakSender<Msg>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    state_tx: watch::Sender<ConnectionState>,
    phase: Phase,
    want_connected: bool,
    generation: u64,
    next_frame_id: u64,
    backoff: Duration,
    subscriptions: HashMap<Topic, Option<SubscriptionId>>,
    pending: HashMap<u64, Waiter>,
    queue: VecDeque<Queued>,
    connect_waiters: Vec<oneshot::Sender<Result<(), RelayError>>>,
    conn_tx: Option<mpsc::Sender<String>>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                Msg::Connect { reply } => self.on_connect(reply).await,
                Msg::Disconnect { reply } => {
                    self.on_disconnect();
                    let _ = reply.send(());
                }
                Msg::Subscribe { topic, reply } => self.on_subscribe(topic, reply).await,
                Msg::Unsubscribe { topic, reply } => self.on_unsubscribe(topic, reply).await,
                Msg::Publish { params, reply } => self.on_publish(params, reply).await,
                Msg::Frame { generation, text } => self.on_frame(generation, text).await,
                Msg::Closed { generation } => self.on_closed(generation).await,
                Msg::Retry => {
                    if self.want_connected && matches!(self.phase, Phase::Disconnected) {
                        self.attempt_connect().await;
                    }
                }
                Msg::EstablishTimeout { generation } => {
                    if generation == self.generation
                        && matches!(self.phase, Phase::Resubscribing { .. })
                    {
                        log::warn!("relay: resubscription not acknowledged, reconnecting");
                        self.teardown_connection();
                        self.schedule_retry();
                    }
                }
            }
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        id
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    async fn on_connect(&mut self, reply: oneshot::Sender<Result<(), RelayError>>) {
        self.want_connected = true;
        match self.phase {
            Phase::Connected => {
                let _ = reply.send(Ok(()));
            }
            Phase::Resubscribing { .. } => self.connect_waiters.push(reply),
            Phase::Disconnected => {
                self.connect_waiters.push(reply);
                self.attempt_connect().await;
            }
        }
    }

    fn on_disconnect(&mut self) {
        self.want_connected = false;
        self.teardown_connection();
        self.backoff = self.config.backoff_initial;
    }

    async fn on_subscribe(
        &mut self,
        topic: Topic,
        reply: oneshot::Sender<Result<SubscriptionId, RelayError>>,
    ) {
        if let Some(Some(existing)) = self.subscriptions.get(&topic) {
            let _ = reply.send(Ok(existing.clone()));
            return;
        }
        if self.conn_tx.is_some() {
            if let Phase::Resubscribing { pending_subs, .. } = &self.phase {
                if pending_subs.values().any(|pending| *pending == topic) {
                    let _ = reply.send(Ok(SubscriptionId(format!("pending-{}", topic.to_hex()))));
                    return;
                }
            }
            for waiter in self.pending.values_mut() {
                if let Waiter::Subscribe { topic: in_flight, replies } = waiter {
                    if *in_flight == topic {
                        replies.push(reply);
                        return;
                    }
                }
            }
            self.subscriptions.insert(topic, None);
            let id = self.alloc_id();
            self.pending.insert(id, Waiter::Subscribe { topic, replies: vec![reply] });
            self.send_frame(subscribe_frame(id, &topic)).await;
        } else {
            self.subscriptions.insert(topic, None);
            // Tracked in the resubscription set; the wire subscribe happens
            // on (re)connect.
            let _ = reply.send(Ok(SubscriptionId(format!("pending-{}", topic.to_hex()))));
        }
    }

    async fn on_unsubscribe(
        &mut self,
        topic: Topic,
        reply: oneshot::Sender<Result<(), RelayError>>,
    ) {
        match self.subscriptions.remove(&topic) {
            Some(Some(subscription)) if self.conn_tx.is_some() => {
                let id = self.alloc_id();
                self.pending.insert(id, Waiter::Unsubscribe { reply });
                self.send_frame(unsubscribe_frame(id, &topic, &subscription.0)).await;
            }
            _ => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn on_publish(
        &mut self,
        params: PublishParams,
        reply: oneshot::Sender<Result<(), RelayError>>,
    ) {
        let id = self.alloc_id();
        if matches!(self.phase, Phase::Connected) && self.conn_tx.is_some() {
            let frame = publish_frame(id, &params);
            self.pending.insert(id, Waiter::Publish { params, reply: Some(reply) });
            self.send_frame(frame).await;
        } else {
            self.enqueue(Queued { id, params, reply: Some(reply) });
        }
    }

    fn enqueue(&mut self, entry: Queued) {
        if self.queue.len() >= self.config.publish_queue_depth {
            if let Some(dropped) = self.queue.pop_front() {
                log::warn!("relay: publish queue overflow, dropping oldest entry");
                if let Some(reply) = dropped.reply {
                    let _ = reply.send(Err(RelayError::Backpressure));
                }
            }
        }
        self.queue.push_back(entry);
    }

    async fn attempt_connect(&mut self) {
        self.set_state(ConnectionState::Connecting);
        match self.transport.connect().await {
            Err(err) => {
                log::warn!("relay: connect failed: {err}");
                self.set_state(ConnectionState::Disconnected);
                self.schedule_retry();
            }
            Ok(mut conn) => {
                self.generation += 1;
                let generation = self.generation;
                self.conn_tx = Some(conn.outbound.clone());

                if let Some(tx) = self.self_tx.upgrade() {
                    tokio::spawn(async move {
                        while let Some(text) = conn.inbound.recv().await {
                            if tx.send(Msg::Frame { generation, text }).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(Msg::Closed { generation }).await;
                    });
                }

                let topics: Vec<Topic> = self.subscriptions.keys().copied().collect();
                if topics.is_empty() {
                    self.finish_establish().await;
                    return;
                }

                let mut pending_subs = HashMap::new();
                let mut frames = Vec::with_capacity(topics.len());
                for topic in topics {
                    let id = self.alloc_id();
                    pending_subs.insert(id, topic);
                    frames.push(subscribe_frame(id, &topic));
                }
                self.phase = Phase::Resubscribing { pending_subs, held_back: Vec::new() };
                for frame in frames {
                    self.send_frame(frame).await;
                }

                if let Some(tx) = self.self_tx.upgrade() {
                    let window = self.config.ack_timeout;
                    tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        let _ = tx.send(Msg::EstablishTimeout { generation }).await;
                    });
                }
            }
        }
    }

    /// Resubscription complete: report connected, release held-back
    /// deliveries, then flush queued publishes in submission order.
    async fn finish_establish(&mut self) {
        let held_back = match std::mem::replace(&mut self.phase, Phase::Connected) {
            Phase::Resubscribing { held_back, .. } => held_back,
            _ => Vec::new(),
        };
        self.backoff = self.config.backoff_initial;
        self.set_state(ConnectionState::Connected);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        for message in held_back {
            let _ = self.inbound_tx.send(message).await;
        }
        while matches!(self.phase, Phase::Connected) && self.conn_tx.is_some() {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            let frame = publish_frame(entry.id, &entry.params);
            self.pending
                .insert(entry.id, Waiter::Publish { params: entry.params, reply: entry.reply });
            // A failed send tears the connection down and requeues pending
            // publishes; the loop condition then stops the flush.
            self.send_frame(frame).await;
        }
    }

    async fn on_frame(&mut self, generation: u64, text: String) {
        if generation != self.generation {
            return;
        }
        let frame = match parse_frame(&text) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("relay: dropping bad frame: {err}");
                return;
            }
        };
        match frame {
            InboundFrame::Delivery { id, topic, message } => {
                self.send_frame(ack_frame(id)).await;
                if !self.subscriptions.contains_key(&topic) {
                    log::debug!("relay: delivery for unsubscribed topic {topic}");
                    return;
                }
                let inbound = InboundMessage { topic, message };
                if let Phase::Resubscribing { held_back, .. } = &mut self.phase {
                    held_back.push(inbound);
                } else {
                    let _ = self.inbound_tx.send(inbound).await;
                }
            }
            InboundFrame::Ack { id, result } => {
                if let Phase::Resubscribing { pending_subs, .. } = &mut self.phase {
                    if let Some(topic) = pending_subs.remove(&id) {
                        let subscription = result
                            .as_str()
                            .map(|value| SubscriptionId(value.to_owned()))
                            .unwrap_or_else(|| SubscriptionId(format!("sub-{id}")));
                        self.subscriptions.insert(topic, Some(subscription));
                        if pending_subs.is_empty() {
                            self.finish_establish().await;
                        }
                        return;
                    }
                }
                self.complete_pending(id, Ok(result));
            }
            InboundFrame::Failure { id, reason } => {
                if let Phase::Resubscribing { pending_subs, .. } = &mut self.phase {
                    if let Some(topic) = pending_subs.remove(&id) {
                        log::warn!("relay: resubscribe of {topic} rejected: {reason}");
                        if pending_subs.is_empty() {
                            self.finish_establish().await;
                        }
                        return;
                    }
                }
                self.complete_pending(id, Err(RelayError::protocol(reason)));
            }
        }
    }

    fn complete_pending(&mut self, id: u64, outcome: Result<serde_json::Value, RelayError>) {
        let Some(waiter) = self.pending.remove(&id) else {
            log::debug!("relay: ack for unknown frame {id}");
            return;
        };
        match waiter {
            Waiter::Subscribe { topic, replies } => match outcome {
                Ok(result) => {
                    let subscription = result
                        .as_str()
                        .map(|value| SubscriptionId(value.to_owned()))
                        .unwrap_or_else(|| SubscriptionId(format!("sub-{id}")));
                    self.subscriptions.insert(topic, Some(subscription.clone()));
                    for reply in replies {
                        let _ = reply.send(Ok(subscription.clone()));
                    }
                }
                Err(err) => {
                    self.subscriptions.remove(&topic);
                    for reply in replies {
                        let _ = reply.send(Err(err.clone()));
                    }
                }
            },
            Waiter::Unsubscribe { reply } => {
                let _ = reply.send(outcome.map(|_| ()));
            }
            Waiter::Publish { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(outcome.map(|_| ()));
                }
            }
        }
    }

    async fn on_closed(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        log::debug!("relay: connection closed");
        self.teardown_connection();
        if self.want_connected {
            self.schedule_retry();
        }
    }

    /// Drops the connection, invalidates subscription ids, and requeues
    /// unacknowledged publishes (same frame id, so the retry after reconnect
    /// is idempotent at the relay).
    fn teardown_connection(&mut self) {
        self.conn_tx = None;
        self.generation += 1;
        self.phase = Phase::Disconnected;
        self.set_state(ConnectionState::Disconnected);
        for subscription in self.subscriptions.values_mut() {
            *subscription = None;
        }

        let mut unacked: Vec<(u64, PublishParams, Option<oneshot::Sender<Result<(), RelayError>>>)> =
            Vec::new();
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        for id in ids {
            match self.pending.remove(&id) {
                Some(Waiter::Publish { params, reply }) => unacked.push((id, params, reply)),
                Some(Waiter::Subscribe { topic, replies }) => {
                    // Topic stays in the resubscription set; confirmed on
                    // reconnect.
                    for reply in replies {
                        let _ =
                            reply.send(Ok(SubscriptionId(format!("pending-{}", topic.to_hex()))));
                    }
                }
                Some(Waiter::Unsubscribe { reply }) => {
                    let _ = reply.send(Ok(()));
                }
                None => {}
            }
        }
        unacked.sort_by_key(|(id, _, _)| *id);
        for (id, params, reply) in unacked.into_iter().rev() {
            self.queue.push_front(Queued { id, params, reply });
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.config.backoff_max);
        if let Some(tx) = self.self_tx.upgrade() {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Msg::Retry).await;
            });
        }
    }

    async fn send_frame(&mut self, frame: String) {
        let Some(tx) = self.conn_tx.clone() else {
            return;
        };
        if tx.send(frame).await.is_err() {
            let generation = self.generation;
            self.on_closed_inline(generation);
        }
    }

    fn on_closed_inline(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        self.teardown_connection();
        if self.want_connected {
            self.schedule_retry();
        }
    }
}
