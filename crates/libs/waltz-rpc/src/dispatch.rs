use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use waltz_kms::{Envelope, Kms, KmsError, PublicKey, Topic};
use waltz_relay::{InboundMessage, PublishParams, RelayClient};

use crate::body::{generate_id, RpcOutcome, RpcRequest, RpcResponse};
use crate::error::RpcError;
use crate::seen::SeenCache;

/// Re-delivery window the dedup cache covers.
const DEDUP_WINDOW: Duration = Duration::from_secs(300);
const DEDUP_CAP: usize = 256;

/// Per-publish relay metadata. The caller owns these because tag and TTL
/// are properties of the protocol method being carried, not of the wire.
#[derive(Clone, Copy, Debug)]
pub struct PublishOptions {
    pub ttl: Duration,
    pub tag: u32,
    pub prompt: bool,
}

/// A decoded, deduplicated inbound request, ready for protocol handling.
#[derive(Clone, Debug)]
pub struct InboundRpc {
    pub topic: Topic,
    pub id: u64,
    pub method: String,
    pub params: Value,
    /// Present when the envelope was type 1 (carries the sender's key).
    pub sender: Option<PublicKey>,
}

struct Inner {
    kms: Kms,
    relay: RelayClient,
    pending: Mutex<HashMap<u64, oneshot::Sender<RpcOutcome>>>,
    seen: Mutex<SeenCache>,
}

/// Correlates outbound requests with their responses over sealed relay
/// topics. One router task decodes every delivery, so responses resolve
/// in arrival order and dedup decisions are serialized.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(kms: Kms, relay: RelayClient) -> Self {
        Self {
            inner: Arc::new(Inner {
                kms,
                relay,
                pending: Mutex::new(HashMap::new()),
                seen: Mutex::new(SeenCache::new(DEDUP_WINDOW, DEDUP_CAP)),
            }),
        }
    }

    /// Starts the router over the relay's inbound stream. Decoded requests
    /// flow to `requests`; responses complete their pending waiters
    /// internally. Ends when the relay client stops.
    pub fn spawn_router(
        &self,
        inbound: mpsc::Receiver<InboundMessage>,
        requests: mpsc::Sender<InboundRpc>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(route(inner, inbound, requests))
    }

    /// Sends a request on `topic` and waits up to `wait` for the peer's
    /// response. A peer error response is `Ok(RpcOutcome::Failure)`; `Err`
    /// is reserved for wire, crypto, and timeout failures. Dropping the
    /// returned future cancels the correlation slot, so a late response
    /// is discarded instead of completing a stale waiter.
    pub async fn request(
        &self,
        topic: Topic,
        method: &str,
        params: Value,
        sender: Option<PublicKey>,
        options: PublishOptions,
        wait: Duration,
    ) -> Result<RpcOutcome, RpcError> {
        let id = generate_id();
        let sealed = self.seal(&topic, &RpcRequest::new(id, method, params), sender)?;

        // Registered before the publish so a fast peer cannot respond
        // into a gap.
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(id, tx);
        let _guard = PendingGuard { inner: &self.inner, id };

        self.inner.relay.publish(publish_params(topic, sealed, options)).await?;

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(RpcError::DispatcherStopped),
            Err(_) => Err(RpcError::RequestTimeout),
        }
    }

    /// Publishes a response body for a previously received request id.
    pub async fn respond(
        &self,
        topic: Topic,
        id: u64,
        outcome: RpcOutcome,
        sender: Option<PublicKey>,
        options: PublishOptions,
    ) -> Result<(), RpcError> {
        let body = match outcome {
            RpcOutcome::Success(result) => RpcResponse::success(id, result),
            RpcOutcome::Failure(error) => RpcResponse::failure(id, error),
        };
        let sealed = self.seal(&topic, &body, sender)?;
        self.inner.relay.publish(publish_params(topic, sealed, options)).await?;
        Ok(())
    }

    fn seal<T: serde::Serialize>(
        &self,
        topic: &Topic,
        body: &T,
        sender: Option<PublicKey>,
    ) -> Result<String, RpcError> {
        let payload = serde_json::to_vec(body)?;
        let key = self.inner.kms.sym_key(topic)?;
        Ok(Envelope::seal(&payload, &key, sender)?.to_base64())
    }
}

/// Removes the pending entry when the request future completes or is
/// dropped; removal after a successful response is a no-op because the
/// router already took the slot.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

fn publish_params(topic: Topic, message: String, options: PublishOptions) -> PublishParams {
    PublishParams {
        topic,
        message,
        ttl_secs: options.ttl.as_secs(),
        tag: options.tag,
        prompt: options.prompt,
    }
}

async fn route(
    inner: Arc<Inner>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    requests: mpsc::Sender<InboundRpc>,
) {
    while let Some(delivery) = inbound.recv().await {
        let topic = delivery.topic;
        match route_one(&inner, &requests, delivery).await {
            Ok(()) => {}
            Err(RpcError::Kms(KmsError::KeyNotFound { .. })) => {
                // A delivery with no local key means the subscription
                // outlived its keys; drop it so the relay stops sending.
                log::warn!("no key for topic {topic}, unsubscribing");
                if let Err(err) = inner.relay.unsubscribe(topic).await {
                    log::debug!("orphan unsubscribe for {topic} failed: {err}");
                }
            }
            Err(err) => {
                log::warn!("dropping inbound message on {topic}: {err}");
            }
        }
    }
}

async fn route_one(
    inner: &Inner,
    requests: &mpsc::Sender<InboundRpc>,
    delivery: InboundMessage,
) -> Result<(), RpcError> {
    let key = inner.kms.sym_key(&delivery.topic)?;
    let opened = Envelope::from_base64(&delivery.message)?.open(&key)?;
    let value: Value = serde_json::from_slice(&opened.payload)?;

    if value.get("method").is_some() {
        let request: RpcRequest = serde_json::from_value(value)?;
        let fresh = inner
            .seen
            .lock()
            .expect("seen mutex poisoned")
            .observe(delivery.topic, request.id);
        if !fresh {
            log::debug!("duplicate request {} on {}", request.id, delivery.topic);
            return Ok(());
        }
        let inbound = InboundRpc {
            topic: delivery.topic,
            id: request.id,
            method: request.method,
            params: request.params,
            sender: opened.sender,
        };
        if requests.send(inbound).await.is_err() {
            log::debug!("request consumer gone, dropping {}", delivery.topic);
        }
        return Ok(());
    }

    let response: RpcResponse = serde_json::from_value(value)?;
    let outcome = match (response.result, response.error) {
        (Some(result), _) => RpcOutcome::Success(result),
        (None, Some(error)) => RpcOutcome::Failure(error),
        (None, None) => {
            return Err(RpcError::Serialization {
                reason: "response carries neither result nor error".into(),
            })
        }
    };
    match inner
        .pending
        .lock()
        .expect("pending mutex poisoned")
        .remove(&response.id)
    {
        Some(waiter) => {
            // The waiter may have timed out between removal and send.
            let _ = waiter.send(outcome);
        }
        None => {
            log::debug!(
                "unmatched response {} on {} (late, duplicate, or cancelled)",
                response.id,
                delivery.topic
            );
        }
    }
    Ok(())
}
