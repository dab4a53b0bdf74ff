//! Relay wire frames: JSON-RPC over the transport's text frames.
//!
//! Outbound: `irn_subscribe`, `irn_unsubscribe`, `irn_publish` with
//! server acks. Inbound: `irn_subscription` deliveries, acked back.

use serde_json::{json, Value};

use waltz_kms::Topic;

use crate::error::RelayError;

pub const METHOD_SUBSCRIBE: &str = "irn_subscribe";
pub const METHOD_UNSUBSCRIBE: &str = "irn_unsubscribe";
pub const METHOD_PUBLISH: &str = "irn_publish";
pub const METHOD_SUBSCRIPTION: &str = "irn_subscription";

/// Parameters of one relay publish: the envelope message plus delivery
/// hints the relay understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishParams {
    pub topic: Topic,
    pub message: String,
    pub ttl_secs: u64,
    pub tag: u32,
    pub prompt: bool,
}

pub(crate) fn subscribe_frame(id: u64, topic: &Topic) -> String {
    json!({
        "id": id,
        "jsonrpc": "2.0",
        "method": METHOD_SUBSCRIBE,
        "params": { "topic": topic.to_hex() },
    })
    .to_string()
}

pub(crate) fn unsubscribe_frame(id: u64, topic: &Topic, subscription: &str) -> String {
    json!({
        "id": id,
        "jsonrpc": "2.0",
        "method": METHOD_UNSUBSCRIBE,
        "params": { "topic": topic.to_hex(), "id": subscription },
    })
    .to_string()
}

pub(crate) fn publish_frame(id: u64, params: &PublishParams) -> String {
    json!({
        "id": id,
        "jsonrpc": "2.0",
        "method": METHOD_PUBLISH,
        "params": {
            "topic": params.topic.to_hex(),
            "message": params.message,
            "ttl": params.ttl_secs,
            "tag": params.tag,
            "prompt": params.prompt,
        },
    })
    .to_string()
}

pub(crate) fn ack_frame(id: u64) -> String {
    json!({ "id": id, "jsonrpc": "2.0", "result": true }).to_string()
}

/// A frame read off the connection, reduced to what the client acts on.
#[derive(Debug)]
pub(crate) enum InboundFrame {
    /// `irn_subscription` delivery for a subscribed topic.
    Delivery { id: u64, topic: Topic, message: String },
    /// Server acknowledgment of one of our requests.
    Ack { id: u64, result: Value },
    /// Server-reported failure of one of our requests.
    Failure { id: u64, reason: String },
}

pub(crate) fn parse_frame(text: &str) -> Result<InboundFrame, RelayError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| RelayError::protocol(format!("bad frame: {err}")))?;
    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| RelayError::protocol("frame without id"))?;

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        if method != METHOD_SUBSCRIPTION {
            return Err(RelayError::protocol(format!("unexpected relay method {method}")));
        }
        let data = value
            .pointer("/params/data")
            .ok_or_else(|| RelayError::protocol("subscription frame without data"))?;
        let topic = data
            .get("topic")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::protocol("delivery without topic"))?
            .parse::<Topic>()
            .map_err(|err| RelayError::protocol(format!("delivery topic: {err}")))?;
        let message = data
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::protocol("delivery without message"))?
            .to_owned();
        return Ok(InboundFrame::Delivery { id, topic, message });
    }

    if let Some(error) = value.get("error") {
        let reason = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown relay error")
            .to_owned();
        return Ok(InboundFrame::Failure { id, reason });
    }

    let result = value
        .get("result")
        .cloned()
        .ok_or_else(|| RelayError::protocol("response without result or error"))?;
    Ok(InboundFrame::Ack { id, result })
}
