//! JSON-RPC 2.0 bodies as they appear inside sealed envelopes, plus the
//! id scheme that makes request ids collision-free within one client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for a method the peer does not implement.
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self { id, jsonrpc: JSONRPC_VERSION.to_owned(), method: method.into(), params }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self { id, jsonrpc: JSONRPC_VERSION.to_owned(), result: Some(result), error: None }
    }

    pub fn failure(id: u64, error: RpcErrorBody) -> Self {
        Self { id, jsonrpc: JSONRPC_VERSION.to_owned(), result: None, error: Some(error) }
    }
}

/// The `error` member of a failed response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

impl RpcErrorBody {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ERROR_METHOD_NOT_FOUND, format!("method not found: {method}"))
    }
}

/// Outcome of a peer-handled request: either member of the response body.
/// Wire and crypto failures are [`RpcError`](crate::RpcError) instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcOutcome {
    Success(Value),
    Failure(RpcErrorBody),
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Request ids carry their creation time: epoch milliseconds scaled by
/// 10^6 plus a process-wide sequence number. Ids from the same client
/// never collide, and ids from two peers collide only if minted in the
/// same millisecond with the same sequence value.
pub fn generate_id() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    millis * 1_000_000 + seq
}
