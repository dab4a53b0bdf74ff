//! Request/response JSON-RPC over sealed relay topics.
//!
//! Every payload travels as an envelope sealed with the topic's symmetric
//! key. The [`Dispatcher`] owns outbound correlation (id generation,
//! pending waiters, timeouts) and inbound routing (decode, dedup, forward
//! requests to the protocol layer, resolve responses). It is transport-
//! and method-agnostic: which methods exist and what their tags and TTLs
//! are is the caller's business.

mod body;
mod dispatch;
mod error;
mod seen;

pub use body::{
    generate_id, RpcErrorBody, RpcOutcome, RpcRequest, RpcResponse, ERROR_METHOD_NOT_FOUND,
    JSONRPC_VERSION,
};
pub use dispatch::{Dispatcher, InboundRpc, PublishOptions};
pub use error::RpcError;
