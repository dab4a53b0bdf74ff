//! Relay client: topic-addressed publish/subscribe over one persistent
//! duplex connection to an untrusted relay.
//!
//! The client runs as a single actor task. Reconnection is the critical
//! recovery path: on connection loss every topic in the resubscription set is
//! resubscribed before the connected state is reported again, so no inbound
//! gap is visible to upper layers, and publishes issued while disconnected
//! are queued (bounded, oldest dropped with [`RelayError::Backpressure`]) and
//! flushed in order once the link is back.
//!
//! The client has no view of message identity beyond the transport frame;
//! deduplicating re-deliveries is the dispatcher's job.

mod client;
mod config;
mod error;
mod transport;
mod wire;

pub use client::{ConnectionState, InboundMessage, RelayClient, SubscriptionId};
pub use config::RelayConfig;
pub use error::RelayError;
pub use transport::{RelayTransport, TransportConn};
pub use wire::PublishParams;
