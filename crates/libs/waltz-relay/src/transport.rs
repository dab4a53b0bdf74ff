use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RelayError;

/// A live duplex connection: JSON text frames in both directions. The
/// connection is considered closed when either channel closes.
pub struct TransportConn {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Seam between the relay client and the underlying socket machinery.
///
/// Production implementations wrap a websocket; tests use the in-memory
/// broker from `waltz-test-support`. Each `connect` call must produce a
/// fresh connection with no state carried over.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(&self) -> Result<TransportConn, RelayError>;
}
