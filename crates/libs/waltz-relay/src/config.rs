use std::time::Duration;

/// Tuning knobs for the relay client.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Window for a server acknowledgment before a publish surfaces
    /// [`RelayError::PublishTimeout`](crate::RelayError::PublishTimeout).
    pub ack_timeout: Duration,
    /// Total wait for a publish, covering time spent queued while offline.
    pub publish_timeout: Duration,
    /// First reconnect delay; doubled per failed attempt.
    pub backoff_initial: Duration,
    /// Reconnect delay ceiling.
    pub backoff_max: Duration,
    /// Offline publish queue depth; overflow drops the oldest entry.
    pub publish_queue_depth: usize,
    /// Buffered inbound `(topic, message)` deliveries.
    pub inbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(30),
            backoff_initial: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
            publish_queue_depth: 32,
            inbound_buffer: 64,
        }
    }
}
