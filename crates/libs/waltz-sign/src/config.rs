use std::time::Duration;

use waltz_relay::RelayConfig;

use crate::types::Metadata;

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

/// Client tuning. The defaults suit interactive human-in-the-loop flows:
/// requests wait minutes, not seconds, because a person may be approving.
#[derive(Clone, Debug)]
pub struct SignConfig {
    pub metadata: Metadata,
    pub relay: RelayConfig,
    /// Wait for a peer response to session requests, updates, and pings.
    pub request_timeout: Duration,
    /// How long a proposal stays actionable before auto-rejection.
    pub proposal_window: Duration,
    pub pairing_ttl: Duration,
    pub session_ttl: Duration,
    /// Ceiling for `extend`; a requested expiry beyond `now + max_session_ttl`
    /// is rejected.
    pub max_session_ttl: Duration,
    /// Cadence of the expiry sweep over pairings, sessions, and proposals.
    pub sweep_interval: Duration,
}

impl Default for SignConfig {
    fn default() -> Self {
        Self {
            metadata: Metadata::default(),
            relay: RelayConfig::default(),
            request_timeout: Duration::from_secs(5 * MINUTE),
            proposal_window: Duration::from_secs(5 * MINUTE),
            pairing_ttl: Duration::from_secs(30 * DAY),
            session_ttl: Duration::from_secs(7 * DAY),
            max_session_ttl: Duration::from_secs(7 * DAY),
            sweep_interval: Duration::from_secs(30),
        }
    }
}
