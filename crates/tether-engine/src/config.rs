use std::time::Duration;

use tether_protocol::Backoff;

/// Tunables of the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorConfig {
    /// Device quota: active sessions allowed per owner.
    pub max_sessions_per_owner: usize,
    /// Upper bound on a pairing code's validity.
    pub pairing_timeout: Duration,
    /// How long to wait for the client to produce a pairing challenge.
    pub challenge_timeout: Duration,
    /// Codes a session may be issued before it expires for good.
    pub max_pairing_retries: u32,
    /// Period of the health sweep.
    pub health_interval: Duration,
    /// Bound on a single connect call made outside the reconnect loop.
    pub connect_timeout: Duration,
    pub reconnect: Backoff,
    /// Per-subscriber outbound queue depth.
    pub subscriber_queue: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_owner: 5,
            pairing_timeout: Duration::from_secs(30),
            challenge_timeout: Duration::from_secs(20),
            max_pairing_retries: 5,
            health_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(20),
            reconnect: Backoff::default(),
            subscriber_queue: 256,
        }
    }
}
