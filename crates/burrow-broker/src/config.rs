//! Broker configuration

use std::time::Duration;

/// How long a session waits for its tunnel to be claimed by default
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(600);

/// How long an HTTP request waits for the relay to finish by default
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(3600);

/// Consecutive token collisions tolerated before `create` gives up
pub const DEFAULT_MAX_TOKEN_ATTEMPTS: u32 = 16;

/// Tunnel broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Deadline for a session waiting in the registry (None = wait forever)
    pub claim_timeout: Option<Duration>,
    /// Deadline for an HTTP request waiting on relay completion (None = wait forever)
    pub relay_timeout: Option<Duration>,
    /// Token generation attempts per tunnel before failing
    pub max_token_attempts: u32,
    /// Also write the token to the session after the greeting
    pub announce_token: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Some(DEFAULT_CLAIM_TIMEOUT),
            relay_timeout: Some(DEFAULT_RELAY_TIMEOUT),
            max_token_attempts: DEFAULT_MAX_TOKEN_ATTEMPTS,
            announce_token: false,
        }
    }
}

impl BrokerConfig {
    pub fn with_claim_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_relay_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.relay_timeout = timeout;
        self
    }

    pub fn with_announce_token(mut self, announce: bool) -> Self {
        self.announce_token = announce;
        self
    }
}
