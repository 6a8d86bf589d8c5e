//! Tunnel token generation and publication
//!
//! A token is the only thing an HTTP caller needs to claim a waiting session,
//! so it is the entire access-control boundary of the HTTP side. Tokens are
//! drawn from the operating system CSPRNG and never reused.

use crate::BrokerError;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Identifier and secret shared by the two legs of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelToken(u64);

impl TunnelToken {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for TunnelToken {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for TunnelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TunnelToken {
    type Err = BrokerError;

    /// Parse a base-10 token as it appears in the `id` query parameter
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| BrokerError::MalformedInput(e.to_string()))
    }
}

/// Source of new tunnel tokens
///
/// Implementations must be unpredictable to outside callers. Uniqueness is
/// not required: the registry retries on collision.
pub trait TokenGenerator: Send + Sync {
    fn generate(&self) -> TunnelToken;
}

/// Token generator backed by the operating system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsTokenGenerator;

impl TokenGenerator for OsTokenGenerator {
    fn generate(&self) -> TunnelToken {
        TunnelToken(OsRng.next_u64())
    }
}

/// Out-of-band channel used to tell the operator which token their session got
pub trait TokenPublisher: Send + Sync {
    fn publish(&self, user: &str, token: TunnelToken);
}

/// Publishes tokens to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl TokenPublisher for LogPublisher {
    fn publish(&self, user: &str, token: TunnelToken) {
        info!(user = %user, token = %token, "Tunnel ready, waiting for claim");
    }
}
