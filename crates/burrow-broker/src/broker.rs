//! Tunnel broker facade shared by the session and HTTP servers

use crate::config::BrokerConfig;
use crate::handoff::{completion_pair, CompletionWaiter, Handoff, RelayFuture};
use crate::registry::TunnelRegistry;
use crate::session::SessionHandler;
use crate::token::{LogPublisher, TokenGenerator, TokenPublisher, TunnelToken};
use crate::BrokerError;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

/// Owns the tunnel registry and the policy both legs run under.
///
/// Several brokers can coexist in one process; nothing here is global.
pub struct TunnelBroker {
    registry: TunnelRegistry,
    config: BrokerConfig,
    publisher: Arc<dyn TokenPublisher>,
}

impl TunnelBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = TunnelRegistry::with_generator(
            Arc::new(crate::token::OsTokenGenerator),
            config.max_token_attempts,
        );

        Self {
            registry,
            config,
            publisher: Arc::new(LogPublisher),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn TokenGenerator>) -> Self {
        self.registry = TunnelRegistry::with_generator(generator, self.config.max_token_attempts);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn TokenPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn publisher(&self) -> &dyn TokenPublisher {
        self.publisher.as_ref()
    }

    /// Number of tunnels waiting to be claimed
    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    /// Session handler for a newly authenticated user
    pub fn session(self: &Arc<Self>, user: impl Into<String>) -> SessionHandler {
        SessionHandler::new(Arc::clone(self), user)
    }

    /// Claim the tunnel registered under `token` and hand it `destination`.
    ///
    /// Returns as soon as the session has the hand-off; the returned waiter
    /// resolves once the relay is finished.
    pub fn hand_off<W>(
        &self,
        token: TunnelToken,
        destination: W,
    ) -> Result<CompletionWaiter, BrokerError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let slot = self.registry.claim(token).ok_or_else(|| {
            debug!("Claim for unknown tunnel {}", token);
            BrokerError::TokenNotFound
        })?;

        let waited = slot.age();
        let (completion, waiter) = completion_pair();

        slot.deliver(Handoff::new(Box::new(destination), completion))
            .map_err(|_| {
                warn!("Session for tunnel {} left before hand-off", token);
                BrokerError::SessionClosed
            })?;

        info!(
            token = %token,
            waited_ms = waited.as_millis() as u64,
            "Tunnel claimed"
        );

        Ok(waiter)
    }

    /// Claim and hand off, returning the relay outcome under the relay deadline.
    ///
    /// Claim failures are reported immediately. Once the deadline expires the
    /// tunnel is cancelled and the future resolves to `TimedOut`.
    pub fn hand_off_with_deadline<W>(
        &self,
        token: TunnelToken,
        destination: W,
    ) -> Result<RelayFuture, BrokerError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let waiter = self.hand_off(token, destination)?;
        Ok(Box::pin(waiter.wait(self.config.relay_timeout)))
    }
}

impl Default for TunnelBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
