//! Session side of a tunnel
//!
//! `Connected → AwaitingClaim → Relaying → Done | Aborted`
//!
//! The session greets the user, registers a token, waits for an HTTP request
//! to claim it, then copies its own input into the hand-off destination until
//! end-of-stream. Whatever way the session ends, its registry entry is gone
//! afterwards.

use crate::broker::TunnelBroker;
use crate::handoff::{Destination, Handoff};
use crate::registry::TunnelRegistry;
use crate::token::TunnelToken;
use crate::BrokerError;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Written to both legs once a tunnel completes
pub const TRAILER: &[u8] = b"\n\n!!! DONE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    AwaitingClaim,
    Relaying,
    Done,
    Aborted,
}

/// Summary of a finished tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub token: TunnelToken,
    pub bytes_relayed: u64,
}

/// Removes the session's registry entry however the session ends,
/// including when the session task is aborted.
struct SlotGuard<'a> {
    registry: &'a TunnelRegistry,
    token: TunnelToken,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.registry.remove(self.token) {
            debug!("Removed unclaimed tunnel {}", self.token);
        }
    }
}

/// Drives one operator session through the tunnel lifecycle
pub struct SessionHandler {
    broker: Arc<TunnelBroker>,
    user: String,
    state: SessionState,
    token: Option<TunnelToken>,
}

impl SessionHandler {
    pub fn new(broker: Arc<TunnelBroker>, user: impl Into<String>) -> Self {
        Self {
            broker,
            user: user.into(),
            state: SessionState::Connected,
            token: None,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            user = %self.user,
            token = ?self.token.map(|t| t.get()),
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
    }

    /// Run the session to completion.
    ///
    /// `input` is what the operator sends; `output` is what the operator sees.
    /// `output` is shut down before returning.
    pub async fn run<R, W>(
        mut self,
        mut input: R,
        mut output: W,
    ) -> Result<SessionReport, BrokerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = self.drive(&mut input, &mut output).await;

        match &result {
            Ok(report) => {
                self.transition(SessionState::Done);
                info!(
                    user = %self.user,
                    token = %report.token,
                    bytes = report.bytes_relayed,
                    "Tunnel finished"
                );
            }
            Err(e) => {
                self.transition(SessionState::Aborted);
                warn!(user = %self.user, error = %e, "Tunnel aborted");
            }
        }

        if let Err(e) = output.shutdown().await {
            debug!(user = %self.user, error = %e, "Session output already closed");
        }

        result
    }

    async fn drive<R, W>(
        &mut self,
        input: &mut R,
        output: &mut W,
    ) -> Result<SessionReport, BrokerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let broker = Arc::clone(&self.broker);
        let config = broker.config();

        output
            .write_all(format!("user: {} connected\n", self.user).as_bytes())
            .await?;
        output.flush().await?;

        let (token, pending) = broker.registry().create()?;
        let _guard = SlotGuard {
            registry: broker.registry(),
            token,
        };
        self.token = Some(token);
        tracing::Span::current().record("token", token.get());

        broker.publisher().publish(&self.user, token);
        if config.announce_token {
            output
                .write_all(format!("tunnel id: {}\n", token).as_bytes())
                .await?;
            output.flush().await?;
        }
        self.transition(SessionState::AwaitingClaim);

        let handoff = match config.claim_timeout {
            Some(limit) => tokio::time::timeout(limit, pending.claimed())
                .await
                .map_err(|_| BrokerError::TimedOut("tunnel claim"))??,
            None => pending.claimed().await?,
        };
        self.transition(SessionState::Relaying);

        let bytes_relayed = relay(input, output, handoff).await?;

        Ok(SessionReport {
            token,
            bytes_relayed,
        })
    }
}

/// Copy the session input into the hand-off destination and settle completion.
///
/// On success the destination gets the trailer and is shut down before
/// completion fires; the session output gets the trailer afterwards.
async fn relay<R, W>(input: &mut R, output: &mut W, handoff: Handoff) -> Result<u64, BrokerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut destination, completion) = handoff.into_parts();
    let cancel = completion.cancel_token().clone();

    let copied = tokio::select! {
        _ = cancel.cancelled() => {
            completion.fire(Err(BrokerError::Cancelled));
            return Err(BrokerError::Cancelled);
        }
        copied = drain_into(input, &mut destination) => copied,
    };
    drop(destination);

    match copied {
        Ok(bytes) => {
            completion.fire(Ok(bytes));
            output.write_all(TRAILER).await?;
            output.flush().await?;
            Ok(bytes)
        }
        Err(e) => {
            let error = BrokerError::Transport(e);
            completion.fire(Err(error.duplicate()));
            Err(error)
        }
    }
}

async fn drain_into<R>(input: &mut R, destination: &mut Destination) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let bytes = tokio::io::copy(input, destination).await?;
    destination.write_all(TRAILER).await?;
    destination.shutdown().await?;
    Ok(bytes)
}
