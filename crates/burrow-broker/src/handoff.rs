//! Hand-off values and the completion signal shared by both legs of a tunnel
//!
//! The HTTP leg creates a [`Completion`]/[`CompletionWaiter`] pair per claim.
//! The session leg receives the `Completion` inside the [`Handoff`] and fires
//! it exactly once; the HTTP leg waits on the `CompletionWaiter`. Both hold the
//! same cancellation token, so a failure or deadline on either side releases
//! the other.

use crate::BrokerError;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

/// Byte sink the session relays into
pub type Destination = Box<dyn AsyncWrite + Send + Unpin>;

/// Outcome reported through the completion signal (bytes relayed on success)
pub type RelayResult = Result<u64, BrokerError>;

/// Relay outcome bounded by the relay deadline.
///
/// Dropping it before it resolves cancels the tunnel.
pub type RelayFuture = Pin<Box<dyn Future<Output = RelayResult> + Send>>;

/// Value transferred from the HTTP leg to the waiting session
pub struct Handoff {
    pub(crate) destination: Destination,
    pub(crate) completion: Completion,
}

impl Handoff {
    pub fn new(destination: Destination, completion: Completion) -> Self {
        Self {
            destination,
            completion,
        }
    }

    pub fn into_parts(self) -> (Destination, Completion) {
        (self.destination, self.completion)
    }
}

/// Single-fire completion signal held by the session leg
pub struct Completion {
    tx: oneshot::Sender<RelayResult>,
    cancel: CancellationToken,
}

impl Completion {
    /// Cancellation context shared with the HTTP leg
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fire the signal. Failures also cancel the shared context.
    pub fn fire(self, result: RelayResult) {
        if result.is_err() {
            self.cancel.cancel();
        }

        if self.tx.send(result).is_err() {
            debug!("Completion fired after the waiter went away");
        }
    }
}

/// HTTP-leg end of the completion signal
///
/// Dropping the waiter before completion cancels the tunnel.
pub struct CompletionWaiter {
    rx: oneshot::Receiver<RelayResult>,
    guard: DropGuard,
}

impl CompletionWaiter {
    /// Block until the session fires completion or `deadline` expires
    pub async fn wait(self, deadline: Option<Duration>) -> RelayResult {
        let CompletionWaiter { rx, guard } = self;

        let received = match deadline {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| BrokerError::TimedOut("relay completion"))?,
            None => rx.await,
        };

        match received {
            Ok(Ok(bytes)) => {
                guard.disarm();
                Ok(bytes)
            }
            Ok(Err(e)) => Err(e),
            // Session dropped its completion without firing (task aborted)
            Err(_) => Err(BrokerError::Cancelled),
        }
    }
}

/// Create a linked completion signal and waiter with a fresh cancellation context
pub fn completion_pair() -> (Completion, CompletionWaiter) {
    let (tx, rx) = oneshot::channel();
    let cancel = CancellationToken::new();

    let completion = Completion {
        tx,
        cancel: cancel.clone(),
    };
    let waiter = CompletionWaiter {
        rx,
        guard: cancel.drop_guard(),
    };

    (completion, waiter)
}
