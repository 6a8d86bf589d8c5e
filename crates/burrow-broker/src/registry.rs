//! Registry of tunnels waiting to be claimed
//!
//! Maps a token to the sending half of a single-use hand-off slot. The map
//! lock only covers insert/remove; the hand-off itself travels through a
//! oneshot channel, so lock hold time never depends on relay duration.

use crate::config::DEFAULT_MAX_TOKEN_ATTEMPTS;
use crate::handoff::Handoff;
use crate::token::{OsTokenGenerator, TokenGenerator, TunnelToken};
use crate::BrokerError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{error, trace, warn};

/// Claimer side of a pending tunnel
pub struct PendingSlot {
    tx: oneshot::Sender<Handoff>,
    created_at: Instant,
}

impl PendingSlot {
    /// Deliver the hand-off to the waiting session.
    /// Returns the hand-off back if the session is already gone.
    pub fn deliver(self, handoff: Handoff) -> Result<(), Handoff> {
        self.tx.send(handoff)
    }

    /// Time spent waiting in the registry
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Session side of a pending tunnel
pub struct PendingTunnel {
    token: TunnelToken,
    rx: oneshot::Receiver<Handoff>,
}

impl PendingTunnel {
    pub fn token(&self) -> TunnelToken {
        self.token
    }

    /// Wait for an HTTP request to claim this tunnel.
    ///
    /// Fails with `Cancelled` if the slot was removed without a claim.
    pub async fn claimed(self) -> Result<Handoff, BrokerError> {
        self.rx.await.map_err(|_| BrokerError::Cancelled)
    }
}

/// Concurrent token → pending slot map
pub struct TunnelRegistry {
    slots: DashMap<TunnelToken, PendingSlot>,
    generator: Arc<dyn TokenGenerator>,
    max_attempts: u32,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::with_generator(Arc::new(OsTokenGenerator), DEFAULT_MAX_TOKEN_ATTEMPTS)
    }

    pub fn with_generator(generator: Arc<dyn TokenGenerator>, max_attempts: u32) -> Self {
        Self {
            slots: DashMap::new(),
            generator,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Register a new pending tunnel under an unused token
    pub fn create(&self) -> Result<(TunnelToken, PendingTunnel), BrokerError> {
        for attempt in 1..=self.max_attempts {
            let token = self.generator.generate();

            match self.slots.entry(token) {
                Entry::Occupied(_) => {
                    warn!(attempt, "Token collision, regenerating");
                }
                Entry::Vacant(vacant) => {
                    let (tx, rx) = oneshot::channel();
                    vacant.insert(PendingSlot {
                        tx,
                        created_at: Instant::now(),
                    });
                    trace!("Registered pending tunnel {}", token);
                    return Ok((token, PendingTunnel { token, rx }));
                }
            }
        }

        error!(
            attempts = self.max_attempts,
            "Token space exhausted, refusing tunnel"
        );
        Err(BrokerError::TokenSpaceExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Take the pending slot for `token`. At most one caller ever gets it.
    pub fn claim(&self, token: TunnelToken) -> Option<PendingSlot> {
        self.slots.remove(&token).map(|(_, slot)| slot)
    }

    /// Drop a pending tunnel. Returns whether it was still registered.
    pub fn remove(&self, token: TunnelToken) -> bool {
        self.slots.remove(&token).is_some()
    }

    pub fn contains(&self, token: TunnelToken) -> bool {
        self.slots.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::completion_pair;
    use std::sync::{Barrier, Mutex};

    /// Replays a fixed sequence of tokens, repeating the last one
    struct SequenceGenerator {
        values: Mutex<Vec<u64>>,
    }

    impl SequenceGenerator {
        fn new(mut values: Vec<u64>) -> Self {
            values.reverse();
            Self {
                values: Mutex::new(values),
            }
        }
    }

    impl TokenGenerator for SequenceGenerator {
        fn generate(&self) -> TunnelToken {
            let mut values = self.values.lock().unwrap();
            let next = if values.len() > 1 {
                values.pop().unwrap()
            } else {
                values[0]
            };
            TunnelToken::new(next)
        }
    }

    #[test]
    fn test_create_and_claim() {
        let registry = TunnelRegistry::new();

        let (token, pending) = registry.create().unwrap();
        assert_eq!(pending.token(), token);
        assert!(registry.contains(token));
        assert_eq!(registry.len(), 1);

        assert!(registry.claim(token).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_claim_twice_reports_not_found() {
        let registry = TunnelRegistry::new();
        let (token, _pending) = registry.create().unwrap();

        assert!(registry.claim(token).is_some());
        assert!(registry.claim(token).is_none());
    }

    #[test]
    fn test_claim_unknown_token() {
        let registry = TunnelRegistry::new();
        assert!(registry.claim(TunnelToken::new(7)).is_none());
    }

    #[test]
    fn test_concurrent_claims_only_one_wins() {
        let registry = TunnelRegistry::new();

        for _ in 0..100 {
            let (token, _pending) = registry.create().unwrap();
            let barrier = Barrier::new(2);

            let found = std::thread::scope(|scope| {
                let first = scope.spawn(|| {
                    barrier.wait();
                    registry.claim(token).is_some()
                });
                let second = scope.spawn(|| {
                    barrier.wait();
                    registry.claim(token).is_some()
                });

                [first.join().unwrap(), second.join().unwrap()]
                    .into_iter()
                    .filter(|found| *found)
                    .count()
            });

            assert_eq!(found, 1);
        }
    }

    #[test]
    fn test_collision_regenerates() {
        let registry = TunnelRegistry::with_generator(
            Arc::new(SequenceGenerator::new(vec![7, 7, 9])),
            DEFAULT_MAX_TOKEN_ATTEMPTS,
        );

        let (first, _a) = registry.create().unwrap();
        let (second, _b) = registry.create().unwrap();

        assert_eq!(first.get(), 7);
        assert_eq!(second.get(), 9);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_collision_cap_fails_loudly() {
        let registry = TunnelRegistry::with_generator(Arc::new(SequenceGenerator::new(vec![5])), 3);

        let (_token, _pending) = registry.create().unwrap();
        let result = registry.create();

        assert!(matches!(
            result,
            Err(BrokerError::TokenSpaceExhausted { attempts: 3 })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_reaches_session() {
        let registry = TunnelRegistry::new();
        let (token, pending) = registry.create().unwrap();

        let slot = registry.claim(token).unwrap();
        let (completion, _waiter) = completion_pair();
        let destination = Box::new(tokio::io::sink());
        assert!(slot.deliver(Handoff::new(destination, completion)).is_ok());

        assert!(pending.claimed().await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_cancels_waiting_session() {
        let registry = TunnelRegistry::new();
        let (token, pending) = registry.create().unwrap();

        assert!(registry.remove(token));
        assert!(!registry.remove(token));

        assert!(matches!(
            pending.claimed().await,
            Err(BrokerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_deliver_after_session_left() {
        let registry = TunnelRegistry::new();
        let (token, pending) = registry.create().unwrap();
        drop(pending);

        let slot = registry.claim(token).unwrap();
        let (completion, _waiter) = completion_pair();
        assert!(slot
            .deliver(Handoff::new(Box::new(tokio::io::sink()), completion))
            .is_err());
    }
}
