//! Tunnel broker: pairs a waiting operator session with exactly one HTTP request
//!
//! A session registers a pending tunnel under a random token and blocks. An HTTP
//! request carrying that token claims the tunnel once, hands its response sink
//! to the session, and waits until the session's input is drained into it.
pub mod broker;
pub mod config;
pub mod error;
pub mod handoff;
pub mod registry;
pub mod session;
pub mod token;

pub use broker::TunnelBroker;
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use handoff::{
    completion_pair, Completion, CompletionWaiter, Destination, Handoff, RelayFuture, RelayResult,
};
pub use registry::{PendingSlot, PendingTunnel, TunnelRegistry};
pub use session::{SessionHandler, SessionReport, SessionState, TRAILER};
pub use token::{LogPublisher, OsTokenGenerator, TokenGenerator, TokenPublisher, TunnelToken};
