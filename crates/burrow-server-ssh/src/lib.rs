//! SSH side of the tunnel broker
//!
//! Accepts SSH connections, authenticates them by public key and runs a
//! broker session over each shell or exec channel.
pub mod channel;
pub mod config;
pub mod handler;
pub mod server;
pub mod tasks;

pub use channel::{ChannelInput, ChannelOutput};
pub use config::{load_or_generate_host_key, SshServerConfig};
pub use handler::SshSessionHandler;
pub use server::SshServer;
pub use tasks::SessionTasks;

use thiserror::Error;

/// SSH server errors
#[derive(Debug, Error)]
pub enum SshServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Host key error: {0}")]
    HostKey(String),
}
