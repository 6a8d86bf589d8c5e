//! Public-key authentication for operator sessions

pub mod authorized_keys;

pub use authorized_keys::{first_match, AuthorizedKeysFile};

// Re-export so callers do not need a direct ssh-key dependency
pub use ssh_key::PublicKey;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Authentication errors
///
/// These never reach the connecting client; the transport only learns
/// accept or reject.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Cannot read authorized keys {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Key not authorized")]
    NotAuthorized,

    #[error("Invalid public key: {0}")]
    InvalidKey(String),
}

/// Decides whether an offered public key may open a session
#[async_trait]
pub trait KeyAuthenticator: Send + Sync {
    async fn authorize(&self, user: &str, key: &PublicKey) -> Result<(), AuthError>;
}

/// Parse a key in OpenSSH single-line form (`<algorithm> <base64> [comment]`)
pub fn parse_openssh_key(line: &str) -> Result<PublicKey, AuthError> {
    PublicKey::from_openssh(line.trim()).map_err(|e| AuthError::InvalidKey(e.to_string()))
}
