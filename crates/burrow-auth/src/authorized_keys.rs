//! `authorized_keys` file authentication
//!
//! The file is read again on every attempt so edits apply without a restart.
//! Entries are checked in order and the first matching key grants access.
//! A file that cannot be read denies everyone.

use crate::{AuthError, KeyAuthenticator};
use async_trait::async_trait;
use ssh_key::authorized_keys::Entry;
use ssh_key::{HashAlg, PublicKey};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// Authenticator backed by an OpenSSH `authorized_keys` file
#[derive(Debug, Clone)]
pub struct AuthorizedKeysFile {
    path: PathBuf,
}

impl AuthorizedKeysFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeyAuthenticator for AuthorizedKeysFile {
    async fn authorize(&self, user: &str, key: &PublicKey) -> Result<(), AuthError> {
        let fingerprint = key.fingerprint(HashAlg::Sha256);

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| {
                warn!(path = ?self.path, error = %source, "Authorized keys unreadable");
                AuthError::Unreadable {
                    path: self.path.clone(),
                    source,
                }
            })?;

        match first_match(&contents, key) {
            Some(line) => {
                info!(user = %user, %fingerprint, line, "Authorized user, access granted");
                Ok(())
            }
            None => {
                warn!(user = %user, %fingerprint, "No authorized key matches");
                Err(AuthError::NotAuthorized)
            }
        }
    }
}

/// Line number (1-based) of the first entry in `contents` carrying `key`.
///
/// Blank lines and comments are skipped; malformed entries are logged and
/// skipped. Options and comments on an entry do not affect matching.
pub fn first_match(contents: &str, key: &PublicKey) -> Option<usize> {
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match Entry::from_str(line) {
            Ok(entry) if entry.public_key().key_data() == key.key_data() => {
                return Some(index + 1);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed authorized key");
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_openssh_key;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4f";
    const KEY_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAICAhIiMkJSYnKCkqKywtLi8wMTIzNDU2Nzg5Ojs8PT4/";

    fn key(data: &str) -> PublicKey {
        parse_openssh_key(&format!("ssh-ed25519 {}", data)).unwrap()
    }

    #[test]
    fn test_first_match_in_order() {
        let contents = format!(
            "# operators\n\nssh-ed25519 {KEY_B} second@host\nssh-ed25519 {KEY_A} first@host\nssh-ed25519 {KEY_A} again@host\n"
        );

        assert_eq!(first_match(&contents, &key(KEY_A)), Some(4));
        assert_eq!(first_match(&contents, &key(KEY_B)), Some(3));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let contents = format!("ssh-ed25519 ???\nnot a key at all\nssh-ed25519 {KEY_A}\n");

        assert_eq!(first_match(&contents, &key(KEY_A)), Some(3));
    }

    #[test]
    fn test_options_do_not_prevent_match() {
        let contents = format!("no-pty,no-port-forwarding ssh-ed25519 {KEY_A} restricted@host\n");

        assert_eq!(first_match(&contents, &key(KEY_A)), Some(1));
    }

    #[test]
    fn test_no_match() {
        let contents = format!("ssh-ed25519 {KEY_B} other@host\n");

        assert_eq!(first_match(&contents, &key(KEY_A)), None);
        assert_eq!(first_match("", &key(KEY_A)), None);
    }
}
