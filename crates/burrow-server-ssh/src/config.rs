//! SSH server configuration and host key handling

use crate::SshServerError;
use rand::rngs::OsRng;
use russh::MethodSet;
use russh_keys::key::KeyPair;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// SSH server configuration
#[derive(Debug, Clone)]
pub struct SshServerConfig {
    pub bind_addr: SocketAddr,
    /// OpenSSH private key; generated on first start when missing
    pub host_key_path: PathBuf,
    /// Close connections idle for this long (None = never).
    /// Must exceed the broker's claim timeout when set.
    pub inactivity_timeout: Option<Duration>,
    /// Delay before answering a rejected authentication attempt
    pub auth_rejection_time: Duration,
}

impl Default for SshServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 2222)),
            host_key_path: PathBuf::from(".ssh_host_ed25519_key"),
            inactivity_timeout: None,
            auth_rejection_time: Duration::from_secs(1),
        }
    }
}

impl SshServerConfig {
    /// russh server configuration using `host_key`, public-key auth only
    pub fn russh_config(&self, host_key: KeyPair) -> russh::server::Config {
        russh::server::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            auth_rejection_time: self.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: self.inactivity_timeout,
            ..Default::default()
        }
    }
}

/// Load the host key at `path`, creating an Ed25519 key there first if the
/// file does not exist.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair, SshServerError> {
    if !path.exists() {
        generate_host_key(path)?;
        info!("Generated new Ed25519 host key at {}", path.display());
    }

    russh_keys::load_secret_key(path, None)
        .map_err(|e| SshServerError::HostKey(format!("{}: {}", path.display(), e)))
}

fn generate_host_key(path: &Path) -> Result<(), SshServerError> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| SshServerError::HostKey(e.to_string()))?;
    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| SshServerError::HostKey(e.to_string()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(encoded.as_bytes())?;
    file.sync_all()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::PublicKeyBase64;

    #[test]
    fn test_default_config() {
        let config = SshServerConfig::default();
        assert_eq!(config.bind_addr.port(), 2222);
        assert!(config.inactivity_timeout.is_none());
    }

    #[test]
    fn test_generate_then_reload_host_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host_ed25519");

        let generated = load_or_generate_host_key(&path).unwrap();
        assert!(path.exists());

        let reloaded = load_or_generate_host_key(&path).unwrap();
        assert_eq!(generated.public_key_base64(), reloaded.public_key_base64());
    }

    #[cfg(unix)]
    #[test]
    fn test_generated_host_key_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_ed25519");
        load_or_generate_host_key(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_unparseable_host_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_ed25519");
        std::fs::write(&path, "not a key").unwrap();

        assert!(matches!(
            load_or_generate_host_key(&path),
            Err(SshServerError::HostKey(_))
        ));
    }
}
