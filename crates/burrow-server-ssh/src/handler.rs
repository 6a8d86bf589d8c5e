//! Per-connection russh handler

use crate::channel::{ChannelInput, ChannelOutput};
use crate::tasks::SessionTasks;
use async_trait::async_trait;
use burrow_auth::KeyAuthenticator;
use burrow_broker::TunnelBroker;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use russh_keys::key;
use russh_keys::PublicKeyBase64;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Convert a key offered over the wire into the form the authenticator checks
pub fn to_ssh_key(key: &key::PublicKey) -> Result<ssh_key::PublicKey, ssh_key::Error> {
    ssh_key::PublicKey::from_bytes(&key.public_key_bytes())
}

/// Handles one SSH connection.
///
/// Each session channel that requests a shell or exec runs its own broker
/// session; the command line of an exec request is ignored.
pub struct SshSessionHandler {
    broker: Arc<TunnelBroker>,
    authenticator: Arc<dyn KeyAuthenticator>,
    peer_addr: SocketAddr,
    user: Option<String>,
    /// Opened channels not yet running a session
    channels: HashMap<ChannelId, Channel<Msg>>,
    tasks: SessionTasks<ChannelId>,
}

impl SshSessionHandler {
    pub fn new(
        broker: Arc<TunnelBroker>,
        authenticator: Arc<dyn KeyAuthenticator>,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            broker,
            authenticator,
            peer_addr,
            user: None,
            channels: HashMap::new(),
            tasks: SessionTasks::new(),
        }
    }

    fn start_tunnel(&mut self, id: ChannelId, session: &mut Session) {
        let (Some(channel), Some(user)) = (self.channels.remove(&id), self.user.clone()) else {
            debug!("No open session channel {:?} for {}", id, self.peer_addr);
            session.channel_failure(id);
            return;
        };

        session.channel_success(id);

        let input = ChannelInput::new(channel);
        let output = ChannelOutput::new(session.handle(), id);
        let tunnel = self.broker.session(user.clone());
        let span = tracing::info_span!(
            "tunnel",
            user = %user,
            peer = %self.peer_addr,
            token = tracing::field::Empty
        );

        let task = tokio::spawn(
            async move {
                // Outcome is logged by the session itself
                let _ = tunnel.run(input, output).await;
            }
            .instrument(span),
        );
        self.tasks.insert(id, task);
    }
}

#[async_trait]
impl Handler for SshSessionHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let reject = Auth::Reject {
            proceed_with_methods: None,
        };

        let key = match to_ssh_key(public_key) {
            Ok(key) => key,
            Err(e) => {
                warn!("Unsupported key from {}: {}", self.peer_addr, e);
                return Ok(reject);
            }
        };

        match self.authenticator.authorize(user, &key).await {
            Ok(()) => {
                info!("User {} authenticated from {}", user, self.peer_addr);
                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!("Rejected {} from {}: {}", user, self.peer_addr, e);
                Ok(reject)
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Session channel {:?} opened by {}",
            channel.id(),
            self.peer_addr
        );
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    /// No terminal is allocated, so the client keeps its line discipline
    /// and Ctrl+D ends the input.
    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_tunnel(channel, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_tunnel(channel, session);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        if self.tasks.abort(&channel) {
            debug!("Channel {:?} closed, tunnel task stopped", channel);
        }
        Ok(())
    }
}

impl Drop for SshSessionHandler {
    fn drop(&mut self) {
        debug!(
            "Connection from {} finished with {} tunnel(s) running",
            self.peer_addr,
            self.tasks.running()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4f";

    #[test]
    fn test_to_ssh_key() {
        let offered = russh_keys::parse_public_key_base64(KEY_A).unwrap();

        let converted = to_ssh_key(&offered).unwrap();
        let expected = burrow_auth::parse_openssh_key(&format!("ssh-ed25519 {}", KEY_A)).unwrap();

        assert_eq!(converted.key_data(), expected.key_data());
    }
}
