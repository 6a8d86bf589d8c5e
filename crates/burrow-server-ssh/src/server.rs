//! SSH server implementation

use crate::config::{load_or_generate_host_key, SshServerConfig};
use crate::handler::SshSessionHandler;
use crate::SshServerError;
use burrow_auth::KeyAuthenticator;
use burrow_broker::TunnelBroker;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, Instrument};

/// SSH front end of the broker
pub struct SshServer {
    config: SshServerConfig,
    broker: Arc<TunnelBroker>,
    authenticator: Arc<dyn KeyAuthenticator>,
}

impl SshServer {
    pub fn new(
        config: SshServerConfig,
        broker: Arc<TunnelBroker>,
        authenticator: Arc<dyn KeyAuthenticator>,
    ) -> Self {
        Self {
            config,
            broker,
            authenticator,
        }
    }

    /// Start the SSH server
    pub async fn start(&self) -> Result<(), SshServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| SshServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            })?;

        self.serve(listener).await
    }

    /// Accept SSH connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SshServerError> {
        let host_key = load_or_generate_host_key(&self.config.host_key_path)?;
        let russh_config = Arc::new(self.config.russh_config(host_key));
        let local_addr = listener.local_addr()?;

        info!("SSH server listening on {}", local_addr);

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted SSH connection from {}", peer_addr);
                    let handler = SshSessionHandler::new(
                        self.broker.clone(),
                        self.authenticator.clone(),
                        peer_addr,
                    );
                    let config = russh_config.clone();
                    let span = tracing::debug_span!("ssh", peer = %peer_addr);

                    tokio::spawn(
                        Self::handle_connection(config, socket, peer_addr, handler)
                            .instrument(span),
                    );
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        config: Arc<russh::server::Config>,
        socket: TcpStream,
        peer_addr: SocketAddr,
        handler: SshSessionHandler,
    ) {
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let session = match russh::server::run_stream(config, socket, handler).await {
            Ok(session) => session,
            Err(e) => {
                debug!("SSH handshake with {} failed: {}", peer_addr, e);
                return;
            }
        };

        match session.await {
            Ok(()) => debug!("SSH connection from {} closed", peer_addr),
            Err(e) => debug!("SSH connection from {} ended: {}", peer_addr, e),
        }
    }
}
