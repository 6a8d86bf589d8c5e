//! HTTP server hosting the hand-off route

use crate::handler::router;
use axum::Router;
use burrow_broker::TunnelBroker;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// HTTP server errors
#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
        }
    }
}

/// HTTP hand-off server
pub struct HttpServer {
    config: HttpServerConfig,
    broker: Arc<TunnelBroker>,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, broker: Arc<TunnelBroker>) -> Self {
        Self { config, broker }
    }

    pub fn build_router(&self) -> Router {
        router(self.broker.clone())
    }

    /// Bind and serve until the listener fails
    pub async fn start(self) -> Result<(), HttpServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| HttpServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            })?;

        info!(
            "HTTP hand-off server listening on {}",
            listener.local_addr()?
        );

        axum::serve(listener, self.build_router()).await?;

        Ok(())
    }
}
