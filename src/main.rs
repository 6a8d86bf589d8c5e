//! Burrow - hand an SSH session's input to an HTTP request
//!
//! Operators connect over SSH and get a tunnel id; a single HTTP request to
//! `/?id=<tunnel id>` receives everything they type until they end input.

use anyhow::{Context, Result};
use burrow_auth::AuthorizedKeysFile;
use burrow_broker::{BrokerConfig, TunnelBroker};
use burrow_server_http::{HttpServer, HttpServerConfig};
use burrow_server_ssh::{SshServer, SshServerConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

/// SSH-to-HTTP tunnel broker
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Pair SSH sessions with one-shot HTTP downloads", long_about = None)]
#[command(version)]
struct Cli {
    /// SSH server bind address
    #[arg(long, env = "BURROW_SSH_ADDR", default_value = "0.0.0.0:2222")]
    ssh_addr: SocketAddr,

    /// HTTP server bind address
    #[arg(long, env = "BURROW_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// SSH host key (OpenSSH format); an Ed25519 key is generated here if missing
    #[arg(long, env = "BURROW_HOST_KEY", default_value = ".ssh_host_ed25519_key")]
    host_key: PathBuf,

    /// authorized_keys file listing operator public keys, re-read on every login
    #[arg(
        long,
        env = "BURROW_AUTHORIZED_KEYS",
        default_value = "./.authorized_keys"
    )]
    authorized_keys: PathBuf,

    /// Seconds a tunnel waits to be claimed (0 = forever)
    #[arg(long, env = "BURROW_CLAIM_TIMEOUT", default_value = "600")]
    claim_timeout: u64,

    /// Seconds an HTTP request waits for the relay to finish (0 = forever)
    #[arg(long, env = "BURROW_RELAY_TIMEOUT", default_value = "3600")]
    relay_timeout: u64,

    /// Also print the tunnel id into the SSH session
    #[arg(long, env = "BURROW_ANNOUNCE_TOKEN")]
    announce_token: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BURROW_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl Cli {
    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::default()
            .with_claim_timeout(seconds(self.claim_timeout))
            .with_relay_timeout(seconds(self.relay_timeout))
            .with_announce_token(self.announce_token)
    }

    fn ssh_config(&self) -> SshServerConfig {
        SshServerConfig {
            bind_addr: self.ssh_addr,
            host_key_path: self.host_key.clone(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    info!("Starting burrow");
    info!("SSH endpoint: {}", cli.ssh_addr);
    info!("HTTP endpoint: {}", cli.http_addr);
    info!("Authorized keys: {}", cli.authorized_keys.display());

    if !cli.authorized_keys.exists() {
        warn!(
            "Authorized keys file {} does not exist yet, every login will be refused",
            cli.authorized_keys.display()
        );
    }

    let broker = Arc::new(TunnelBroker::new(cli.broker_config()));
    let authenticator = Arc::new(AuthorizedKeysFile::new(cli.authorized_keys.clone()));

    let ssh_server = SshServer::new(cli.ssh_config(), broker.clone(), authenticator);
    let http_server = HttpServer::new(
        HttpServerConfig {
            bind_addr: cli.http_addr,
        },
        broker.clone(),
    );

    let mut ssh_handle = tokio::spawn(async move { ssh_server.start().await });
    let mut http_handle = tokio::spawn(http_server.start());

    info!("Press Ctrl+C to stop");

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping servers...");
            Ok(())
        }
        result = &mut ssh_handle => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("SSH server failed")),
                Err(e) => Err(anyhow::Error::new(e).context("SSH server task panicked")),
            }
        }
        result = &mut http_handle => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("HTTP server failed")),
                Err(e) => Err(anyhow::Error::new(e).context("HTTP server task panicked")),
            }
        }
    };

    ssh_handle.abort();
    http_handle.abort();

    if broker.pending_count() > 0 {
        info!("Dropping {} unclaimed tunnel(s)", broker.pending_count());
    }

    match &outcome {
        Ok(()) => info!("Burrow stopped"),
        Err(e) => error!("{:#}", e),
    }

    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error listening for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Error listening for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Invalid log level")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
