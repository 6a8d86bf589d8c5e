//! HTTP side of the tunnel broker
//!
//! A single route, `/?id=<token>`, claims a waiting session and streams what
//! the operator types as the response body.
pub mod handler;
pub mod server;

pub use handler::{router, TunnelQuery, INVALID_TUNNEL_ID, MISSING_TUNNEL_ID, TUNNEL_NOT_FOUND};
pub use server::{HttpServer, HttpServerConfig, HttpServerError};
