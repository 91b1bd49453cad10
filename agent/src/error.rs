//! # Agent Errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to connect to gateway: {0}")]
    Connect(String),

    #[error("failed to read register rules: {0}")]
    Rules(String),

    #[error("tunnel read error: {0}")]
    TunnelRead(String),

    #[error("tunnel write error")]
    TunnelWrite,

    #[error("backend dial failed for key {key}: {source}")]
    BackendDial { key: String, source: std::io::Error },

    #[error("no backend rule registered for key {0}")]
    NoRule(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] tunnel_protocol::ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
