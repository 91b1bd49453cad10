//! # Gateway Errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no tunnel registered for key")]
    NoTunnel,

    #[error("retransmit timed out")]
    Timeout,

    #[error("tunnel disconnected while exchange was in flight")]
    TunnelClosed,

    #[error("failed to read register frame: {0}")]
    RegisterRead(String),

    #[error("frame was not a register frame")]
    NotRegister,

    #[error("failed to serialize request: {0}")]
    Serialize(#[from] tunnel_protocol::ProtocolError),

    #[error("failed to write frame to tunnel")]
    TunnelWrite,

    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
