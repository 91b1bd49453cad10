//! # Protocol Errors
//!
//! Errors produced while encoding or decoding frames and the HTTP/1.1
//! wire form carried inside them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to decode frame json: {0}")]
    FrameJson(#[from] serde_json::Error),

    #[error("failed to decode base64 body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("received frame of unexpected kind")]
    UnexpectedFrameKind,

    #[error("malformed http message: {0}")]
    MalformedHttp(String),

    #[error("incomplete http message")]
    IncompleteHttp,
}
