//! # Tunnel Protocol
//!
//! Shared wire schema between the `gateway` and `agent` binaries:
//! - [`frame`] — the two JSON frame kinds exchanged over the tunnel
//!   (`Register`, `Retransmit`)
//! - [`http_wire`] — a canonical HTTP/1.1 writer/reader so a request or
//!   response can be carried inside a `Retransmit` frame's `body` and
//!   reconstructed byte-for-byte on the other side
//! - [`error`] — the error type both directions of the codec return
//!
//! Both binaries depend on this crate so the frame schema and HTTP
//! wire form can never drift between the two sides of the tunnel.

pub mod error;
pub mod frame;
pub mod http_wire;

pub use error::ProtocolError;
pub use frame::Frame;
pub use http_wire::{HttpRequestWire, HttpResponseWire};
