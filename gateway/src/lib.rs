//! # Reverse Tunnel Gateway
//!
//! Terminates public HTTP/HTTPS and dispatches between the tunnel-upgrade
//! endpoint and the retransmit catch-all.
//!
//! ## Modules
//!
//! - [`config`]   — CLI flags, optional TOML config file, layered defaults
//! - [`state`]    — the agent registry and pending-response table
//! - [`handlers`] — tunnel upgrade, retransmit, and status endpoints
//! - [`error`]    — `GatewayError`
//! - [`tls`]      — PEM cert/key loading for optional TLS

pub mod config;
pub mod error;
pub mod handlers;
pub mod state;
pub mod tls;

use axum::routing::{any, get};
use axum::Router;

use crate::state::AppState;

/// Builds the gateway's router against `state`. Split out from `main` so
/// integration tests can drive the full HTTP surface without spawning a
/// separate process.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/_rehook/client", get(handlers::tunnel_upgrade_handler))
        .route("/_rehook/status", get(handlers::status_handler))
        .route("/{*path}", any(handlers::retransmit_handler))
        .route("/", any(handlers::retransmit_handler))
        .with_state(state)
}
