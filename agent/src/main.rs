//! # Reverse Tunnel Agent
//!
//! Dials the gateway, registers routing keys loaded from a rules file, and
//! forwards tunneled requests to local backends.
//!
//! ## Modules
//!
//! - [`config`]  — CLI flags, optional TOML config file, layered defaults
//! - [`rules`]   — routing key → backend URL table
//! - [`connect`] — the reconnect loop and per-tunnel read loop
//! - [`backend`] — per-exchange backend dispatch
//! - [`error`]   — `AgentError`

mod backend;
mod config;
mod connect;
mod error;
mod rules;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::config::{AgentConfig, Cli};
use crate::rules::Rules;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load(cli)?;

    let rules = Rules::load(&config.rules)
        .map_err(|e| anyhow::anyhow!("loading rules from {}: {}", config.rules.display(), e))?;
    info!(keys = ?rules.keys(), "loaded rules");

    tokio::select! {
        _ = connect::run(&config.addr, Arc::new(rules), Duration::from_secs(config.reconnect_secs)) => {}
        _ = shutdown_signal() => info!("shutdown signal received, exiting without draining"),
    }

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or, on Unix, SIGTERM. There is no graceful
/// shutdown protocol: this only unblocks `main`'s `select!`, it does not
/// wait for any in-flight exchange being handled by the current tunnel.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
