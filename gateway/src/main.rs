//! # Reverse Tunnel Gateway — entry point
//!
//! Parses CLI/config, builds the router from the [`gateway`] library, and
//! serves it either plain or behind TLS using a manual hyper-util accept
//! loop (axum's built-in `serve` has no TLS hook).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use gateway::config::{Cli, GatewayConfig};
use gateway::state::AppState;
use gateway::{build_router, tls};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tower::Service;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::load(cli)?;

    let addr: SocketAddr = config
        .addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --addr {}: {}", config.addr, e))?;

    let state = AppState::new(Duration::from_secs(config.timeout_secs));
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;

    if config.tls_enabled() {
        let cert = config.cert.clone().expect("tls_enabled implies cert is set");
        let key = config
            .key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--cert was given without --key"))?;
        let acceptor = tls::load_acceptor(&cert, &key)?;
        info!(%addr, "gateway listening (tls)");
        tokio::select! {
            _ = serve_tls(listener, acceptor, app) => {}
            _ = shutdown_signal() => info!("shutdown signal received, exiting without draining"),
        }
    } else {
        info!(%addr, "gateway listening");
        tokio::select! {
            _ = serve_plain(listener, app) => {}
            _ = shutdown_signal() => info!("shutdown signal received, exiting without draining"),
        }
    }

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or, on Unix, SIGTERM. There is no graceful
/// shutdown protocol (§5): this only unblocks `main`'s `select!`, it does
/// not wait for in-flight exchanges to drain.
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

async fn serve_plain(listener: TcpListener, app: Router) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        let app = app.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(socket);
            let service = hyper::service::service_fn(move |req| {
                let mut app = app.clone();
                async move { Ok::<_, Infallible>(app.call(req).await.unwrap()) }
            });
            if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                tracing::debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

async fn serve_tls(listener: TcpListener, acceptor: tokio_rustls::TlsAcceptor, app: Router) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_socket = match acceptor.accept(socket).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "tls handshake failed");
                    return;
                }
            };
            let io = TokioIo::new(tls_socket);
            let service = hyper::service::service_fn(move |req| {
                let mut app = app.clone();
                async move { Ok::<_, Infallible>(app.call(req).await.unwrap()) }
            });
            if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                tracing::debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}
