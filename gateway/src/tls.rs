//! # TLS Acceptor
//!
//! Loads a PEM certificate/key pair into a `tokio_rustls::TlsAcceptor`.
//! Used only when `--cert`/`--key` are supplied; the gateway otherwise
//! serves plain HTTP.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::GatewayError;

pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, GatewayError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, GatewayError> {
    let file = File::open(path).map_err(GatewayError::Io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("reading cert {}: {}", path.display(), e)))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, GatewayError> {
    let file = File::open(path).map_err(GatewayError::Io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GatewayError::Tls(format!("reading key {}: {}", path.display(), e)))?
        .ok_or_else(|| GatewayError::Tls(format!("no private key found in {}", path.display())))
}
