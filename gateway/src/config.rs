//! # Gateway Configuration
//!
//! Layered configuration: CLI flags override an optional TOML config file,
//! which overrides built-in defaults. `RUST_LOG` controls log verbosity and
//! is read directly by `tracing_subscriber`, outside this layering.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "gateway", about = "Reverse HTTP tunnel gateway")]
pub struct Cli {
    /// Address to listen on, e.g. 0.0.0.0:8080.
    #[arg(long)]
    pub addr: Option<String>,

    /// Path to a TLS certificate (PEM). TLS is enabled iff this is set.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Path to the TLS private key (PEM) matching --cert.
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Retransmit timeout in seconds. 0 means no deadline.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Optional TOML config file supplying defaults for the flags above.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    addr: Option<String>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    timeout: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: String,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub timeout_secs: u64,
}

const DEFAULT_TIMEOUT_SECS: u64 = 0;

impl GatewayConfig {
    /// Resolves CLI flags, an optional config file, and built-in defaults
    /// into a final configuration, with CLI flags taking priority.
    ///
    /// `--addr` has no built-in default: per the CLI surface's exit-code
    /// contract, a missing address is a startup error, not a silent
    /// fallback to some bind address the operator didn't ask for.
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading config file {}: {}", path.display(), e))?;
                toml::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("parsing config file {}: {}", path.display(), e))?
            }
            None => FileConfig::default(),
        };

        let addr = cli
            .addr
            .or(file.addr)
            .ok_or_else(|| anyhow::anyhow!("--addr is required (no default bind address)"))?;

        Ok(Self {
            addr,
            cert: cli.cert.or(file.cert),
            key: cli.key.or(file.key),
            timeout_secs: cli.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT_SECS),
        })
    }

    pub fn tls_enabled(&self) -> bool {
        self.cert.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_cli() -> Cli {
        Cli {
            addr: None,
            cert: None,
            key: None,
            timeout: None,
            config: None,
        }
    }

    #[test]
    fn missing_addr_with_no_config_file_is_an_error() {
        let err = GatewayConfig::load(bare_cli()).unwrap_err();
        assert!(err.to_string().contains("--addr"));
    }

    #[test]
    fn cli_addr_overrides_nothing_and_timeout_defaults_to_zero() {
        let cli = Cli {
            addr: Some("127.0.0.1:9000".to_string()),
            ..bare_cli()
        };
        let config = GatewayConfig::load(cli).unwrap();
        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.timeout_secs, 0);
        assert!(!config.tls_enabled());
    }

    #[test]
    fn cert_without_key_is_allowed_by_config_layer() {
        // main.rs rejects this combination at startup; the config layer
        // only records what was given.
        let cli = Cli {
            cert: Some(PathBuf::from("cert.pem")),
            ..bare_cli()
        };
        let err = GatewayConfig::load(cli).unwrap_err();
        assert!(err.to_string().contains("--addr"));
    }

    #[test]
    fn config_file_supplies_addr_when_cli_omits_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "addr = \"0.0.0.0:7000\"\ntimeout = 30\n").unwrap();

        let cli = Cli {
            config: Some(path),
            ..bare_cli()
        };
        let config = GatewayConfig::load(cli).unwrap();
        assert_eq!(config.addr, "0.0.0.0:7000");
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn cli_flag_takes_priority_over_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "addr = \"0.0.0.0:7000\"\n").unwrap();

        let cli = Cli {
            addr: Some("127.0.0.1:1".to_string()),
            config: Some(path),
            ..bare_cli()
        };
        let config = GatewayConfig::load(cli).unwrap();
        assert_eq!(config.addr, "127.0.0.1:1");
    }
}
