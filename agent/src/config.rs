//! # Agent Configuration
//!
//! Same CLI-flag > config-file > default layering as the gateway (§10.2).

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "agent", about = "Reverse HTTP tunnel agent")]
pub struct Cli {
    /// Gateway tunnel URL, e.g. ws://example.com or wss://example.com.
    #[arg(long)]
    pub addr: Option<String>,

    /// Path to the TOML rules file mapping routing key to backend URL.
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Seconds to wait before reconnecting after a dropped tunnel.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Optional TOML config file supplying defaults for the flags above.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    addr: Option<String>,
    rules: Option<PathBuf>,
    timeout: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub addr: String,
    pub rules: PathBuf,
    pub reconnect_secs: u64,
}

const DEFAULT_RECONNECT_SECS: u64 = 5;

impl AgentConfig {
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
            .ok_or_else(|| anyhow::anyhow!("--addr is required (no default gateway URL)"))?;
        let rules = cli
            .rules
            .or(file.rules)
            .ok_or_else(|| anyhow::anyhow!("--rules is required (no default rules file)"))?;
        let reconnect_secs = cli.timeout.or(file.timeout).unwrap_or(DEFAULT_RECONNECT_SECS);

        Ok(Self {
            addr,
            rules,
            reconnect_secs,
        })
    }
}
