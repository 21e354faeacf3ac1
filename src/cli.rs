//! CLI definitions for wsrelay.

use clap::{builder::PossibleValuesParser, Parser, Subcommand};
use std::time::Duration;

use crate::buffer::DEFAULT_MAX_BUFFER_BYTES;
use crate::session::DEFAULT_MAX_RECONNECTS;

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Resumable TCP-over-WebSocket relay tunnel.
#[derive(Debug, Parser)]
#[command(name = "wsrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Listen on local TCP and tunnel clients through the relay
    Listen(ListenArgs),

    /// Check whether the relay endpoint is reachable
    Probe(ProbeArgs),

    /// Show version information
    Version,
}

/// Arguments for the listen subcommand.
#[derive(Debug, Parser)]
pub struct ListenArgs {
    /// Local TCP listen address (e.g., 127.0.0.1:2222)
    #[arg(long)]
    pub listen: String,

    /// Relay WebSocket URL (e.g., wss://relay.example/v4/connect)
    #[arg(long)]
    pub url: String,

    /// Bearer token sent in the Authorization header
    #[arg(long)]
    pub bearer_token: Option<String>,

    /// Reconnect attempts per disconnect
    #[arg(long, default_value_t = DEFAULT_MAX_RECONNECTS)]
    pub max_reconnects: u32,

    /// Initial reconnect backoff (doubles per attempt)
    #[arg(long, value_parser = parse_duration, default_value = "500ms")]
    pub reconnect_backoff: Duration,

    /// Limit on buffered unacknowledged bytes per session
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER_BYTES)]
    pub max_pending_bytes: u64,
}

/// Arguments for the probe subcommand.
#[derive(Debug, Parser)]
pub struct ProbeArgs {
    /// Relay WebSocket URL (e.g., wss://relay.example/v4/connect)
    #[arg(long)]
    pub url: String,

    /// Bearer token sent in the Authorization header
    #[arg(long)]
    pub bearer_token: Option<String>,

    /// Overall probe deadline
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    pub timeout: Duration,
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("WSRELAY_COMMIT").unwrap_or("unknown"),
            built: option_env!("WSRELAY_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "wsrelay version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}
