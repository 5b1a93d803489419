//! CLI argument parsing

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use turbostream_transport::TransportProtocol;

/// Main CLI application structure
#[derive(Parser, Debug)]
#[command(
    name = "turbostream-cli",
    version,
    about = "Stream events from SSE, WebSocket and chunked HTTP endpoints",
    long_about = "TurboStream CLI connects to a streaming endpoint and prints every delivered \
                  event to stdout as one JSON line. Logs go to stderr.\n\n\
                  Configuration is layered: an optional file (--config), then TURBOSTREAM__* \
                  environment variables (e.g. TURBOSTREAM__RECONNECT__MAX_ATTEMPTS=3), then flags."
)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, env = "TURBOSTREAM_LOG", default_value = "warn")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect and print events as JSON lines
    Stream(StreamArgs),

    /// Print the effective transport configuration
    Config(ConnectionArgs),
}

/// Protocol selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProtocolArg {
    /// Server-Sent Events
    Sse,
    /// WebSocket
    Websocket,
    /// Newline-delimited JSON over chunked HTTP
    HttpStream,
}

impl From<ProtocolArg> for TransportProtocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Sse => Self::Sse,
            ProtocolArg::Websocket => Self::WebSocket,
            ProtocolArg::HttpStream => Self::HttpStream,
        }
    }
}

/// Flags that shape the transport configuration
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Endpoint URL (overrides the configured endpoint)
    #[arg(long, short = 'e', env = "TURBOSTREAM_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Extra header, repeatable
    #[arg(long = "header", short = 'H', value_name = "NAME: VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Disable automatic reconnection
    #[arg(long)]
    pub no_reconnect: bool,

    /// Log every transport event at debug level
    #[arg(long)]
    pub debug: bool,
}

/// Arguments of the `stream` subcommand
#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Wire protocol
    #[arg(long, short = 'p', value_enum, default_value = "sse")]
    pub protocol: ProtocolArg,

    /// JSON payload sent once connected
    #[arg(long, value_name = "JSON", value_parser = parse_json)]
    pub send: Option<Value>,

    /// Exit after this many events
    #[arg(long, short = 'n')]
    pub max_events: Option<usize>,
}

/// Parses `Name: value` into a header pair.
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}
