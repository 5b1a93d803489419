//! # TurboStream CLI
//!
//! Command-line client for TurboStream transports. Connects to an event-stream,
//! WebSocket or chunked-HTTP endpoint and prints every delivered event to stdout
//! as one JSON line, so the output can be piped into `jq` and friends.
//!
//! ```bash
//! turbostream-cli stream --endpoint https://api.example.com/v1/stream \
//!     --protocol sse -H 'Authorization: Bearer $TOKEN' --max-events 10
//!
//! turbostream-cli config --config stream.toml
//! ```
//!
//! Logs are written to stderr through `tracing-subscriber`; `RUST_LOG` takes
//! precedence over `--log-level`.

pub mod cli;
pub mod error;
pub mod settings;
pub mod stream;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use cli::{Cli, Commands, ConnectionArgs, ProtocolArg, StreamArgs};
pub use error::{CliError, CliResult, ErrorCategory};
pub use stream::{StreamOptions, StreamOutcome, stream_to};

/// Parses arguments, installs logging and runs the selected command.
///
/// # Errors
///
/// Returns the first error raised by configuration loading or by the command.
pub async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs)?;

    match cli.command {
        Commands::Stream(args) => stream::execute(args).await,
        Commands::Config(args) => {
            let config = settings::apply(settings::load(args.config.as_deref())?, &args);
            if let Err(e) = config.validate() {
                tracing::warn!("Configuration is not usable yet: {}", e);
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging(level: &str, json: bool) -> CliResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| CliError::Logging(format!("Invalid log level: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
    };
    result.map_err(|e| CliError::Logging(e.to_string()))
}
