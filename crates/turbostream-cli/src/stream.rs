//! The `stream` command: connect and print events as JSON lines.

use std::io::Write;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use turbostream_transport::{
    Transport, TransportConfig, TransportEvent, TransportProtocol, TransportState,
    create_transport,
};

use crate::cli::StreamArgs;
use crate::error::{CliError, CliResult};
use crate::settings;

/// How often the state is polled to notice a stream that gave up retrying.
const SETTLE_CHECK: Duration = Duration::from_millis(50);

/// What to do once connected.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub protocol: TransportProtocol,
    pub send: Option<Value>,
    pub max_events: Option<usize>,
}

/// Why a stream ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The remote signaled completion.
    Done,
    /// The transport was closed.
    Closed,
    /// `max_events` events were printed.
    LimitReached,
}

/// Runs the `stream` subcommand against stdout.
pub async fn execute(args: StreamArgs) -> CliResult<()> {
    let config = settings::resolve(&args.connection)?;
    let options = StreamOptions {
        protocol: args.protocol.into(),
        send: args.send,
        max_events: args.max_events,
    };

    let mut stdout = std::io::stdout();
    tokio::select! {
        outcome = stream_to(config, &options, &mut stdout) => {
            let outcome = outcome?;
            info!("Stream finished: {:?}", outcome);
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    }
}

/// Streams from `config.endpoint`, writing one JSON line per delivered event to `out`.
///
/// # Errors
///
/// Fails when the transport cannot be built, when the optional payload cannot be
/// sent, when `out` cannot be written, or when the transport settles in the
/// error state after exhausting its retries.
pub async fn stream_to<W: Write>(
    config: TransportConfig,
    options: &StreamOptions,
    out: &mut W,
) -> CliResult<StreamOutcome> {
    info!(
        endpoint = %config.endpoint,
        protocol = %options.protocol,
        "Opening stream"
    );
    let transport = create_transport(options.protocol, config)?;
    let rx = transport.subscribe();
    let result = async {
        transport.connect().await?;
        pump(transport.as_ref(), rx, options, out).await
    }
    .await;
    transport.close();
    result
}

async fn pump<W: Write>(
    transport: &dyn Transport,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    options: &StreamOptions,
    out: &mut W,
) -> CliResult<StreamOutcome> {
    let mut pending_send = options.send.clone();
    let mut printed = 0usize;
    let mut last_error: Option<String> = None;
    let mut settle = tokio::time::interval(SETTLE_CHECK);
    settle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Events emitted during `connect` are already queued in `rx`.
    if transport.is_connected()
        && let Some(payload) = pending_send.take()
    {
        transport.send(payload).await?;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    return Ok(StreamOutcome::Closed);
                };
                match event {
                    TransportEvent::Message(message) => {
                        serde_json::to_writer(&mut *out, &message)?;
                        out.write_all(b"\n")?;
                        out.flush()?;
                        printed += 1;
                        if options.max_events.is_some_and(|max| printed >= max) {
                            return Ok(StreamOutcome::LimitReached);
                        }
                    }
                    TransportEvent::Connected => {
                        if let Some(payload) = pending_send.take() {
                            transport.send(payload).await?;
                        }
                    }
                    TransportEvent::Done => return Ok(StreamOutcome::Done),
                    TransportEvent::Closed => return Ok(StreamOutcome::Closed),
                    TransportEvent::Error(context) => {
                        warn!("{} (attempt {})", context.error, context.attempt);
                        last_error = Some(context.error.to_string());
                    }
                    other => debug!("{:?}", other),
                }
            }
            _ = settle.tick() => {
                if transport.state() == TransportState::Error && rx.is_empty() {
                    return Err(CliError::StreamFailed(
                        last_error.unwrap_or_else(|| "retries exhausted".to_string()),
                    ));
                }
            }
        }
    }
}
