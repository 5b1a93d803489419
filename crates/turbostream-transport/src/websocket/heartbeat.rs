//! Liveness pings for socket connections.

use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{trace, warn};

use turbostream_transport_traits::TransportError;

use super::transport::Writer;
use crate::base::ConnectionContext;
use crate::network::SocketFrame;

/// Ping/pong bookkeeping for one connection.
#[derive(Debug, Default)]
pub(crate) struct Liveness {
    awaiting_since: Option<Instant>,
    last_pong: Option<Instant>,
}

impl Liveness {
    /// Notes a ping. Only the oldest unanswered ping is tracked.
    pub(crate) fn ping_sent(&mut self, at: Instant) {
        self.awaiting_since.get_or_insert(at);
    }

    /// Notes a pong and returns the round trip of the ping it answers.
    pub(crate) fn pong_received(&mut self, at: Instant) -> Option<Duration> {
        self.last_pong = Some(at);
        self.awaiting_since.take().map(|sent| at.saturating_duration_since(sent))
    }

    /// Time the oldest ping has been waiting, if it is at least `limit`.
    pub(crate) fn overdue(&self, now: Instant, limit: Duration) -> Option<Duration> {
        self.awaiting_since
            .map(|sent| now.saturating_duration_since(sent))
            .filter(|waited| *waited >= limit)
    }

    pub(crate) fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Sends a ping every `interval` and fails the connection when the oldest
/// unanswered ping is older than twice the interval.
pub(crate) async fn run_heartbeat(
    interval: Duration,
    ctx: ConnectionContext,
    writer: Writer,
    liveness: Arc<Mutex<Liveness>>,
) {
    let limit = interval * 2;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = ctx.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let overdue = liveness.lock().overdue(now, limit);
        if let Some(elapsed) = overdue {
            warn!(
                "{} missed heartbeat: no pong for {:?}",
                ctx.transport_id(),
                elapsed
            );
            ctx.connection_lost(TransportError::HeartbeatTimeout { elapsed });
            return;
        }

        let ping = json!({
            "type": "ping",
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        let result = {
            let mut guard = writer.lock().await;
            let Some(sink) = guard.as_mut() else {
                return;
            };
            sink.send(SocketFrame::Text(ping.to_string())).await
        };
        match result {
            Ok(()) => {
                trace!("{} sent heartbeat ping", ctx.transport_id());
                liveness.lock().ping_sent(now);
            }
            Err(error) => {
                ctx.connection_lost(error);
                return;
            }
        }
    }
}
