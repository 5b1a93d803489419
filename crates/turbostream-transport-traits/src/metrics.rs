//! Transport metrics types.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::types::{TransportProtocol, TransportState};

/// Number of latency samples retained for the rolling mean.
pub const LATENCY_SAMPLE_LIMIT: usize = 100;

/// A serializable snapshot of a transport's counters.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMetrics {
    /// Transport identifier.
    pub transport_id: String,

    /// Wire protocol.
    pub protocol: TransportProtocol,

    /// State at snapshot time.
    pub state: TransportState,

    /// Time since the current connection was established.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub connection_duration: Option<Duration>,

    /// Payloads written to the remote.
    pub messages_sent: u64,

    /// Events delivered to listeners.
    pub messages_received: u64,

    /// Errors observed, recovered or not.
    pub errors: u64,

    /// Current reconnect attempt counter.
    pub reconnect_attempts: u32,

    /// Events waiting in the buffer.
    pub buffer_size: usize,

    /// Mean of the retained latency samples, in milliseconds.
    pub average_latency_ms: Option<f64>,

    /// Display form of the most recent error.
    pub last_error: Option<String>,
}

/// Health classification of one transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportHealth {
    /// Transport identifier.
    pub transport_id: String,

    /// Wire protocol.
    pub protocol: TransportProtocol,

    /// State at check time.
    pub state: TransportState,

    /// `true` iff the transport is connected.
    pub healthy: bool,

    /// Errors observed so far.
    pub errors: u64,

    /// Display form of the most recent error.
    pub last_error: Option<String>,
}

impl TransportHealth {
    /// Derives a health record from a metrics snapshot.
    pub fn from_metrics(metrics: &TransportMetrics) -> Self {
        Self {
            transport_id: metrics.transport_id.clone(),
            protocol: metrics.protocol,
            state: metrics.state,
            healthy: metrics.state == TransportState::Connected,
            errors: metrics.errors,
            last_error: metrics.last_error.clone(),
        }
    }
}

/// Rolling window of the most recent latency samples.
#[derive(Debug, Clone, Default)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
}

impl LatencyWindow {
    /// Creates an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample, discarding the oldest past [`LATENCY_SAMPLE_LIMIT`].
    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == LATENCY_SAMPLE_LIMIT {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of the retained samples in milliseconds, `None` when empty.
    pub fn mean_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        Some(total / self.samples.len() as f64)
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when no sample was recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_window_is_bounded() {
        let mut window = LatencyWindow::new();
        assert_eq!(window.mean_ms(), None);

        for _ in 0..LATENCY_SAMPLE_LIMIT {
            window.record(Duration::from_millis(1000));
        }
        for _ in 0..LATENCY_SAMPLE_LIMIT {
            window.record(Duration::from_millis(10));
        }

        assert_eq!(window.len(), LATENCY_SAMPLE_LIMIT);
        let mean = window.mean_ms().unwrap();
        assert!((mean - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_from_metrics() {
        let metrics = TransportMetrics {
            transport_id: "sse-1".into(),
            protocol: TransportProtocol::Sse,
            state: TransportState::Reconnecting,
            connection_duration: None,
            messages_sent: 0,
            messages_received: 4,
            errors: 2,
            reconnect_attempts: 1,
            buffer_size: 0,
            average_latency_ms: None,
            last_error: Some("Connection lost: eof".into()),
        };
        let health = TransportHealth::from_metrics(&metrics);
        assert!(!health.healthy);
        assert_eq!(health.errors, 2);

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["state"], "reconnecting");
        assert_eq!(json["protocol"], "sse");
    }
}
