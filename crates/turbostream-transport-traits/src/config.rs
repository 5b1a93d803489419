//! Transport configuration types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::error::{TransportError, TransportResult};

/// Upper bound of the uniform jitter added to a reconnect delay, as a fraction of it.
pub const JITTER_RATIO: f64 = 0.3;

/// Reconnection policy for unexpected disconnects.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether to reconnect automatically at all.
    pub enabled: bool,

    /// Maximum number of retries after the initial attempt.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_delay: Duration,

    /// Growth factor applied per consecutive attempt.
    pub backoff_multiplier: f64,

    /// Ceiling for any computed delay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,

    /// Widen each delay by up to [`JITTER_RATIO`] to avoid synchronized retries.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    /// A policy that never reconnects.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based) using the configured initial delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_from(self.initial_delay, attempt)
    }

    /// Delay before retry number `attempt` (1-based) starting from `base`.
    ///
    /// `min(base * multiplier^attempt, max_delay)`, optionally widened by
    /// jitter and capped again, so the result never exceeds `max_delay`.
    pub fn delay_from(&self, base: Duration, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let max_secs = self.max_delay.as_secs_f64();
        let mut secs = (base.as_secs_f64() * self.backoff_multiplier.powi(exponent)).min(max_secs);
        if self.jitter {
            secs = (secs + secs * JITTER_RATIO * fastrand::f64()).min(max_secs);
        }
        if !secs.is_finite() || secs < 0.0 {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Eviction policy applied when a [`MessageBuffer`](crate::MessageBuffer) is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BufferStrategy {
    /// Discard the oldest queued item to make room.
    #[default]
    DropOldest,
    /// Refuse the incoming item.
    DropNewest,
    /// Refuse the incoming item; the producer waits for space and retries.
    Block,
    /// No bound at all.
    Unlimited,
}

/// Message buffer policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum number of queued events.
    pub max_size: usize,

    /// What to do when the buffer is full.
    pub strategy: BufferStrategy,

    /// Fraction of `max_size` at which backpressure is signaled.
    pub high_water_mark: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            strategy: BufferStrategy::DropOldest,
            high_water_mark: 0.8,
        }
    }
}

impl BufferConfig {
    /// The high-water mark as an absolute item count.
    pub fn high_water_count(&self) -> usize {
        high_water_count(self.max_size, self.high_water_mark)
    }
}

pub(crate) fn high_water_count(max_size: usize, fraction: f64) -> usize {
    let count = (max_size as f64 * fraction).floor() as usize;
    count.clamp(1, max_size.max(1))
}

/// Event-stream specific options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SseOptions {
    /// Keep and replay cookies set by the endpoint.
    pub with_credentials: bool,

    /// Resumption identifier to send on the first connect.
    pub last_event_id: Option<String>,
}

/// How binary socket frames are turned into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BinaryType {
    /// Decode the frame as UTF-8 JSON, exactly like a text frame.
    #[default]
    Json,
    /// Deliver `{"type": "binary", "data": "<base64>"}`.
    Base64,
}

/// Socket specific options.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketOptions {
    /// Sub-protocols offered during the handshake.
    pub protocols: Vec<String>,

    /// Binary frame handling.
    pub binary_type: BinaryType,

    /// Liveness ping period. `None` disables the heartbeat.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub heartbeat_interval: Option<Duration>,
}

/// Chunked-HTTP specific options.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpStreamOptions {
    /// Largest slice of body bytes processed between backpressure checks.
    pub chunk_size: usize,

    /// Use one request per poll instead of a persistent body.
    pub long_polling: bool,

    /// Pause between polls.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub long_polling_interval: Duration,

    /// When set, streams and polls are opened with a JSON `POST` of this body.
    pub request_body: Option<serde_json::Value>,
}

impl Default for HttpStreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            long_polling: false,
            long_polling_interval: Duration::from_millis(1000),
            request_body: None,
        }
    }
}

/// Caller-supplied override of the default retry eligibility.
///
/// Receives the error and the number of retries already made.
#[derive(Clone)]
pub struct RetryPredicate(Arc<dyn Fn(&TransportError, u32) -> bool + Send + Sync>);

impl RetryPredicate {
    /// Wraps a predicate closure.
    pub fn new(predicate: impl Fn(&TransportError, u32) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Evaluates the predicate.
    pub fn should_retry(&self, error: &TransportError, attempt: u32) -> bool {
        (self.0)(error, attempt)
    }
}

impl fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryPredicate(..)")
    }
}

/// Connection parameters for a single transport.
///
/// Created once at construction. The only runtime change a transport makes is
/// the server-suggested retry interval, which it tracks separately.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Target address. `http(s)` schemes are rewritten to `ws(s)` for sockets.
    pub endpoint: String,

    /// Attached to every request and handshake.
    pub headers: HashMap<String, String>,

    /// Reconnection policy.
    pub reconnect: ReconnectConfig,

    /// Per-connect-attempt deadline.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,

    /// Message buffer policy.
    pub buffer: BufferConfig,

    /// Event-stream options.
    pub sse: SseOptions,

    /// Socket options.
    pub websocket: WebSocketOptions,

    /// Chunked-HTTP options.
    pub http_stream: HttpStreamOptions,

    /// Log every emitted event.
    pub debug: bool,

    /// Override of default retry eligibility.
    #[serde(skip)]
    pub should_retry: Option<RetryPredicate>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            headers: HashMap::new(),
            reconnect: ReconnectConfig::default(),
            timeout: Duration::from_millis(30_000),
            buffer: BufferConfig::default(),
            sse: SseOptions::default(),
            websocket: WebSocketOptions::default(),
            http_stream: HttpStreamOptions::default(),
            debug: false,
            should_retry: None,
        }
    }
}

impl TransportConfig {
    /// Creates a configuration for `endpoint` with defaults everywhere else.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replaces the reconnection policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Replaces the buffer policy.
    pub fn with_buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = buffer;
        self
    }

    /// Sets the per-connect-attempt deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Installs a retry eligibility override.
    pub fn with_retry_predicate(
        mut self,
        predicate: impl Fn(&TransportError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(RetryPredicate::new(predicate));
        self
    }

    /// Enables per-event debug logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Checks the configuration for values no transport can work with.
    pub fn validate(&self) -> TransportResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(TransportError::Configuration(
                "endpoint must not be empty".to_string(),
            ));
        }
        if self.buffer.strategy != BufferStrategy::Unlimited && self.buffer.max_size == 0 {
            return Err(TransportError::Configuration(
                "buffer.max_size must be greater than zero".to_string(),
            ));
        }
        if !(self.buffer.high_water_mark > 0.0 && self.buffer.high_water_mark <= 1.0) {
            return Err(TransportError::Configuration(format!(
                "buffer.high_water_mark must be within (0, 1], got {}",
                self.buffer.high_water_mark
            )));
        }
        let multiplier = self.reconnect.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(TransportError::Configuration(format!(
                "reconnect.backoff_multiplier must be a finite value >= 1.0, got {multiplier}"
            )));
        }
        if self.http_stream.chunk_size == 0 {
            return Err(TransportError::Configuration(
                "http_stream.chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(TransportError::Configuration(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.websocket.heartbeat_interval == Some(Duration::ZERO) {
            return Err(TransportError::Configuration(
                "websocket.heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
