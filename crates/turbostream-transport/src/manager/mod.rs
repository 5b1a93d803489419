//! Transport pool with health and idle supervision.
//!
//! [`TransportManager`] constructs transports by protocol tag, caps the pool
//! size, forwards every transport event to pool observers and runs two
//! background timers: a health check and an idle sweep. Both timers hold only
//! a weak reference to the pool and stop when it is destroyed or dropped.

mod registry;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use turbostream_transport_traits::{
    Categorized, EventListener, ListenerId, ListenerRegistry, Transport, TransportConfig,
    TransportError, TransportEvent, TransportHealth, TransportMetrics, TransportProtocol,
    TransportResult, TransportState,
};

pub use registry::{TransportFactory, TransportRegistry};

/// Pool limits and supervision periods.
///
/// A zero period disables the corresponding timer.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of pooled transports.
    pub max_pool_size: usize,

    /// Period of the health check.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub health_check_interval: Duration,

    /// How long a connected transport may go without traffic before the
    /// idle sweep removes it.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_timeout: Duration,

    /// Period of the idle sweep.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_check_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 100,
            health_check_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            idle_check_interval: Duration::from_secs(60),
        }
    }
}

/// Why a transport left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalReason {
    /// `remove()`, `close_all()` or `destroy()`.
    Requested,
    /// Made room for a new transport.
    Evicted,
    /// Connected without traffic for longer than the idle timeout.
    Idle,
    /// Found closed by the idle sweep.
    Closed,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Requested => "requested",
            Self::Evicted => "evicted",
            Self::Idle => "idle",
            Self::Closed => "closed",
        };
        f.write_str(reason)
    }
}

/// Event observed on the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// An event of one pooled transport.
    Transport {
        /// Originating transport.
        transport_id: String,
        /// Its protocol.
        protocol: TransportProtocol,
        /// The forwarded event.
        event: TransportEvent,
    },
    /// A transport joined the pool.
    Added {
        /// The new transport.
        transport_id: String,
        /// Its protocol.
        protocol: TransportProtocol,
    },
    /// A transport left the pool and was closed.
    Removed {
        /// The removed transport.
        transport_id: String,
        /// Why it was removed.
        reason: RemovalReason,
    },
    /// A health check finished.
    HealthChecked {
        /// Connected transports.
        healthy: usize,
        /// Everything else.
        unhealthy: usize,
    },
}

/// Discriminant of [`PoolEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolEventKind {
    /// See [`PoolEvent::Transport`].
    Transport,
    /// See [`PoolEvent::Added`].
    Added,
    /// See [`PoolEvent::Removed`].
    Removed,
    /// See [`PoolEvent::HealthChecked`].
    HealthChecked,
}

impl Categorized for PoolEvent {
    type Kind = PoolEventKind;

    fn kind(&self) -> PoolEventKind {
        match self {
            Self::Transport { .. } => PoolEventKind::Transport,
            Self::Added { .. } => PoolEventKind::Added,
            Self::Removed { .. } => PoolEventKind::Removed,
            Self::HealthChecked { .. } => PoolEventKind::HealthChecked,
        }
    }
}

struct PoolEntry {
    transport: Arc<dyn Transport>,
    registered_at: Instant,
    forwarder: ListenerId,
}

impl PoolEntry {
    /// Eviction preference; lower goes first, `None` is never evicted.
    fn eviction_rank(&self) -> Option<u8> {
        let metrics = self.transport.metrics();
        match metrics.state {
            TransportState::Closed => Some(0),
            TransportState::Idle => Some(1),
            _ if metrics.messages_sent + metrics.messages_received == 0 => Some(2),
            _ => None,
        }
    }
}

struct ManagerInner {
    config: ManagerConfig,
    registry: TransportRegistry,
    pool: Mutex<HashMap<String, PoolEntry>>,
    listeners: ListenerRegistry<PoolEvent>,
    health: Mutex<Vec<TransportHealth>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl ManagerInner {
    fn emit(&self, event: PoolEvent) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.listeners.emit(&event);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Transport>> {
        self.pool
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.transport))
            .collect()
    }

    /// Closes a transport that has already been taken out of the pool.
    fn retire(&self, id: String, entry: PoolEntry, reason: RemovalReason) {
        entry.transport.close();
        entry.transport.off(entry.forwarder);
        info!("Removed transport {} from pool ({})", id, reason);
        self.emit(PoolEvent::Removed {
            transport_id: id,
            reason,
        });
    }

    fn remove(&self, id: &str, reason: RemovalReason) -> bool {
        let entry = self.pool.lock().remove(id);
        match entry {
            Some(entry) => {
                self.retire(id.to_string(), entry, reason);
                true
            }
            None => false,
        }
    }

    fn check_health(&self) -> Vec<TransportHealth> {
        let report: Vec<TransportHealth> = self
            .snapshot()
            .iter()
            .map(|transport| TransportHealth::from_metrics(&transport.metrics()))
            .collect();
        let healthy = report.iter().filter(|h| h.healthy).count();
        let unhealthy = report.len() - healthy;
        if unhealthy > 0 {
            warn!("Pool health check: {} healthy, {} unhealthy", healthy, unhealthy);
        } else {
            debug!("Pool health check: {} healthy", healthy);
        }
        *self.health.lock() = report.clone();
        self.emit(PoolEvent::HealthChecked { healthy, unhealthy });
        report
    }

    fn sweep_idle(&self) -> Vec<String> {
        let idle_timeout = self.config.idle_timeout;
        let stale: Vec<(String, RemovalReason)> = self
            .snapshot()
            .iter()
            .filter_map(|transport| {
                let metrics = transport.metrics();
                let reason = match metrics.state {
                    TransportState::Closed => RemovalReason::Closed,
                    TransportState::Connected
                        if metrics.messages_sent + metrics.messages_received == 0
                            && metrics
                                .connection_duration
                                .is_some_and(|connected| connected > idle_timeout) =>
                    {
                        RemovalReason::Idle
                    }
                    _ => return None,
                };
                Some((metrics.transport_id, reason))
            })
            .collect();

        stale
            .into_iter()
            .filter(|(id, reason)| self.remove(id, *reason))
            .map(|(id, _)| id)
            .collect()
    }

    fn stop_timers(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.stop_timers();
    }
}

fn spawn_timer(
    runtime: &Handle,
    period: Duration,
    weak: Weak<ManagerInner>,
    tick: fn(&ManagerInner),
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tick(&inner);
        }
    })
}

/// Pool of transports with health and idle supervision.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportManager")
            .field("config", &self.inner.config)
            .field("pooled", &self.inner.pool.lock().len())
            .field("destroyed", &self.inner.destroyed.load(Ordering::Acquire))
            .finish()
    }
}

impl TransportManager {
    /// Creates a manager with the built-in protocol constructors.
    ///
    /// Supervision timers start only when called inside a Tokio runtime.
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_registry(config, TransportRegistry::with_defaults())
    }

    /// Creates a manager that builds transports through `registry`.
    pub fn with_registry(config: ManagerConfig, registry: TransportRegistry) -> Self {
        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                pool: Mutex::new(HashMap::new()),
                listeners: ListenerRegistry::new(),
                health: Mutex::new(Vec::new()),
                timers: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            }),
        };
        manager.start_timers();
        manager
    }

    fn start_timers(&self) {
        let Ok(runtime) = Handle::try_current() else {
            debug!("No runtime available; pool supervision timers not started");
            return;
        };
        let config = &self.inner.config;
        let mut timers = self.inner.timers.lock();
        if !config.health_check_interval.is_zero() {
            timers.push(spawn_timer(
                &runtime,
                config.health_check_interval,
                Arc::downgrade(&self.inner),
                |inner| {
                    inner.check_health();
                },
            ));
        }
        if !config.idle_check_interval.is_zero() {
            timers.push(spawn_timer(
                &runtime,
                config.idle_check_interval,
                Arc::downgrade(&self.inner),
                |inner| {
                    let removed = inner.sweep_idle();
                    if !removed.is_empty() {
                        info!("Idle sweep removed {} transports", removed.len());
                    }
                },
            ));
        }
    }

    /// The pool configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Builds a transport for `protocol` and adds it to the pool.
    ///
    /// The transport is not connected. Fails with
    /// [`TransportError::PoolExhausted`] when the pool is full and nothing
    /// can be evicted.
    pub fn create_transport(
        &self,
        protocol: TransportProtocol,
        config: TransportConfig,
    ) -> TransportResult<Arc<dyn Transport>> {
        if self.is_destroyed() {
            return Err(TransportError::Closed);
        }
        let transport = self.inner.registry.create(protocol, config)?;
        if let Err(error) = self.register(Arc::clone(&transport)) {
            transport.close();
            return Err(error);
        }
        Ok(transport)
    }

    /// Adds an externally built transport to the pool.
    pub fn register(&self, transport: Arc<dyn Transport>) -> TransportResult<()> {
        if self.is_destroyed() {
            return Err(TransportError::Closed);
        }
        let id = transport.id().to_string();
        let protocol = transport.protocol();

        let weak = Arc::downgrade(&self.inner);
        let forward_id = id.clone();
        let forwarder = transport.on_any(Arc::new(move |event: &TransportEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.emit(PoolEvent::Transport {
                    transport_id: forward_id.clone(),
                    protocol,
                    event: event.clone(),
                });
            }
        }));

        let evicted = {
            let mut pool = self.inner.pool.lock();
            let admitted = if pool.contains_key(&id) {
                Err(TransportError::Configuration(format!(
                    "Transport {id} is already pooled"
                )))
            } else if pool.len() < self.inner.config.max_pool_size {
                Ok(None)
            } else {
                let victim = pool
                    .iter()
                    .filter_map(|(key, entry)| {
                        entry
                            .eviction_rank()
                            .map(|rank| (rank, entry.registered_at, key.clone()))
                    })
                    .min()
                    .map(|(_, _, key)| key);
                match victim {
                    Some(key) => Ok(pool.remove(&key).map(|entry| (key, entry))),
                    None => Err(TransportError::PoolExhausted {
                        max: self.inner.config.max_pool_size,
                    }),
                }
            };
            match admitted {
                Ok(evicted) => {
                    pool.insert(
                        id.clone(),
                        PoolEntry {
                            transport: Arc::clone(&transport),
                            registered_at: Instant::now(),
                            forwarder,
                        },
                    );
                    evicted
                }
                Err(error) => {
                    drop(pool);
                    transport.off(forwarder);
                    warn!("Rejected transport {}: {}", id, error);
                    return Err(error);
                }
            }
        };

        if let Some((victim, entry)) = evicted {
            self.inner.retire(victim, entry, RemovalReason::Evicted);
        }
        info!("Added {} transport {} to pool", protocol, id);
        self.inner.emit(PoolEvent::Added {
            transport_id: id,
            protocol,
        });
        Ok(())
    }

    /// A pooled transport by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.inner
            .pool
            .lock()
            .get(id)
            .map(|entry| Arc::clone(&entry.transport))
    }

    /// Closes and removes a transport. Returns `false` if it was not pooled.
    pub fn remove(&self, id: &str) -> bool {
        self.inner.remove(id, RemovalReason::Requested)
    }

    /// Ids of all pooled transports.
    pub fn transport_ids(&self) -> Vec<String> {
        self.inner.pool.lock().keys().cloned().collect()
    }

    /// Number of pooled transports.
    pub fn len(&self) -> usize {
        self.inner.pool.lock().len()
    }

    /// Returns `true` if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.pool.lock().is_empty()
    }

    /// Metrics of every pooled transport.
    pub fn metrics(&self) -> Vec<TransportMetrics> {
        self.inner
            .snapshot()
            .iter()
            .map(|transport| transport.metrics())
            .collect()
    }

    /// Runs a health check now. A transport is healthy iff it is connected.
    pub fn check_health(&self) -> Vec<TransportHealth> {
        self.inner.check_health()
    }

    /// Result of the most recent health check.
    pub fn last_health(&self) -> Vec<TransportHealth> {
        self.inner.health.lock().clone()
    }

    /// Runs the idle sweep now, returning the ids it removed.
    pub fn sweep_idle(&self) -> Vec<String> {
        self.inner.sweep_idle()
    }

    /// Stops both timers and closes and removes every transport.
    pub fn close_all(&self) {
        self.inner.stop_timers();
        let drained: Vec<(String, PoolEntry)> = self.inner.pool.lock().drain().collect();
        for (id, entry) in drained {
            self.inner.retire(id, entry, RemovalReason::Requested);
        }
    }

    /// Closes everything and detaches all observers. The manager emits no
    /// further events and rejects new transports.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_all();
        self.inner.listeners.clear();
        info!("Transport manager destroyed");
    }

    /// Returns `true` once [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Registers a listener for one pool event category.
    pub fn on(&self, kind: PoolEventKind, listener: EventListener<PoolEvent>) -> ListenerId {
        self.inner.listeners.on(kind, listener)
    }

    /// Registers a listener for every pool event.
    pub fn on_any(&self, listener: EventListener<PoolEvent>) -> ListenerId {
        self.inner.listeners.on_any(listener)
    }

    /// Removes a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.off(id)
    }

    /// Streams every pool event to a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PoolEvent> {
        self.inner.listeners.subscribe()
    }
}
