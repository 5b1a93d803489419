//! Transport event types and the typed listener registry.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ErrorContext;

/// One decoded inbound event, as handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Decoded payload. Undecodable text is carried as a JSON string.
    pub data: serde_json::Value,

    /// Protocol-level event name (`event:` field, socket `type`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// Protocol-level sequence identifier (`id:` field).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StreamEvent {
    /// Creates an event carrying only a payload.
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            event_type: None,
            id: None,
        }
    }

    /// Sets the event name.
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the sequence identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Represents events that occur within a transport's lifecycle.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A connection attempt started.
    Connecting {
        /// Retry number, `0` for a caller-initiated attempt.
        attempt: u32,
    },

    /// The connection is established.
    Connected,

    /// A retry has been scheduled.
    Reconnecting {
        /// Retry number, starting at 1.
        attempt: u32,
        /// Delay before the retry runs.
        delay: Duration,
        /// Configured retry budget.
        max_attempts: u32,
    },

    /// An inbound event left the buffer.
    Message(StreamEvent),

    /// The remote signaled the end of the stream.
    Done,

    /// A recoverable error was observed.
    Error(ErrorContext),

    /// The transport was closed.
    Closed,

    /// Buffer occupancy crossed the high-water mark upward.
    Backpressure {
        /// Occupancy after the push.
        buffer_size: usize,
        /// Buffer capacity.
        buffer_limit: usize,
        /// High-water mark as an item count.
        high_water_mark: usize,
    },

    /// Buffer occupancy fell back below the high-water mark.
    Drain,
}

/// Discriminant of [`TransportEvent`], used to subscribe to one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// See [`TransportEvent::Connecting`].
    Connecting,
    /// See [`TransportEvent::Connected`].
    Connected,
    /// See [`TransportEvent::Reconnecting`].
    Reconnecting,
    /// See [`TransportEvent::Message`].
    #[serde(rename = "event")]
    Message,
    /// See [`TransportEvent::Done`].
    Done,
    /// See [`TransportEvent::Error`].
    Error,
    /// See [`TransportEvent::Closed`].
    Closed,
    /// See [`TransportEvent::Backpressure`].
    Backpressure,
    /// See [`TransportEvent::Drain`].
    Drain,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Message => "event",
            Self::Done => "done",
            Self::Error => "error",
            Self::Closed => "closed",
            Self::Backpressure => "backpressure",
            Self::Drain => "drain",
        };
        f.write_str(name)
    }
}

/// An event that belongs to exactly one category.
pub trait Categorized {
    /// The category type.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// The category of this event.
    fn kind(&self) -> Self::Kind;
}

impl Categorized for TransportEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            Self::Connecting { .. } => EventKind::Connecting,
            Self::Connected => EventKind::Connected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Message(_) => EventKind::Message,
            Self::Done => EventKind::Done,
            Self::Error(_) => EventKind::Error,
            Self::Closed => EventKind::Closed,
            Self::Backpressure { .. } => EventKind::Backpressure,
            Self::Drain => EventKind::Drain,
        }
    }
}

/// Callback invoked synchronously for each matching event.
pub type EventListener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`ListenerRegistry::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration<E: Categorized> {
    id: ListenerId,
    kind: Option<E::Kind>,
    listener: EventListener<E>,
}

impl<E: Categorized> Clone for Registration<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            listener: Arc::clone(&self.listener),
        }
    }
}

struct Listeners<E: Categorized> {
    callbacks: Vec<Registration<E>>,
    subscribers: Vec<mpsc::UnboundedSender<E>>,
}

/// Per-category listener registry.
///
/// Listeners run on the emitting task with no registry lock held, so a
/// listener may register or remove listeners (including itself).
pub struct ListenerRegistry<E: Categorized> {
    inner: RwLock<Listeners<E>>,
    next_id: AtomicU64,
}

impl<E: Categorized> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Categorized> fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &inner.callbacks.len())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl<E: Categorized> ListenerRegistry<E> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Listeners {
                callbacks: Vec::new(),
                subscribers: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `listener` for events of `kind`.
    pub fn on(&self, kind: E::Kind, listener: EventListener<E>) -> ListenerId {
        self.insert(Some(kind), listener)
    }

    /// Registers `listener` for every event.
    pub fn on_any(&self, listener: EventListener<E>) -> ListenerId {
        self.insert(None, listener)
    }

    fn insert(&self, kind: Option<E::Kind>, listener: EventListener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.write().callbacks.push(Registration { id, kind, listener });
        id
    }

    /// Unregisters a listener. Returns `false` when the id is unknown.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.write();
        let before = inner.callbacks.len();
        inner.callbacks.retain(|registration| registration.id != id);
        inner.callbacks.len() != before
    }

    /// Opens a channel receiving a clone of every event.
    ///
    /// The sender is pruned on the first emit after the receiver is dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().subscribers.push(tx);
        rx
    }

    /// Removes every listener and subscriber.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.callbacks.clear();
        inner.subscribers.clear();
    }

    /// Number of registered callbacks and live subscribers.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.callbacks.len() + inner.subscribers.len()
    }

    /// Returns `true` when nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Categorized + Clone> ListenerRegistry<E> {
    /// Delivers `event` to matching listeners, then to subscribers.
    pub fn emit(&self, event: &E) {
        let kind = event.kind();
        let (matching, has_subscribers) = {
            let inner = self.inner.read();
            let matching: Vec<EventListener<E>> = inner
                .callbacks
                .iter()
                .filter(|registration| registration.kind.is_none_or(|k| k == kind))
                .map(|registration| Arc::clone(&registration.listener))
                .collect();
            (matching, !inner.subscribers.is_empty())
        };

        for listener in matching {
            listener(event);
        }

        if has_subscribers {
            let mut inner = self.inner.write();
            inner
                .subscribers
                .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(TransportEvent::Connected.kind(), EventKind::Connected);
        assert_eq!(
            TransportEvent::Message(StreamEvent::new(json!(1))).kind(),
            EventKind::Message
        );
        assert_eq!(EventKind::Message.to_string(), "event");
    }

    #[test]
    fn test_listeners_filter_by_kind() {
        let registry = ListenerRegistry::<TransportEvent>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        registry.on(
            EventKind::Done,
            Arc::new(move |event: &TransportEvent| sink.lock().push(event.kind())),
        );
        let sink = Arc::clone(&seen);
        registry.on_any(Arc::new(move |event: &TransportEvent| {
            sink.lock().push(event.kind());
        }));

        registry.emit(&TransportEvent::Connected);
        registry.emit(&TransportEvent::Done);

        assert_eq!(
            *seen.lock(),
            vec![EventKind::Connected, EventKind::Done, EventKind::Done]
        );
    }

    #[test]
    fn test_off_removes_listener() {
        let registry = ListenerRegistry::<TransportEvent>::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let id = registry.on_any(Arc::new(move |_: &TransportEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(&TransportEvent::Drain);
        assert!(registry.off(id));
        assert!(!registry.off(id));
        registry.emit(&TransportEvent::Drain);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_reenter_registry() {
        let registry = Arc::new(ListenerRegistry::<TransportEvent>::new());
        let weak = Arc::downgrade(&registry);
        registry.on(
            EventKind::Closed,
            Arc::new(move |_: &TransportEvent| {
                if let Some(registry) = weak.upgrade() {
                    registry.clear();
                }
            }),
        );
        registry.emit(&TransportEvent::Closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_receive_and_prune() {
        let registry = ListenerRegistry::<TransportEvent>::new();
        let mut rx = registry.subscribe();
        let dropped = registry.subscribe();
        drop(dropped);

        registry.emit(&TransportEvent::Connected);
        assert!(matches!(rx.recv().await, Some(TransportEvent::Connected)));
        assert_eq!(registry.len(), 1);
    }
}
