//! Protocol tag to constructor map.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use turbostream_transport_traits::{
    Transport, TransportConfig, TransportError, TransportProtocol, TransportResult,
};

use crate::http_stream::HttpStreamTransport;
use crate::sse::SseTransport;
use crate::websocket::WebSocketTransport;

/// Builds a transport from its configuration.
pub type TransportFactory =
    Arc<dyn Fn(TransportConfig) -> TransportResult<Arc<dyn Transport>> + Send + Sync>;

/// Constructors keyed by protocol.
#[derive(Clone)]
pub struct TransportRegistry {
    factories: HashMap<TransportProtocol, TransportFactory>,
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TransportRegistry {
    /// A registry with no constructors.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in constructor for every protocol.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(TransportProtocol::Sse, |config| {
            Ok(Arc::new(SseTransport::new(config)?) as Arc<dyn Transport>)
        });
        registry.register(TransportProtocol::WebSocket, |config| {
            Ok(Arc::new(WebSocketTransport::new(config)?) as Arc<dyn Transport>)
        });
        registry.register(TransportProtocol::HttpStream, |config| {
            Ok(Arc::new(HttpStreamTransport::new(config)?) as Arc<dyn Transport>)
        });
        registry
    }

    /// Installs `factory` for `protocol`, returning the constructor it replaced.
    pub fn register<F>(&mut self, protocol: TransportProtocol, factory: F) -> Option<TransportFactory>
    where
        F: Fn(TransportConfig) -> TransportResult<Arc<dyn Transport>> + Send + Sync + 'static,
    {
        self.factories.insert(protocol, Arc::new(factory))
    }

    /// Protocols that can be constructed, in canonical order.
    pub fn protocols(&self) -> Vec<TransportProtocol> {
        TransportProtocol::ALL
            .into_iter()
            .filter(|p| self.factories.contains_key(p))
            .collect()
    }

    /// Builds a transport for `protocol`.
    pub fn create(
        &self,
        protocol: TransportProtocol,
        config: TransportConfig,
    ) -> TransportResult<Arc<dyn Transport>> {
        let factory = self.factories.get(&protocol).ok_or_else(|| {
            TransportError::Configuration(format!("No transport registered for '{protocol}'"))
        })?;
        factory(config)
    }
}
