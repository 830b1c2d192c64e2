//! Connector factories, the transport registry and the layer chain.
//!
//! Layer order, innermost first: transport, timeout, retry, cache, trace,
//! affinity guard. Cache sits above retry and timeout so a hit does no deadline
//! bookkeeping; trace sits above cache so it sees the composed call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::MasterError;
use crate::models::{Credentials, MasterConfig};
use crate::services::connector::Connector;
use crate::services::layers::{
    AffinityLayer, CacheLayer, Layer, RetryLayer, TimeoutLayer, TraceLayer, DEFAULT_RETRY_BACKOFF,
};
use crate::services::listener::ListenerSettings;
use crate::services::pool::SessionSettings;
use crate::services::transport::TcpConnector;

/// Registry key of the native transport.
pub const TCP_TRANSPORT: &str = "tcp";

/// Produces authenticated connectors.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// A connector acting for `credentials`.
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Connector>, MasterError>;

    /// Chain description, outermost layer first.
    fn describe(&self) -> String;
}

/// Factory for the native TCP transport.
pub struct TcpFactory {
    config: MasterConfig,
    settings: SessionSettings,
}

impl TcpFactory {
    /// Resolve session settings up front, so TLS and CA certificate problems
    /// surface here.
    pub fn new(config: MasterConfig) -> Result<Self, MasterError> {
        config.validate()?;
        let settings = SessionSettings::from_config(&config)?;
        Ok(Self { config, settings })
    }
}

#[async_trait]
impl ConnectorFactory for TcpFactory {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Connector>, MasterError> {
        let config = MasterConfig { credentials: credentials.clone(), ..self.config.clone() };
        config.validate()?;
        let settings = SessionSettings { credentials: credentials.clone(), ..self.settings.clone() };
        Ok(Arc::new(TcpConnector::with_settings(
            settings,
            config.pool_size,
            ListenerSettings::from_config(&config),
        )?))
    }

    fn describe(&self) -> String {
        TCP_TRANSPORT.to_string()
    }
}

/// Wraps every connector of a base factory in a fixed list of layers.
///
/// Connectors are memoized per credentials.
pub struct LayeredFactory {
    base: Arc<dyn ConnectorFactory>,
    layers: Vec<Arc<dyn Layer>>,
    connectors: tokio::sync::Mutex<HashMap<Credentials, Arc<dyn Connector>>>,
}

impl LayeredFactory {
    /// `layers` are applied in order, so the first is innermost.
    pub fn new(base: Arc<dyn ConnectorFactory>, layers: Vec<Arc<dyn Layer>>) -> Self {
        Self { base, layers, connectors: tokio::sync::Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl ConnectorFactory for LayeredFactory {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn Connector>, MasterError> {
        let mut connectors = self.connectors.lock().await;
        if let Some(connector) = connectors.get(credentials) {
            return Ok(connector.clone());
        }

        let mut connector = self.base.connect(credentials).await?;
        for layer in &self.layers {
            connector = layer.wrap(connector);
        }
        tracing::info!(
            user = %credentials.effective_user(),
            chain = %connector.describe(),
            "Connector created"
        );
        connectors.insert(credentials.clone(), connector.clone());
        Ok(connector)
    }

    fn describe(&self) -> String {
        self.layers
            .iter()
            .rev()
            .fold(String::new(), |acc, layer| format!("{acc}{}(", layer.name()))
            + &self.base.describe()
            + &")".repeat(self.layers.len())
    }
}

/// The layers enabled by `config`, innermost first.
pub fn layers_for(config: &MasterConfig) -> Vec<Arc<dyn Layer>> {
    let mut layers: Vec<Arc<dyn Layer>> = Vec::new();
    if let Some(timeout) = config.call_timeout() {
        layers.push(Arc::new(TimeoutLayer { timeout }));
    }
    if config.retry {
        layers.push(Arc::new(RetryLayer {
            attempts: config.retry_attempts,
            backoff: DEFAULT_RETRY_BACKOFF,
        }));
    }
    if config.cache {
        layers.push(Arc::new(CacheLayer { ttl: config.cache_ttl() }));
    }
    if config.trace {
        layers.push(Arc::new(TraceLayer));
    }
    if config.disable_ui_affinity {
        layers.push(Arc::new(AffinityLayer));
    }
    layers
}

/// Builds the base factory for one configuration.
pub type TransportProvider =
    Arc<dyn Fn(&MasterConfig) -> Result<Arc<dyn ConnectorFactory>, MasterError> + Send + Sync>;

/// Transport implementations by registry key.
pub struct TransportRegistry {
    providers: RwLock<HashMap<String, TransportProvider>>,
}

impl TransportRegistry {
    /// A registry with the native transport.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(TCP_TRANSPORT, |config| {
            Ok(Arc::new(TcpFactory::new(config.clone())?) as Arc<dyn ConnectorFactory>)
        });
        registry
    }

    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self { providers: RwLock::new(HashMap::new()) }
    }

    /// Register or replace the provider for `name`.
    pub fn register<F>(&self, name: impl Into<String>, provider: F)
    where
        F: Fn(&MasterConfig) -> Result<Arc<dyn ConnectorFactory>, MasterError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        tracing::debug!(transport = %name, "Transport registered");
        self.providers.write().insert(name, Arc::new(provider));
    }

    /// Registered keys, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// The base factory for `config.transport`.
    pub fn resolve(&self, config: &MasterConfig) -> Result<Arc<dyn ConnectorFactory>, MasterError> {
        let provider = self.providers.read().get(&config.transport).cloned();
        match provider {
            Some(provider) => provider(config),
            None => {
                tracing::error!(transport = %config.transport, "Unsupported transport");
                Err(MasterError::unsupported_transport(config.transport.clone(), self.names()))
            }
        }
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry").field("transports", &self.names()).finish()
    }
}

/// Validate `config`, resolve its transport and wrap it in its layers.
///
/// Fails before any connection is attempted.
pub fn build_factory(
    config: &MasterConfig,
    registry: &TransportRegistry,
) -> Result<Arc<dyn ConnectorFactory>, MasterError> {
    config.validate()?;
    let base = registry.resolve(config)?;
    Ok(Arc::new(LayeredFactory::new(base, layers_for(config))))
}

/// Memoizes factories per distinct configuration.
#[derive(Default)]
pub struct FactoryCache {
    factories: Mutex<HashMap<MasterConfig, Arc<dyn ConnectorFactory>>>,
}

impl FactoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The factory for `config`, building it on first request.
    pub fn get_or_build(
        &self,
        config: &MasterConfig,
        registry: &TransportRegistry,
    ) -> Result<Arc<dyn ConnectorFactory>, MasterError> {
        let mut factories = self.factories.lock();
        if let Some(factory) = factories.get(config) {
            return Ok(factory.clone());
        }
        let factory = build_factory(config, registry)?;
        factories.insert(config.clone(), factory.clone());
        Ok(factory)
    }

    pub fn len(&self) -> usize {
        self.factories.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
