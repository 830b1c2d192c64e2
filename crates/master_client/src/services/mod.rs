//! Services for the master client.
//!
//! - `indexed_set` - IndexedSet, immutable ordered rows with lazy column maps
//! - `connector` - the Connector trait every layer implements
//! - `pool` - sessions and the deadpool-backed session pool
//! - `transport` - TcpConnector, the base of every chain
//! - `listener` - background receiver for invalidation pushes
//! - `row_cache` - per-table snapshots and the caching layer
//! - `layers` - timeout, retry, trace and UI-affinity layers
//! - `factory` - connector factories, transport registry and layer assembly

pub mod connector;
pub mod factory;
pub mod indexed_set;
pub mod layers;
pub mod listener;
pub mod pool;
pub mod row_cache;
pub mod transport;

pub use connector::{Connector, InvalidationReceiver};
pub use factory::{
    build_factory, layers_for, ConnectorFactory, FactoryCache, LayeredFactory, TcpFactory,
    TransportProvider, TransportRegistry, TCP_TRANSPORT,
};
pub use indexed_set::{IndexedSet, ListIndex, UniqueIndex};
pub use layers::{
    is_current_thread_restricted, set_current_thread_restricted, AffinityGuardConnector,
    AffinityLayer, CacheLayer, Layer, RetryConnector, RetryLayer, TimeoutConnector, TimeoutLayer,
    TraceConnector, TraceLayer, DEFAULT_RETRY_BACKOFF,
};
pub use listener::{InvalidationListener, ListenerSettings};
pub use pool::{PooledSession, Session, SessionPool, SessionSettings};
pub use row_cache::{CacheStats, CachingConnector, RowCache};
pub use transport::TcpConnector;
