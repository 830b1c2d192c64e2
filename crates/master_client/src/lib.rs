//! Client-side connector for the master RPC server.
//!
//! The crate keeps read-mostly tables of the master in memory and keeps them
//! consistent through server-pushed invalidations:
//!
//! - **error**: MasterError with categories, hints and server codes
//! - **protocol**: Framed wire codec, command ordinals, protocol versions
//! - **models**: Tables, rows, records, requests and configuration
//! - **services**: Session pool, transport, invalidation listener, row cache,
//!   connector layers and factories
//! - **client**: The application-facing handle and typed table access
//! - **logging**: Structured logging setup

pub mod client;
pub mod error;
pub mod logging;
pub mod models;
pub mod protocol;
pub mod services;

#[cfg(test)]
mod testing;

pub use client::{Client, Table};
pub use error::{ErrorInfo, MasterError};
pub use models::{
    CallContext, ColumnDef, Credentials, IndexKind, ListenerStatus, MasterConfig, Owner,
    PoolStatus, Record, Request, Response, Row, TableId, TimeUnit, TlsConfig, Value,
};
pub use protocol::{Command, ProtocolVersion};
pub use services::{
    build_factory, CacheStats, Connector, ConnectorFactory, FactoryCache, IndexedSet,
    TransportRegistry,
};
