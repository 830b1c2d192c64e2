//! Data models for the master client.
//!
//! - `table` - TableId, the dense remote table identifier
//! - `row` - Row plug-in contract, ColumnDef, IndexKind, Value
//! - `record` - Record and Owner, value object identity
//! - `request` - Request, Response, CallContext, row decoders
//! - `connection` - MasterConfig, Credentials, TlsConfig, PoolStatus

pub mod connection;
pub mod record;
pub mod request;
pub mod row;
pub mod table;

pub use connection::{
    Credentials, ListenerStatus, MasterConfig, MasterConfigBuilder, PoolStatus, TimeUnit,
    TlsConfig,
};
pub use record::{Owner, Record};
pub use request::{
    CallContext, ErasedRows, Request, Response, RowDecoder, RowSink, TypedDecoder,
};
pub use row::{column_ordinal, validate_columns, ColumnDef, IndexKind, Row, Value};
pub use table::TableId;
