//! The connector capability shared by the base transport and every layer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::MasterError;
use crate::models::{CallContext, ListenerStatus, PoolStatus, Request, Response, TableId};
use crate::services::RowCache;

/// Tables named by one invalidation push.
pub type InvalidationReceiver = broadcast::Receiver<Vec<TableId>>;

/// Executes requests against one master.
///
/// Layers wrap an inner connector and implement this same trait, so any
/// enabled subset composes without inner layers knowing they are wrapped.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Identity of the underlying transport.
    fn id(&self) -> Uuid;

    /// Run one request/response exchange.
    async fn execute(&self, request: Request, cx: &CallContext) -> Result<Response, MasterError>;

    /// Receive invalidation pushes. Starts the listener if it is not running.
    fn subscribe(&self) -> InvalidationReceiver;

    /// Chain description, outermost layer first.
    fn describe(&self) -> String;

    /// The row cache, if a cache layer is in the chain.
    fn cache(&self) -> Option<Arc<RowCache>> {
        None
    }

    /// Session pool status of the base transport.
    fn pool_status(&self) -> Option<PoolStatus> {
        None
    }

    /// State of the invalidation listener.
    fn listener_status(&self) -> ListenerStatus {
        ListenerStatus::Stopped
    }
}
