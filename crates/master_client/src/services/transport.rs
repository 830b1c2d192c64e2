//! The native TCP transport: the base of every connector chain.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::MasterError;
use crate::models::{CallContext, ListenerStatus, MasterConfig, PoolStatus, Request, Response};
use crate::protocol::{Command, Status, WireReader, WireWriter};
use crate::services::connector::{Connector, InvalidationReceiver};
use crate::services::listener::{InvalidationListener, ListenerSettings};
use crate::services::pool::{Session, SessionPool, SessionSettings};

/// Runs requests over pooled sessions and owns the invalidation listener.
pub struct TcpConnector {
    pool: Arc<SessionPool>,
    listener: InvalidationListener,
}

impl TcpConnector {
    /// Create a connector for a validated configuration.
    ///
    /// Opens no session; the first call does.
    pub fn new(config: &MasterConfig) -> Result<Self, MasterError> {
        Self::with_settings(
            SessionSettings::from_config(config)?,
            config.pool_size,
            ListenerSettings::from_config(config),
        )
    }

    /// Create a connector from already resolved settings.
    pub fn with_settings(
        session: SessionSettings,
        pool_size: usize,
        listener: ListenerSettings,
    ) -> Result<Self, MasterError> {
        let pool = Arc::new(SessionPool::new(session, pool_size)?);
        let listener = InvalidationListener::new(pool.clone(), listener);
        Ok(Self { pool, listener })
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        self.listener.shutdown();
        self.pool.shutdown();
    }
}

/// Write one request and read its whole response.
///
/// Marks the session as mid-exchange until the final status frame is read, so
/// an abandoned exchange is never reused.
async fn exchange(session: &mut Session, request: &Request) -> Result<Response, MasterError> {
    let mut frame = WireWriter::new();
    request.encode(&mut frame);

    session.begin_exchange();
    session.send(frame.freeze()).await?;

    let command = request.command();
    let mut sink = request.decoder().map(|decoder| decoder.start(session.version()));
    let mut received = 0usize;

    loop {
        let frame = session.recv().await?;
        let mut reader = WireReader::new(&frame);
        match Status::from_byte(reader.read_u8()?)? {
            Status::Next => {
                let Some(sink) = sink.as_mut() else {
                    return Err(MasterError::decode(format!("unexpected row in {command} response")));
                };
                if command == Command::GetRow && received == 1 {
                    return Err(MasterError::decode("more than one row in GET_ROW response"));
                }
                sink.push(&mut reader)?;
                reader.finish()?;
                received += 1;
            }
            Status::Done => {
                reader.finish()?;
                session.end_exchange();
                return Ok(match sink {
                    Some(sink) => Response::Rows(sink.finish()),
                    None => Response::Done,
                });
            }
            Status::Error => {
                let code = reader.read_u32()?;
                let message = reader.read_utf()?;
                reader.finish()?;
                session.end_exchange();
                return Err(MasterError::protocol(code, message, command, request.table()));
            }
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn id(&self) -> Uuid {
        self.pool.id()
    }

    async fn execute(&self, request: Request, cx: &CallContext) -> Result<Response, MasterError> {
        let mut session = self.pool.acquire(cx).await?;
        let session_id = session.id();

        let result = cx.guard(request.command().as_str(), exchange(&mut session, &request)).await;

        match &result {
            Err(e) if e.is_transport() => {
                tracing::warn!(
                    session_id = %session_id,
                    command = %request.command(),
                    error = %e,
                    "Transport failure, discarding session"
                );
                session.mark_broken();
            }
            Err(e) if e.is_timeout() || e.is_cancelled() => {
                tracing::debug!(session_id = %session_id, command = %request.command(), "Call abandoned");
            }
            _ => {}
        }
        self.pool.release(session);
        result
    }

    fn subscribe(&self) -> InvalidationReceiver {
        self.listener.subscribe()
    }

    fn describe(&self) -> String {
        "tcp".to_string()
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        Some(self.pool.status())
    }

    fn listener_status(&self) -> ListenerStatus {
        self.listener.status()
    }
}
