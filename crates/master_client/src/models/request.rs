//! Requests, responses and per-call context.
//!
//! Requests for rows carry a type-erased [`RowDecoder`] so that every layer of
//! the connector chain, including the base transport, can be object-safe while
//! rows are still decoded into their concrete type as frames arrive.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::MasterError;
use crate::models::{validate_columns, Owner, Record, Row, TableId, Value};
use crate::protocol::{Command, ProtocolVersion, WireReader, WireWriter};
use crate::services::IndexedSet;

/// Cancellation and deadline for one call.
///
/// Cloning shares the cancellation token, so cancelling any clone cancels the
/// call everywhere it propagated to.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context with no deadline and a fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context driven by an existing token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel, deadline: None }
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now. A timeout too large to represent
    /// leaves the call without a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    /// A copy whose deadline is the earlier of the current one and `timeout`
    /// from now.
    pub fn narrowed(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(existing), Some(candidate)) => Some(existing.min(candidate)),
            (existing, candidate) => existing.or(candidate),
        };
        Self { cancel: self.cancel.clone(), deadline }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of the call.
    pub fn cancel(&self) {
        tracing::debug!("Call cancellation requested");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for cancellation.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Run `future` until it finishes, the call is cancelled, or the deadline
    /// passes, whichever comes first.
    pub async fn guard<T, F>(&self, operation: &str, future: F) -> Result<T, MasterError>
    where
        F: Future<Output = Result<T, MasterError>>,
    {
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MasterError::cancelled(operation)),
            _ = sleep_until(self.deadline) => {
                Err(MasterError::timeout(operation, started.elapsed().as_millis() as u64))
            }
            result = future => result,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One call to the master.
#[derive(Clone)]
pub enum Request {
    /// Round-trip check.
    Ping,
    /// Load a whole table.
    GetTable {
        /// Decodes the table's rows.
        decoder: Arc<dyn RowDecoder>,
    },
    /// Load one row by primary key.
    GetRow {
        /// Primary key value.
        key: Value,
        /// Decodes the row.
        decoder: Arc<dyn RowDecoder>,
    },
    /// Tell the master that tables changed.
    Invalidate {
        /// Tables to invalidate.
        tables: Vec<TableId>,
        /// Restrict to one daemon server, if set.
        server: Option<String>,
    },
}

impl Request {
    /// Load every row of `R`'s table.
    pub fn get_table<R: Row>(decoder: Arc<TypedDecoder<R>>) -> Self {
        Self::GetTable { decoder }
    }

    pub fn command(&self) -> Command {
        match self {
            Self::Ping => Command::Ping,
            Self::GetTable { .. } => Command::GetTable,
            Self::GetRow { .. } => Command::GetRow,
            Self::Invalidate { .. } => Command::Invalidate,
        }
    }

    /// Table addressed by the request, if any.
    pub fn table(&self) -> Option<TableId> {
        match self {
            Self::GetTable { decoder } | Self::GetRow { decoder, .. } => Some(decoder.table()),
            Self::Ping | Self::Invalidate { .. } => None,
        }
    }

    /// Whether the call may be repeated after a transport failure.
    pub fn is_idempotent(&self) -> bool {
        self.command().is_idempotent()
    }

    /// The decoder for row-returning requests.
    pub fn decoder(&self) -> Option<&Arc<dyn RowDecoder>> {
        match self {
            Self::GetTable { decoder } | Self::GetRow { decoder, .. } => Some(decoder),
            Self::Ping | Self::Invalidate { .. } => None,
        }
    }

    /// Write the command frame.
    pub fn encode(&self, out: &mut WireWriter) {
        out.write_varint(self.command().ordinal());
        match self {
            Self::Ping => {}
            Self::GetTable { decoder } => {
                out.write_varint(decoder.table().ordinal() as u64);
            }
            Self::GetRow { key, decoder } => {
                out.write_varint(decoder.table().ordinal() as u64);
                key.encode(out);
            }
            Self::Invalidate { tables, server } => {
                out.write_varint(tables.len() as u64);
                for table in tables {
                    out.write_varint(table.ordinal() as u64);
                }
                out.write_nullable_utf(server.as_deref());
            }
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping => f.write_str("Ping"),
            Self::GetTable { decoder } => {
                f.debug_struct("GetTable").field("table", &decoder.table()).finish()
            }
            Self::GetRow { key, decoder } => f
                .debug_struct("GetRow")
                .field("table", &decoder.table())
                .field("key", key)
                .finish(),
            Self::Invalidate { tables, server } => f
                .debug_struct("Invalidate")
                .field("tables", tables)
                .field("server", server)
                .finish(),
        }
    }
}

/// Result of one call.
#[derive(Debug, Clone)]
pub enum Response {
    /// The command completed without rows.
    Done,
    /// Decoded rows.
    Rows(ErasedRows),
}

impl Response {
    /// Extract the rows of a row-returning call.
    pub fn into_rows(self) -> Result<ErasedRows, MasterError> {
        match self {
            Self::Rows(rows) => Ok(rows),
            Self::Done => Err(MasterError::internal("expected rows, got DONE")),
        }
    }
}

/// Decodes the rows of one table as frames arrive.
pub trait RowDecoder: Send + Sync {
    /// Table the decoder reads.
    fn table(&self) -> TableId;

    /// Begin decoding one response under `version`.
    fn start(&self, version: ProtocolVersion) -> Box<dyn RowSink>;
}

/// Accumulates decoded rows for one response.
pub trait RowSink: Send {
    /// Decode one row from a `NEXT` frame.
    fn push(&mut self, input: &mut WireReader<'_>) -> Result<(), MasterError>;

    /// Finish and hand back the rows in arrival order.
    fn finish(self: Box<Self>) -> ErasedRows;
}

/// An [`IndexedSet`] with its row type erased.
#[derive(Clone)]
pub struct ErasedRows {
    table: TableId,
    len: usize,
    set: Arc<dyn Any + Send + Sync>,
}

impl ErasedRows {
    pub fn new<R: Row>(set: IndexedSet<R>) -> Self {
        Self { table: R::TABLE, len: set.len(), set: Arc::new(set) }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Recover the typed set.
    pub fn downcast<R: Row>(&self) -> Result<IndexedSet<R>, MasterError> {
        self.set.downcast_ref::<IndexedSet<R>>().cloned().ok_or_else(|| {
            MasterError::internal(format!(
                "rows of {} requested as {}",
                self.table,
                std::any::type_name::<R>()
            ))
        })
    }

    /// Whether both handles share one decoded snapshot.
    pub fn ptr_eq(&self, other: &ErasedRows) -> bool {
        Arc::ptr_eq(&self.set, &other.set)
    }
}

impl fmt::Debug for ErasedRows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedRows").field("table", &self.table).field("len", &self.len).finish()
    }
}

/// Decoder for one concrete row type, binding rows to an owner as they arrive.
pub struct TypedDecoder<R> {
    owner: Option<Owner>,
    _row: PhantomData<fn() -> R>,
}

impl<R: Row> TypedDecoder<R> {
    /// Create a decoder, checking the row type's column list first.
    pub fn new(owner: Option<Owner>) -> Result<Self, MasterError> {
        validate_columns(R::TABLE, R::columns())?;
        Ok(Self { owner, _row: PhantomData })
    }

    pub fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }
}

impl<R: Row> RowDecoder for TypedDecoder<R> {
    fn table(&self) -> TableId {
        R::TABLE
    }

    fn start(&self, version: ProtocolVersion) -> Box<dyn RowSink> {
        Box::new(TypedSink::<R> { version, owner: self.owner.clone(), rows: Vec::new() })
    }
}

struct TypedSink<R> {
    version: ProtocolVersion,
    owner: Option<Owner>,
    rows: Vec<Arc<Record<R>>>,
}

impl<R: Row> RowSink for TypedSink<R> {
    fn push(&mut self, input: &mut WireReader<'_>) -> Result<(), MasterError> {
        let row = R::decode(input, self.version)?;
        let record = match &self.owner {
            Some(owner) => Record::with_owner(row, owner.clone()),
            None => Record::new(row),
        };
        self.rows.push(Arc::new(record));
        Ok(())
    }

    fn finish(self: Box<Self>) -> ErasedRows {
        ErasedRows::new(IndexedSet::from_ordered(self.rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Business, Package};

    #[tokio::test]
    async fn test_guard_reports_timeout_distinctly() {
        let cx = CallContext::new().with_timeout(Duration::from_millis(10));
        let err = cx
            .guard("sleep", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, MasterError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_guard_reports_cancellation() {
        let cx = CallContext::new();
        cx.cancel();
        let err = cx.guard("noop", async { Ok::<_, MasterError>(()) }).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_external_token_cancels_call() {
        let token = CancellationToken::new();
        let cx = CallContext::with_cancel(token.clone());
        assert!(!cx.cancel_token().is_cancelled());

        token.cancel();
        let err = cx
            .guard("sleep", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, MasterError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_absolute_deadline_is_kept() {
        let at = Instant::now() + Duration::from_secs(1);
        let cx = CallContext::new().with_deadline(at);
        assert_eq!(cx.deadline(), Some(at));
        assert_eq!(cx.narrowed(Duration::from_secs(60)).deadline(), Some(at));
    }

    #[test]
    fn test_unrepresentable_timeout_means_no_deadline() {
        let huge = crate::models::TimeUnit::Days.to_duration(u64::MAX);
        assert!(CallContext::new().with_timeout(huge).deadline().is_none());

        let tight = CallContext::new().with_timeout(Duration::from_millis(5));
        assert_eq!(tight.narrowed(huge).deadline(), tight.deadline());
        assert!(CallContext::new().narrowed(huge).deadline().is_none());
    }

    #[test]
    fn test_narrowed_keeps_earlier_deadline() {
        let tight = CallContext::new().with_timeout(Duration::from_millis(5));
        let narrowed = tight.narrowed(Duration::from_secs(60));
        assert_eq!(narrowed.deadline(), tight.deadline());
    }

    #[test]
    fn test_typed_decoder_decodes_and_binds() {
        let owner = Owner::detached();
        let decoder = TypedDecoder::<Package>::new(Some(owner.clone())).unwrap();
        let mut sink = decoder.start(ProtocolVersion::CURRENT);

        let mut w = WireWriter::new();
        Package::new(5, "alpha", 1).encode(&mut w, ProtocolVersion::CURRENT);
        let frame = w.freeze();
        let mut r = WireReader::new(&frame);
        sink.push(&mut r).unwrap();
        r.finish().unwrap();

        let rows = sink.finish();
        assert_eq!(rows.table(), TableId::Packages);
        let set = rows.downcast::<Package>().unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.as_slice()[0].is_owned_by(&owner));
        assert!(rows.downcast::<Business>().is_err());
    }

    #[test]
    fn test_invalidate_request_encoding() {
        let request = Request::Invalidate {
            tables: vec![TableId::Packages, TableId::Businesses],
            server: None,
        };
        assert!(!request.is_idempotent());

        let mut w = WireWriter::new();
        request.encode(&mut w);
        let frame = w.freeze();
        let mut r = WireReader::new(&frame);
        assert_eq!(r.read_varint().unwrap(), Command::Invalidate.ordinal());
        assert_eq!(r.read_varint().unwrap(), 2);
        assert_eq!(r.read_varint().unwrap(), TableId::Packages.ordinal() as u64);
        assert_eq!(r.read_varint().unwrap(), TableId::Businesses.ordinal() as u64);
        assert_eq!(r.read_nullable_utf().unwrap(), None);
        r.finish().unwrap();
    }
}
