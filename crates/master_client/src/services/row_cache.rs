//! Whole-table row cache and the connector layer that enables it.
//!
//! The cache owns one slot per [`TableId`], indexed by ordinal. A slot holds
//! the current snapshot (an `IndexedSet` carrying its own lazily built
//! column maps) and an invalidation epoch. Loads are serialized per table by an
//! async lock with a double-checked "is it loaded" test, so concurrent readers
//! of a never-loaded table share one round trip.
//!
//! Invalidation bumps the epoch and drops the snapshot. A load that observes
//! a different epoch when it finishes hands its rows to its caller but does
//! not install them, so the next access reloads.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::MasterError;
use crate::models::{
    CallContext, ErasedRows, ListenerStatus, PoolStatus, Request, Response, TableId,
};
use crate::services::connector::{Connector, InvalidationReceiver};

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a snapshot
    pub hits: u64,
    /// Reads that found no usable snapshot
    pub misses: u64,
    /// Round trips made to fill a slot
    pub loads: u64,
    /// Loads not installed because the table was invalidated meanwhile
    pub discarded: u64,
    /// Invalidations applied
    pub invalidations: u64,
}

impl CacheStats {
    /// Fraction of reads served from a snapshot, as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    discarded: AtomicU64,
    invalidations: AtomicU64,
}

struct Snapshot {
    rows: ErasedRows,
    loaded_at: DateTime<Utc>,
    loaded: Instant,
    /// Copies of `rows` bound to other owners, by owner id.
    rebound: Mutex<HashMap<Uuid, ErasedRows>>,
}

struct TableSlot {
    load_lock: tokio::sync::Mutex<()>,
    snapshot: RwLock<Option<Snapshot>>,
    epoch: AtomicU64,
}

impl TableSlot {
    fn new() -> Self {
        Self {
            load_lock: tokio::sync::Mutex::new(()),
            snapshot: RwLock::new(None),
            epoch: AtomicU64::new(0),
        }
    }
}

/// Per-table snapshots of whole remote tables.
pub struct RowCache {
    slots: Box<[TableSlot]>,
    ttl: Option<Duration>,
    counters: Counters,
}

impl RowCache {
    /// Create an empty cache. Snapshots older than `ttl` are reloaded.
    pub fn new(ttl: Option<Duration>) -> Self {
        let slots = (0..TableId::COUNT).map(|_| TableSlot::new()).collect();
        Self { slots, ttl, counters: Counters::default() }
    }

    fn slot(&self, table: TableId) -> &TableSlot {
        &self.slots[table.ordinal()]
    }

    fn fresh(&self, slot: &TableSlot) -> Option<ErasedRows> {
        let snapshot = slot.snapshot.read();
        let snapshot = snapshot.as_ref()?;
        if let Some(ttl) = self.ttl {
            if snapshot.loaded.elapsed() > ttl {
                return None;
            }
        }
        Some(snapshot.rows.clone())
    }

    /// The snapshot of `table`, running `load` first if there is none.
    ///
    /// At most one `load` runs per table at a time. Waiting for another
    /// caller's load honors the call's deadline and cancellation.
    pub async fn rows<F, Fut>(
        &self,
        table: TableId,
        cx: &CallContext,
        load: F,
    ) -> Result<ErasedRows, MasterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ErasedRows, MasterError>>,
    {
        let slot = self.slot(table);
        if let Some(rows) = self.fresh(slot) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(rows);
        }

        let _guard = cx.guard("wait for table load", async { Ok(slot.load_lock.lock().await) }).await?;

        // Another caller may have loaded it while we waited.
        if let Some(rows) = self.fresh(slot) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(rows);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let epoch = slot.epoch.load(Ordering::Acquire);
        tracing::debug!(table = %table, epoch, "Loading table");

        let started = Instant::now();
        let rows = load().await?;
        self.counters.loads.fetch_add(1, Ordering::Relaxed);

        if rows.table() != table {
            return Err(MasterError::internal(format!(
                "load for {table} returned rows of {}",
                rows.table()
            )));
        }

        let mut snapshot = slot.snapshot.write();
        if slot.epoch.load(Ordering::Acquire) == epoch {
            *snapshot = Some(Snapshot {
                rows: rows.clone(),
                loaded_at: Utc::now(),
                loaded: Instant::now(),
                rebound: Mutex::new(HashMap::new()),
            });
            tracing::debug!(
                table = %table,
                rows = rows.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Table loaded"
            );
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(table = %table, "Table invalidated during load, not caching result");
        }
        Ok(rows)
    }

    /// The current snapshot of `table`, without loading.
    pub fn peek(&self, table: TableId) -> Option<ErasedRows> {
        self.fresh(self.slot(table))
    }

    /// The copy of `rows` bound to `owner`, built at most once per snapshot.
    ///
    /// Rows that are not the current snapshot of `table` are rebound on every
    /// call.
    pub fn rebound<F>(&self, table: TableId, rows: &ErasedRows, owner: Uuid, rebind: F) -> ErasedRows
    where
        F: FnOnce() -> ErasedRows,
    {
        let snapshot = self.slot(table).snapshot.read();
        match snapshot.as_ref() {
            Some(current) if current.rows.ptr_eq(rows) => {
                current.rebound.lock().entry(owner).or_insert_with(rebind).clone()
            }
            _ => rebind(),
        }
    }

    /// Whether `table` has a snapshot.
    pub fn is_loaded(&self, table: TableId) -> bool {
        self.slot(table).snapshot.read().is_some()
    }

    /// When the current snapshot of `table` was loaded.
    pub fn last_loaded(&self, table: TableId) -> Option<DateTime<Utc>> {
        self.slot(table).snapshot.read().as_ref().map(|s| s.loaded_at)
    }

    /// Discard the snapshot of `table` and its column maps.
    pub fn invalidate(&self, table: TableId) {
        let had = self.discard(table);
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(table = %table, had_snapshot = had, "Table invalidated");
    }

    /// Discard every snapshot. Counts one invalidation per table that held
    /// one.
    pub fn clear(&self) {
        let cleared = TableId::ALL.iter().filter(|table| self.discard(**table)).count();
        self.counters.invalidations.fetch_add(cleared as u64, Ordering::Relaxed);
        tracing::debug!(cleared, "Row cache cleared");
    }

    /// Bump the epoch and drop the snapshot. True if there was one.
    fn discard(&self, table: TableId) -> bool {
        let slot = self.slot(table);
        let mut snapshot = slot.snapshot.write();
        slot.epoch.fetch_add(1, Ordering::AcqRel);
        snapshot.take().is_some()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Layer that serves whole-table loads from a [`RowCache`].
///
/// Subscribes to the inner connector's invalidation pushes on first load.
/// Dropping the layer stops the subscription task.
pub struct CachingConnector {
    inner: Arc<dyn Connector>,
    cache: Arc<RowCache>,
    subscription: Mutex<Option<CancellationToken>>,
}

impl CachingConnector {
    pub fn new(inner: Arc<dyn Connector>, ttl: Option<Duration>) -> Self {
        Self { inner, cache: Arc::new(RowCache::new(ttl)), subscription: Mutex::new(None) }
    }

    fn ensure_subscribed(&self) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }
        let stop = CancellationToken::new();
        let receiver = self.inner.subscribe();
        tokio::spawn(apply_invalidations(receiver, Arc::downgrade(&self.cache), stop.clone()));
        *subscription = Some(stop);
    }
}

async fn apply_invalidations(
    mut receiver: InvalidationReceiver,
    cache: Weak<RowCache>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = receiver.recv() => event,
        };
        let Some(cache) = cache.upgrade() else { break };
        match event {
            Ok(tables) => {
                for table in tables {
                    cache.invalidate(table);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Missed invalidation pushes, clearing row cache");
                cache.clear();
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!("Row cache invalidation subscription ended");
}

impl Drop for CachingConnector {
    fn drop(&mut self) {
        if let Some(stop) = self.subscription.get_mut().take() {
            stop.cancel();
        }
    }
}

#[async_trait]
impl Connector for CachingConnector {
    fn id(&self) -> Uuid {
        self.inner.id()
    }

    async fn execute(&self, request: Request, cx: &CallContext) -> Result<Response, MasterError> {
        match &request {
            Request::GetTable { decoder } => {
                let table = decoder.table();
                self.ensure_subscribed();
                let inner = &self.inner;
                let rows = self
                    .cache
                    .rows(table, cx, || async move {
                        inner.execute(request, cx).await?.into_rows()
                    })
                    .await?;
                Ok(Response::Rows(rows))
            }
            Request::Invalidate { tables, .. } => {
                let tables = tables.clone();
                let result = self.inner.execute(request, cx).await;
                for table in tables {
                    self.cache.invalidate(table);
                }
                result
            }
            Request::Ping | Request::GetRow { .. } => self.inner.execute(request, cx).await,
        }
    }

    fn subscribe(&self) -> InvalidationReceiver {
        self.inner.subscribe()
    }

    fn describe(&self) -> String {
        format!("cache({})", self.inner.describe())
    }

    fn cache(&self) -> Option<Arc<RowCache>> {
        Some(self.cache.clone())
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        self.inner.pool_status()
    }

    fn listener_status(&self) -> ListenerStatus {
        self.inner.listener_status()
    }
}
