//! Connector layers: timeout, retry, tracing and UI-affinity guarding.
//!
//! Each layer wraps an `Arc<dyn Connector>` and is itself a `Connector`. The
//! caching layer lives with the row cache in `row_cache`.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::MasterError;
use crate::models::{CallContext, ListenerStatus, PoolStatus, Request, Response};
use crate::services::connector::{Connector, InvalidationReceiver};
use crate::services::row_cache::{CachingConnector, RowCache};

/// First delay between retry attempts; doubles per attempt.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Wraps a connector in one more layer.
pub trait Layer: Send + Sync {
    fn name(&self) -> &'static str;

    fn wrap(&self, inner: Arc<dyn Connector>) -> Arc<dyn Connector>;
}

/// Forward the non-call methods of `Connector` to `self.inner`.
macro_rules! delegate_connector {
    () => {
        fn id(&self) -> Uuid {
            self.inner.id()
        }

        fn subscribe(&self) -> InvalidationReceiver {
            self.inner.subscribe()
        }

        fn cache(&self) -> Option<Arc<RowCache>> {
            self.inner.cache()
        }

        fn pool_status(&self) -> Option<PoolStatus> {
            self.inner.pool_status()
        }

        fn listener_status(&self) -> ListenerStatus {
            self.inner.listener_status()
        }
    };
}

// ========== Timeout ==========

/// Bounds every call, including the wait for a session, by a deadline.
pub struct TimeoutConnector {
    inner: Arc<dyn Connector>,
    timeout: Duration,
}

impl TimeoutConnector {
    pub fn new(inner: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl Connector for TimeoutConnector {
    delegate_connector!();

    async fn execute(&self, request: Request, cx: &CallContext) -> Result<Response, MasterError> {
        let bounded = cx.narrowed(self.timeout);
        let operation = request.command().as_str();
        bounded.guard(operation, self.inner.execute(request, &bounded)).await
    }

    fn describe(&self) -> String {
        format!("timeout({})", self.inner.describe())
    }
}

pub struct TimeoutLayer {
    pub timeout: Duration,
}

impl Layer for TimeoutLayer {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn wrap(&self, inner: Arc<dyn Connector>) -> Arc<dyn Connector> {
        Arc::new(TimeoutConnector::new(inner, self.timeout))
    }
}

// ========== Retry ==========

/// Repeats idempotent calls that failed with a transient error.
pub struct RetryConnector {
    inner: Arc<dyn Connector>,
    attempts: u32,
    backoff: Duration,
}

impl RetryConnector {
    pub fn new(inner: Arc<dyn Connector>, attempts: u32, backoff: Duration) -> Self {
        Self { inner, attempts: attempts.max(1), backoff }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1 << attempt.saturating_sub(1).min(10))
    }
}

#[async_trait]
impl Connector for RetryConnector {
    delegate_connector!();

    async fn execute(&self, request: Request, cx: &CallContext) -> Result<Response, MasterError> {
        if !request.is_idempotent() {
            return self.inner.execute(request, cx).await;
        }

        let mut attempt = 1;
        loop {
            match self.inner.execute(request.clone(), cx).await {
                Err(e) if e.is_transient() && attempt < self.attempts && !cx.is_cancelled() => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        command = %request.command(),
                        table = ?request.table(),
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Retrying after transient failure"
                    );
                    cx.guard("retry backoff", async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn describe(&self) -> String {
        format!("retry({})", self.inner.describe())
    }
}

pub struct RetryLayer {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Layer for RetryLayer {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn wrap(&self, inner: Arc<dyn Connector>) -> Arc<dyn Connector> {
        Arc::new(RetryConnector::new(inner, self.attempts, self.backoff))
    }
}

// ========== Cache ==========

pub struct CacheLayer {
    pub ttl: Option<Duration>,
}

impl Layer for CacheLayer {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn wrap(&self, inner: Arc<dyn Connector>) -> Arc<dyn Connector> {
        Arc::new(CachingConnector::new(inner, self.ttl))
    }
}

// ========== Trace ==========

/// Logs every call with its outcome and duration.
pub struct TraceConnector {
    inner: Arc<dyn Connector>,
}

impl TraceConnector {
    pub fn new(inner: Arc<dyn Connector>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Connector for TraceConnector {
    delegate_connector!();

    async fn execute(&self, request: Request, cx: &CallContext) -> Result<Response, MasterError> {
        let command = request.command();
        let table = request.table();
        let span = tracing::debug_span!(
            "master_call",
            connector_id = %self.inner.id(),
            command = %command,
            table = ?table,
        );

        async move {
            let started = Instant::now();
            let result = self.inner.execute(request, cx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(Response::Rows(rows)) => {
                    tracing::debug!(rows = rows.len(), elapsed_ms, "Call completed");
                }
                Ok(Response::Done) => tracing::debug!(elapsed_ms, "Call completed"),
                Err(e) => tracing::debug!(
                    elapsed_ms,
                    category = e.category(),
                    error = %e,
                    "Call failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    fn describe(&self) -> String {
        format!("trace({})", self.inner.describe())
    }
}

pub struct TraceLayer;

impl Layer for TraceLayer {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn wrap(&self, inner: Arc<dyn Connector>) -> Arc<dyn Connector> {
        Arc::new(TraceConnector::new(inner))
    }
}

// ========== UI affinity ==========

thread_local! {
    static RESTRICTED: Cell<bool> = const { Cell::new(false) };
}

/// Mark or unmark the current thread as one that must never wait on the
/// master (typically a UI event thread).
pub fn set_current_thread_restricted(restricted: bool) {
    RESTRICTED.with(|flag| flag.set(restricted));
}

pub fn is_current_thread_restricted() -> bool {
    RESTRICTED.with(Cell::get)
}

/// Rejects calls driven from a restricted thread.
pub struct AffinityGuardConnector {
    inner: Arc<dyn Connector>,
}

impl AffinityGuardConnector {
    pub fn new(inner: Arc<dyn Connector>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Connector for AffinityGuardConnector {
    delegate_connector!();

    async fn execute(&self, request: Request, cx: &CallContext) -> Result<Response, MasterError> {
        if is_current_thread_restricted() {
            tracing::error!(command = %request.command(), "Master call from a restricted thread");
            return Err(MasterError::affinity(format!(
                "{} must not run on a restricted thread",
                request.command()
            )));
        }
        self.inner.execute(request, cx).await
    }

    fn describe(&self) -> String {
        format!("affinity({})", self.inner.describe())
    }
}

pub struct AffinityLayer;

impl Layer for AffinityLayer {
    fn name(&self) -> &'static str {
        "affinity"
    }

    fn wrap(&self, inner: Arc<dyn Connector>) -> Arc<dyn Connector> {
        Arc::new(AffinityGuardConnector::new(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TableId, TypedDecoder};
    use crate::testing::{FakeConnector, Package};

    fn get_packages() -> Request {
        Request::get_table(Arc::new(TypedDecoder::<Package>::new(None).unwrap()))
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 1)]);
        fake.fail_next(2, || MasterError::transport("reset"));
        let retry = RetryConnector::new(fake.clone(), 3, Duration::from_millis(1));

        retry.execute(get_packages(), &CallContext::new()).await.unwrap();
        assert_eq!(fake.calls(TableId::Packages), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let fake = Arc::new(FakeConnector::new());
        fake.fail_next(5, || MasterError::transport("reset"));
        let retry = RetryConnector::new(fake.clone(), 3, Duration::from_millis(1));

        let err = retry.execute(get_packages(), &CallContext::new()).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(fake.calls(TableId::Packages), 3);
    }

    #[tokio::test]
    async fn test_retry_skips_non_idempotent_and_protocol_errors() {
        let fake = Arc::new(FakeConnector::new());
        let retry = RetryConnector::new(fake.clone(), 3, Duration::from_millis(1));
        let cx = CallContext::new();

        fake.fail_next(1, || MasterError::transport("reset"));
        let invalidate = Request::Invalidate { tables: vec![TableId::Packages], server: None };
        assert!(retry.execute(invalidate, &cx).await.is_err());
        assert!(fake.invalidations().is_empty());

        fake.fail_next(1, || {
            MasterError::protocol(9, "denied", crate::protocol::Command::GetTable, None)
        });
        assert!(retry.execute(get_packages(), &cx).await.is_err());
        assert_eq!(fake.calls(TableId::Packages), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_and_not_retried() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 1)]);
        fake.set_delay(Duration::from_secs(5));
        let timeout: Arc<dyn Connector> =
            Arc::new(TimeoutConnector::new(fake.clone(), Duration::from_millis(20)));
        let retry = RetryConnector::new(timeout, 3, Duration::from_millis(1));

        let err = retry.execute(get_packages(), &CallContext::new()).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(fake.calls(TableId::Packages), 1);
    }

    #[tokio::test]
    async fn test_huge_timeout_behaves_as_unbounded() {
        let fake = Arc::new(FakeConnector::new());
        let huge = crate::models::TimeUnit::Days.to_duration(u64::MAX);
        let timeout = TimeoutConnector::new(fake.clone(), huge);

        timeout.execute(Request::Ping, &CallContext::new()).await.unwrap();
        assert_eq!(fake.pings(), 1);
    }

    #[tokio::test]
    async fn test_affinity_guard_rejects_restricted_thread() {
        let fake = Arc::new(FakeConnector::new());
        let guard = AffinityGuardConnector::new(fake.clone());

        set_current_thread_restricted(true);
        let err = guard.execute(Request::Ping, &CallContext::new()).await.unwrap_err();
        set_current_thread_restricted(false);

        assert!(matches!(err, MasterError::Affinity { .. }));
        guard.execute(Request::Ping, &CallContext::new()).await.unwrap();
        assert_eq!(fake.pings(), 1);
    }

    #[tokio::test]
    async fn test_trace_passes_results_through() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 1)]);
        let trace = TraceConnector::new(fake.clone());

        let rows = trace.execute(get_packages(), &CallContext::new()).await.unwrap().into_rows();
        assert_eq!(rows.unwrap().len(), 1);
        assert_eq!(trace.describe(), "trace(fake)");
    }
}
