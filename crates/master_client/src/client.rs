//! The application-facing client handle.
//!
//! A [`Client`] wraps one assembled connector and hands out typed [`Table`]
//! accessors. Every row it returns is bound to the client, so a row can find
//! its way back to sibling tables through [`crate::models::Owner::client`].

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::MasterError;
use crate::models::{
    CallContext, Credentials, ErasedRows, ListenerStatus, MasterConfig, Owner, PoolStatus, Record, Request,
    Row, TableId, TypedDecoder, Value,
};
use crate::services::{
    build_factory, CacheStats, Connector, ConnectorFactory, IndexedSet, InvalidationReceiver,
    ListIndex, TransportRegistry, UniqueIndex,
};

pub(crate) struct ClientInner {
    id: Uuid,
    connector: Arc<dyn Connector>,
    created_at: DateTime<Utc>,
}

/// Handle to the master. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Wrap an assembled connector.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let inner = ClientInner { id: Uuid::new_v4(), connector, created_at: Utc::now() };
        tracing::debug!(client_id = %inner.id, chain = %inner.connector.describe(), "Client created");
        Self { inner: Arc::new(inner) }
    }

    /// Build the layered factory for `config` and connect with its
    /// credentials.
    pub async fn connect(config: &MasterConfig) -> Result<Self, MasterError> {
        let factory = build_factory(config, &TransportRegistry::new())?;
        Self::from_factory(factory.as_ref(), &config.credentials).await
    }

    /// Connect through an existing factory.
    pub async fn from_factory(
        factory: &dyn ConnectorFactory,
        credentials: &Credentials,
    ) -> Result<Self, MasterError> {
        Ok(Self::new(factory.connect(credentials).await?))
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.inner.connector
    }

    /// The owner handle rows of this client are bound to.
    pub fn owner(&self) -> Owner {
        Owner::new(self.inner.id, Arc::downgrade(&self.inner))
    }

    /// Whether both handles are the same client.
    pub fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Typed accessor for `R`'s table.
    pub fn table<R: Row>(&self) -> Table<R> {
        Table { client: self.clone(), _row: PhantomData }
    }

    /// Bind a record obtained elsewhere to this client.
    pub fn adopt<R: Row>(&self, record: Arc<Record<R>>) -> Arc<Record<R>> {
        Record::bind(record, &self.owner())
    }

    /// Round-trip time of a PING.
    pub async fn ping(&self) -> Result<Duration, MasterError> {
        let started = Instant::now();
        self.inner.connector.execute(Request::Ping, &CallContext::new()).await?;
        Ok(started.elapsed())
    }

    /// Tell the master that `tables` changed, optionally scoped to one daemon
    /// server, and drop the local snapshots of them.
    pub async fn invalidate(
        &self,
        tables: &[TableId],
        server: Option<&str>,
    ) -> Result<(), MasterError> {
        tracing::debug!(tables = ?tables, server = ?server, "Invalidating tables");
        let request = Request::Invalidate { tables: tables.to_vec(), server: server.map(String::from) };
        self.inner.connector.execute(request, &CallContext::new()).await?;
        Ok(())
    }

    /// Drop every local snapshot.
    pub fn clear_caches(&self) {
        if let Some(cache) = self.inner.connector.cache() {
            cache.clear();
        }
    }

    /// Receive invalidation pushes for application use.
    pub fn subscribe(&self) -> InvalidationReceiver {
        self.inner.connector.subscribe()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.inner.connector.cache().map(|cache| cache.stats())
    }

    pub fn pool_status(&self) -> Option<PoolStatus> {
        self.inner.connector.pool_status()
    }

    pub fn listener_status(&self) -> ListenerStatus {
        self.inner.connector.listener_status()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("chain", &self.inner.connector.describe())
            .finish()
    }
}

/// Typed access to one remote table.
pub struct Table<R> {
    client: Client,
    _row: PhantomData<fn() -> R>,
}

impl<R: Row> Table<R> {
    pub fn id(&self) -> TableId {
        R::TABLE
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn decoder(&self) -> Result<Arc<TypedDecoder<R>>, MasterError> {
        Ok(Arc::new(TypedDecoder::new(Some(self.client.owner()))?))
    }

    /// Every row, from the cache when one is configured.
    pub async fn rows(&self) -> Result<IndexedSet<R>, MasterError> {
        self.rows_with(&CallContext::new()).await
    }

    /// Every row, honoring the deadline and cancellation of `cx`.
    pub async fn rows_with(&self, cx: &CallContext) -> Result<IndexedSet<R>, MasterError> {
        let request = Request::get_table(self.decoder()?);
        let rows = self.client.inner.connector.execute(request, cx).await?.into_rows()?;
        let set = rows.downcast::<R>()?;

        // A snapshot is decoded with one owner; it may be another client's
        // when connectors are shared.
        let owner = self.client.owner();
        match set.iter().next() {
            Some(first) if !first.is_owned_by(&owner) => match self.client.inner.connector.cache() {
                Some(cache) => cache
                    .rebound(R::TABLE, &rows, owner.id(), || ErasedRows::new(set.rebind(&owner)))
                    .downcast::<R>(),
                None => Ok(set.rebind(&owner)),
            },
            _ => Ok(set),
        }
    }

    /// The row with primary key `key`.
    pub async fn get(&self, key: &R::Key) -> Result<Option<Arc<Record<R>>>, MasterError> {
        self.get_with(key, &CallContext::new()).await
    }

    /// Served from the cached primary-key index when a cache is configured,
    /// otherwise a GET_ROW round trip.
    pub async fn get_with(
        &self,
        key: &R::Key,
        cx: &CallContext,
    ) -> Result<Option<Arc<Record<R>>>, MasterError> {
        if self.client.inner.connector.cache().is_some() {
            return self.rows_with(cx).await?.get(key);
        }

        let request = Request::GetRow { key: key.clone().into(), decoder: self.decoder()? };
        let rows = self.client.inner.connector.execute(request, cx).await?.into_rows()?;
        Ok(rows.downcast::<R>()?.as_slice().first().cloned())
    }

    /// Value-to-row map over a unique column of the current snapshot.
    pub async fn unique_index(&self, column: usize) -> Result<Arc<UniqueIndex<R>>, MasterError> {
        self.rows().await?.unique_index(column)
    }

    /// Value-to-rows map over an indexed column of the current snapshot.
    pub async fn list_index(&self, column: usize) -> Result<Arc<ListIndex<R>>, MasterError> {
        self.rows().await?.list_index(column)
    }

    pub async fn filter_unique(
        &self,
        column: usize,
        value: impl Into<Value>,
    ) -> Result<Option<Arc<Record<R>>>, MasterError> {
        self.rows().await?.filter_unique(column, &value.into())
    }

    pub async fn filter_indexed(
        &self,
        column: usize,
        value: impl Into<Value>,
    ) -> Result<IndexedSet<R>, MasterError> {
        self.rows().await?.filter_indexed(column, &value.into())
    }

    /// Drop the local snapshot of this table only.
    pub fn invalidate(&self) {
        if let Some(cache) = self.client.inner.connector.cache() {
            cache.invalidate(R::TABLE);
        }
    }

    /// When the current snapshot was loaded, if there is one.
    pub fn last_loaded(&self) -> Option<DateTime<Utc>> {
        self.client.inner.connector.cache().and_then(|cache| cache.last_loaded(R::TABLE))
    }
}

impl<R> Clone for Table<R> {
    fn clone(&self) -> Self {
        Self { client: self.client.clone(), _row: PhantomData }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::CachingConnector;
    use crate::testing::{Business, FakeConnector, Package};

    fn cached_client(fake: &Arc<FakeConnector>) -> Client {
        Client::new(Arc::new(CachingConnector::new(fake.clone(), None)))
    }

    #[tokio::test]
    async fn test_rows_are_bound_to_client() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 7)]);
        let client = cached_client(&fake);

        let rows = client.table::<Package>().rows().await.unwrap();
        let record = &rows.as_slice()[0];
        assert!(record.is_owned_by(&client.owner()));

        let back = record.owner().and_then(|owner| owner.client()).unwrap();
        assert!(back.ptr_eq(&client));
    }

    #[tokio::test]
    async fn test_row_navigates_to_sibling_table() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 7)]);
        fake.set_table(&[Business::new(7, "acme")]);
        let client = cached_client(&fake);

        let package = client.table::<Package>().get(&1).await.unwrap().unwrap();
        let business = package.business(&package.owner().unwrap().client().unwrap()).await.unwrap();
        assert_eq!(business.unwrap().name, "acme");
    }

    #[tokio::test]
    async fn test_get_uses_cached_index_when_cache_enabled() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 7), Package::new(2, "b", 7)]);
        let client = cached_client(&fake);
        let packages = client.table::<Package>();

        assert_eq!(packages.get(&2).await.unwrap().unwrap().name, "b");
        assert!(packages.get(&3).await.unwrap().is_none());
        assert_eq!(fake.calls(TableId::Packages), 1);
        assert_eq!(fake.row_calls(), 0);
    }

    #[tokio::test]
    async fn test_get_without_cache_issues_get_row() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 7)]);
        let client = Client::new(fake.clone());

        assert_eq!(client.table::<Package>().get(&1).await.unwrap().unwrap().pkey, 1);
        assert_eq!(fake.row_calls(), 1);
        assert_eq!(fake.calls(TableId::Packages), 0);
        assert!(client.table::<Package>().last_loaded().is_none());
    }

    #[tokio::test]
    async fn test_shared_connector_rebinds_for_second_client() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 7)]);
        let connector: Arc<dyn Connector> = Arc::new(CachingConnector::new(fake.clone(), None));
        let first = Client::new(connector.clone());
        let second = Client::new(connector);

        let a = first.table::<Package>().rows().await.unwrap();
        let b = second.table::<Package>().rows().await.unwrap();
        assert!(b.as_slice()[0].is_owned_by(&second.owner()));
        assert!(a.as_slice()[0].is_owned_by(&first.owner()));
        assert_eq!(fake.calls(TableId::Packages), 1);

        let again = second.table::<Package>().rows().await.unwrap();
        assert!(again.ptr_eq(&b));
        let index = second.table::<Package>().unique_index(Package::PKEY).await.unwrap();
        let index_again = second.table::<Package>().unique_index(Package::PKEY).await.unwrap();
        assert!(Arc::ptr_eq(&index, &index_again));
        assert!(first.table::<Package>().rows().await.unwrap().ptr_eq(&a));

        second.table::<Package>().invalidate();
        let reloaded = second.table::<Package>().rows().await.unwrap();
        assert!(!reloaded.ptr_eq(&b));
        assert!(reloaded.as_slice()[0].is_owned_by(&second.owner()));
        assert_eq!(fake.calls(TableId::Packages), 2);
    }

    #[tokio::test]
    async fn test_invalidate_reaches_master_and_local_cache() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 7)]);
        let client = cached_client(&fake);

        client.table::<Package>().rows().await.unwrap();
        assert!(client.table::<Package>().last_loaded().is_some());

        client.invalidate(&[TableId::Packages], Some("daemon1")).await.unwrap();
        assert!(client.table::<Package>().last_loaded().is_none());
        assert_eq!(fake.invalidations(), vec![vec![TableId::Packages]]);
    }

    #[tokio::test]
    async fn test_clear_caches_drops_every_table() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 7)]);
        fake.set_table(&[Business::new(7, "acme")]);
        let client = cached_client(&fake);

        client.table::<Package>().rows().await.unwrap();
        client.table::<Business>().rows().await.unwrap();
        client.clear_caches();

        assert!(client.table::<Package>().last_loaded().is_none());
        assert!(client.table::<Business>().last_loaded().is_none());
        assert_eq!(client.cache_stats().unwrap().invalidations, 2);
        assert!(fake.invalidations().is_empty());
    }

    #[tokio::test]
    async fn test_adopt_binds_foreign_record() {
        let fake = Arc::new(FakeConnector::new());
        fake.set_table(&[Package::new(1, "a", 7)]);
        let first = cached_client(&fake);
        let second = cached_client(&fake);

        let record = first.table::<Package>().get(&1).await.unwrap().unwrap();
        let adopted = second.adopt(record.clone());
        assert!(adopted.is_owned_by(&second.owner()));
        assert!(record.is_owned_by(&first.owner()));
        assert_eq!(adopted.name, "a");
    }

    #[tokio::test]
    async fn test_ping_and_stats() {
        let fake = Arc::new(FakeConnector::new());
        let client = cached_client(&fake);
        client.ping().await.unwrap();
        assert_eq!(fake.pings(), 1);
        assert_eq!(client.cache_stats().unwrap(), CacheStats::default());
    }
}
