//! Value object identity and ownership.
//!
//! A [`Record`] is an immutable row plus an optional back-reference to the
//! client that produced it. Records are shared through `Arc` across caches and
//! result sets; giving one to a different consumer goes through
//! [`Record::bind`], which never mutates a record that already has an owner.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::client::{Client, ClientInner};
use crate::models::Row;

/// Back-reference from a record to the client that produced it.
///
/// Holds the client weakly so cached rows do not keep a dropped client alive.
#[derive(Clone)]
pub struct Owner {
    id: Uuid,
    client: Weak<ClientInner>,
}

impl Owner {
    pub(crate) fn new(id: Uuid, client: Weak<ClientInner>) -> Self {
        Self { id, client }
    }

    /// An owner that is not attached to a live client.
    pub fn detached() -> Self {
        Self { id: Uuid::new_v4(), client: Weak::new() }
    }

    /// Identity of the owning client.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether both handles name the same owner.
    pub fn same_as(&self, other: &Owner) -> bool {
        self.id == other.id
    }

    /// The owning client, while it is alive.
    pub fn client(&self) -> Option<Client> {
        self.client.upgrade().map(Client::from_inner)
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner")
            .field("id", &self.id)
            .field("alive", &(self.client.strong_count() > 0))
            .finish()
    }
}

/// A row together with the owner that produced it.
///
/// Equality and hashing follow the primary key only, so the same row bound to
/// two owners compares equal.
#[derive(Clone)]
pub struct Record<R> {
    row: R,
    owner: Option<Owner>,
}

impl<R: Row> Record<R> {
    /// Wrap a row with no owner.
    pub fn new(row: R) -> Self {
        Self { row, owner: None }
    }

    /// Wrap a row already bound to `owner`.
    pub fn with_owner(row: R, owner: Owner) -> Self {
        Self { row, owner: Some(owner) }
    }

    pub fn row(&self) -> &R {
        &self.row
    }

    pub fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }

    /// Whether this record is bound to `owner`.
    pub fn is_owned_by(&self, owner: &Owner) -> bool {
        self.owner.as_ref().is_some_and(|current| current.same_as(owner))
    }

    /// Rebind to `owner`.
    ///
    /// - Same owner: returns `this` unchanged.
    /// - No owner and not shared: sets the owner in place.
    /// - Otherwise: returns a shallow copy carrying the new owner.
    pub fn bind(mut this: Arc<Self>, owner: &Owner) -> Arc<Self> {
        if this.is_owned_by(owner) {
            return this;
        }
        if this.owner.is_none() {
            if let Some(record) = Arc::get_mut(&mut this) {
                record.owner = Some(owner.clone());
                return this;
            }
        }
        Arc::new(Self { row: this.row.clone(), owner: Some(owner.clone()) })
    }
}

impl<R> Deref for Record<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.row
    }
}

impl<R: Row> PartialEq for Record<R> {
    fn eq(&self, other: &Self) -> bool {
        self.row.key() == other.row.key()
    }
}

impl<R: Row> Eq for Record<R> {}

impl<R: Row> Hash for Record<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.row.key().hash(state);
    }
}

impl<R: fmt::Debug> fmt::Debug for Record<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("row", &self.row)
            .field("owner", &self.owner.as_ref().map(Owner::id))
            .finish()
    }
}
