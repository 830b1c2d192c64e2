//! Immutable, lazily indexed result sets.
//!
//! An [`IndexedSet`] wraps a fixed collection of records. Hash maps over its
//! columns are built on first use and kept with the set, so a filtered subset
//! gets maps of its own that are never shared with its parent or with the row
//! cache.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::MasterError;
use crate::models::{ColumnDef, IndexKind, Owner, Record, Row, TableId, Value};

/// Value to record, for one unique column.
pub type UniqueIndex<R> = HashMap<Value, Arc<Record<R>>>;

/// Value to records, for one indexed column.
pub type ListIndex<R> = HashMap<Value, IndexedSet<R>>;

enum Rows<R> {
    Empty,
    Single(Arc<Record<R>>),
    Many(Box<[Arc<Record<R>>]>),
}

struct SetInner<R> {
    rows: Rows<R>,
    unique: Mutex<HashMap<usize, Arc<UniqueIndex<R>>>>,
    lists: Mutex<HashMap<usize, Arc<ListIndex<R>>>>,
}

/// An immutable set of records of one table.
pub struct IndexedSet<R> {
    inner: Arc<SetInner<R>>,
}

impl<R: Row> IndexedSet<R> {
    fn from_rows(rows: Rows<R>) -> Self {
        Self {
            inner: Arc::new(SetInner {
                rows,
                unique: Mutex::new(HashMap::new()),
                lists: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The shared empty set for this row type.
    pub fn empty() -> Self {
        static EMPTY: OnceLock<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>> =
            OnceLock::new();

        let mut sets = EMPTY.get_or_init(|| Mutex::new(HashMap::new())).lock();
        let entry = sets
            .entry(TypeId::of::<R>())
            .or_insert_with(|| Box::new(Self::from_rows(Rows::Empty)) as Box<dyn Any + Send + Sync>);
        match entry.downcast_ref::<Self>() {
            Some(set) => set.clone(),
            None => Self::from_rows(Rows::Empty),
        }
    }

    /// Wrap records whose order is already meaningful.
    pub fn from_ordered(mut rows: Vec<Arc<Record<R>>>) -> Self {
        match rows.len() {
            0 => Self::empty(),
            1 => match rows.pop() {
                Some(row) => Self::from_rows(Rows::Single(row)),
                None => Self::empty(),
            },
            _ => Self::from_rows(Rows::Many(rows.into_boxed_slice())),
        }
    }

    /// Wrap records from an unordered source, ordering them by primary key.
    pub fn from_unordered(mut rows: Vec<Arc<Record<R>>>) -> Self {
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        Self::from_ordered(rows)
    }

    pub fn table(&self) -> TableId {
        R::TABLE
    }

    pub fn len(&self) -> usize {
        match &self.inner.rows {
            Rows::Empty => 0,
            Rows::Single(_) => 1,
            Rows::Many(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.inner.rows, Rows::Empty)
    }

    pub fn as_slice(&self) -> &[Arc<Record<R>>] {
        match &self.inner.rows {
            Rows::Empty => &[],
            Rows::Single(row) => std::slice::from_ref(row),
            Rows::Many(rows) => rows,
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Record<R>>> {
        self.as_slice().iter()
    }

    /// Whether both handles share one underlying collection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Ordinal of the column called `name`.
    pub fn column(name: &str) -> Result<usize, MasterError> {
        R::columns()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.ordinal)
            .ok_or_else(|| MasterError::invariant(R::TABLE, format!("no column named {name}")))
    }

    fn column_def(ordinal: usize) -> Result<&'static ColumnDef, MasterError> {
        R::columns().get(ordinal).ok_or_else(|| {
            MasterError::invariant(R::TABLE, format!("no column at ordinal {ordinal}"))
        })
    }

    fn primary_key_column() -> Result<usize, MasterError> {
        R::columns()
            .iter()
            .find(|c| c.index == IndexKind::PrimaryKey)
            .map(|c| c.ordinal)
            .ok_or_else(|| MasterError::invariant(R::TABLE, "table has no primary key column"))
    }

    /// Value-to-record map over a unique or primary key column.
    ///
    /// Built once per set. A repeated non-null value is an invariant
    /// violation; the failed build is not cached.
    pub fn unique_index(&self, column: usize) -> Result<Arc<UniqueIndex<R>>, MasterError> {
        let def = Self::column_def(column)?;
        if !def.index.supports_unique() {
            return Err(MasterError::invariant(
                R::TABLE,
                format!("column {} is {:?}, not unique", def.name, def.index),
            ));
        }

        let mut built = self.inner.unique.lock();
        if let Some(index) = built.get(&column) {
            return Ok(index.clone());
        }

        let mut index = HashMap::with_capacity(self.len());
        for record in self.iter() {
            let value = record.value(column);
            if value.is_null() {
                continue;
            }
            if index.contains_key(&value) {
                tracing::error!(
                    table = %R::TABLE,
                    column = def.name,
                    value = %value,
                    "Duplicate value in unique column"
                );
                return Err(MasterError::invariant(
                    R::TABLE,
                    format!("duplicate value {value} in unique column {}", def.name),
                ));
            }
            index.insert(value, record.clone());
        }

        tracing::trace!(table = %R::TABLE, column = def.name, entries = index.len(), "Built unique index");
        let index = Arc::new(index);
        built.insert(column, index.clone());
        Ok(index)
    }

    /// Value-to-records map over an indexed column.
    ///
    /// Each group keeps the set's order.
    pub fn list_index(&self, column: usize) -> Result<Arc<ListIndex<R>>, MasterError> {
        let def = Self::column_def(column)?;
        if !def.index.supports_indexed() {
            return Err(MasterError::invariant(
                R::TABLE,
                format!("column {} is {:?}, not indexed", def.name, def.index),
            ));
        }

        let mut built = self.inner.lists.lock();
        if let Some(index) = built.get(&column) {
            return Ok(index.clone());
        }

        let mut groups: HashMap<Value, Vec<Arc<Record<R>>>> = HashMap::new();
        for record in self.iter() {
            let value = record.value(column);
            if !value.is_null() {
                groups.entry(value).or_default().push(record.clone());
            }
        }
        let index: ListIndex<R> = groups
            .into_iter()
            .map(|(value, rows)| (value, Self::from_ordered(rows)))
            .collect();

        tracing::trace!(table = %R::TABLE, column = def.name, groups = index.len(), "Built list index");
        let index = Arc::new(index);
        built.insert(column, index.clone());
        Ok(index)
    }

    /// The record whose `column` equals `value`.
    pub fn filter_unique(
        &self,
        column: usize,
        value: &Value,
    ) -> Result<Option<Arc<Record<R>>>, MasterError> {
        let index = self.unique_index(column)?;
        Ok(index.get(value).cloned())
    }

    /// Records whose `column` is any of `values`, ordered by primary key.
    pub fn filter_unique_set(
        &self,
        column: usize,
        values: &HashSet<Value>,
    ) -> Result<Self, MasterError> {
        let index = self.unique_index(column)?;
        let rows: Vec<_> = if values.len() <= index.len() {
            values.iter().filter_map(|v| index.get(v).cloned()).collect()
        } else {
            index
                .iter()
                .filter(|(v, _)| values.contains(*v))
                .map(|(_, record)| record.clone())
                .collect()
        };
        Ok(Self::from_unordered(rows))
    }

    /// Records whose `column` equals `value`.
    pub fn filter_indexed(&self, column: usize, value: &Value) -> Result<Self, MasterError> {
        let index = self.list_index(column)?;
        Ok(index.get(value).cloned().unwrap_or_else(Self::empty))
    }

    /// Records whose `column` is any of `values`, ordered by primary key.
    pub fn filter_indexed_set(
        &self,
        column: usize,
        values: &HashSet<Value>,
    ) -> Result<Self, MasterError> {
        let index = self.list_index(column)?;
        let mut rows = Vec::new();
        if values.len() <= index.len() {
            for group in values.iter().filter_map(|v| index.get(v)) {
                rows.extend(group.iter().cloned());
            }
        } else {
            for (_, group) in index.iter().filter(|(v, _)| values.contains(*v)) {
                rows.extend(group.iter().cloned());
            }
        }
        Ok(Self::from_unordered(rows))
    }

    /// The record with primary key `key`.
    pub fn get(&self, key: &R::Key) -> Result<Option<Arc<Record<R>>>, MasterError> {
        let column = Self::primary_key_column()?;
        self.filter_unique(column, &key.clone().into())
    }

    /// A set whose records are bound to `owner`.
    ///
    /// Returns this set when every record already belongs to `owner`.
    pub fn rebind(&self, owner: &Owner) -> Self {
        if self.iter().all(|record| record.is_owned_by(owner)) {
            return self.clone();
        }
        let rows = self.iter().map(|record| Record::bind(record.clone(), owner)).collect();
        Self::from_ordered(rows)
    }
}

impl<R> Clone for IndexedSet<R> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<'a, R: Row> IntoIterator for &'a IndexedSet<R> {
    type Item = &'a Arc<Record<R>>;
    type IntoIter = std::slice::Iter<'a, Arc<Record<R>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<R: Row> fmt::Debug for IndexedSet<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedSet").field("table", &R::TABLE).field("len", &self.len()).finish()
    }
}
