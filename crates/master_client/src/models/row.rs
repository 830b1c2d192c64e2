//! The row plug-in contract.
//!
//! Generated entity types implement [`Row`]: they name their table, describe
//! their columns and index kinds, and read/write themselves through the wire
//! codec. The cache never looks at business fields beyond this contract.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use crate::error::MasterError;
use crate::models::TableId;
use crate::protocol::{ProtocolVersion, WireReader, WireWriter};

/// Which hash structures may be built over a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// No index.
    None,
    /// Values are unique among non-null rows.
    Unique,
    /// Values repeat; rows are grouped per value.
    Indexed,
    /// The table's primary key. Implies unique.
    PrimaryKey,
}

impl IndexKind {
    /// Whether a value-to-row map may be built.
    pub fn supports_unique(self) -> bool {
        matches!(self, Self::Unique | Self::PrimaryKey)
    }

    /// Whether a value-to-rows map may be built.
    pub fn supports_indexed(self) -> bool {
        matches!(self, Self::Indexed)
    }
}

/// One column of a row type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    /// Position, contiguous from zero.
    pub ordinal: usize,
    /// Column name as the master knows it.
    pub name: &'static str,
    /// Index kind.
    pub index: IndexKind,
}

impl ColumnDef {
    pub const fn new(ordinal: usize, name: &'static str, index: IndexKind) -> Self {
        Self { ordinal, name, index }
    }
}

/// A column value used as a hash key.
///
/// Nulls are never indexed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Value {
    const TAG_NULL: u8 = 0;
    const TAG_BOOL: u8 = 1;
    const TAG_INT: u8 = 2;
    const TAG_TEXT: u8 = 3;

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Write a type tag followed by the value.
    pub fn encode(&self, out: &mut WireWriter) {
        match self {
            Self::Null => out.write_u8(Self::TAG_NULL),
            Self::Bool(v) => {
                out.write_u8(Self::TAG_BOOL);
                out.write_bool(*v);
            }
            Self::Int(v) => {
                out.write_u8(Self::TAG_INT);
                out.write_signed_varint(*v);
            }
            Self::Text(v) => {
                out.write_u8(Self::TAG_TEXT);
                out.write_utf(v);
            }
        }
    }

    pub fn decode(input: &mut WireReader<'_>) -> Result<Self, MasterError> {
        match input.read_u8()? {
            Self::TAG_NULL => Ok(Self::Null),
            Self::TAG_BOOL => Ok(Self::Bool(input.read_bool()?)),
            Self::TAG_INT => Ok(Self::Int(input.read_signed_varint()?)),
            Self::TAG_TEXT => Ok(Self::Text(input.read_utf()?)),
            tag => Err(MasterError::decode(format!("unknown value tag {tag}"))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A cached value object belonging to one remote table.
pub trait Row: Clone + fmt::Debug + Send + Sync + 'static {
    /// Primary key type. Its ordering is the canonical order of unordered
    /// result sets.
    type Key: Clone + Ord + Hash + fmt::Debug + Send + Sync + Into<Value>;

    /// Table this row type belongs to.
    const TABLE: TableId;

    /// Column descriptors in ordinal order.
    fn columns() -> &'static [ColumnDef];

    /// Primary key of this row.
    fn key(&self) -> Self::Key;

    /// Value of the column at `ordinal`, used for index building.
    fn value(&self, ordinal: usize) -> Value;

    /// Write the row for the given protocol version.
    fn encode(&self, out: &mut WireWriter, version: ProtocolVersion);

    /// Read a row written by the master under the given protocol version.
    fn decode(input: &mut WireReader<'_>, version: ProtocolVersion) -> Result<Self, MasterError>;
}

/// Check the column list of a table.
///
/// Returns the primary key ordinal, if the table has one.
pub fn validate_columns(table: TableId, columns: &[ColumnDef]) -> Result<Option<usize>, MasterError> {
    let mut primary_key = None;
    let mut needs_primary_key = false;
    let mut names = HashSet::with_capacity(columns.len());

    for (position, column) in columns.iter().enumerate() {
        if column.ordinal != position {
            return Err(MasterError::invariant(
                table,
                format!(
                    "column {} has ordinal {} but sits at position {position}",
                    column.name, column.ordinal
                ),
            ));
        }
        if !names.insert(column.name) {
            return Err(MasterError::invariant(table, format!("duplicate column name {}", column.name)));
        }
        match column.index {
            IndexKind::PrimaryKey => {
                if let Some(existing) = primary_key.replace(position) {
                    return Err(MasterError::invariant(
                        table,
                        format!("primary key declared on columns {existing} and {position}"),
                    ));
                }
            }
            IndexKind::Unique | IndexKind::Indexed => needs_primary_key = true,
            IndexKind::None => {}
        }
    }

    if needs_primary_key && primary_key.is_none() {
        return Err(MasterError::invariant(table, "indexed columns require a primary key column"));
    }
    Ok(primary_key)
}

/// Find a column ordinal by name.
pub fn column_ordinal(columns: &[ColumnDef], name: &str) -> Option<usize> {
    columns.iter().find(|c| c.name == name).map(|c| c.ordinal)
}
