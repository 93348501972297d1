use crate::error::{ErrorKind, Result};
use derive_more::{Display, From};
use exn::ResultExt;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use std::sync::Arc;

/// A single column value, as stored or as produced by a lazy decoder.
#[derive(Debug, Display, Clone, PartialEq, From)]
pub enum Value {
    #[display("NULL")]
    #[from(ignore)]
    Null,
    #[display("{_0}")]
    Integer(i64),
    #[display("{_0}")]
    Real(f64),
    #[display("{_0}")]
    Text(String),
    #[display("<{} bytes>", _0.len())]
    Blob(Vec<u8>),
}
impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(value) => Some(value),
            Self::Text(value) => Some(value.as_bytes()),
            _ => None,
        }
    }

    /// Read column `index` of a raw row by its storage class.
    pub(crate) fn from_row(row: &SqliteRow, index: usize) -> Result<Self> {
        let raw = row.try_get_raw(index).or_raise(|| ErrorKind::Database)?;
        if raw.is_null() {
            return Ok(Self::Null);
        }
        let class = raw.type_info().name().to_string();
        let value = match class.as_str() {
            "INTEGER" | "BOOLEAN" => Self::Integer(row.try_get_unchecked(index).or_raise(|| ErrorKind::Database)?),
            "REAL" => Self::Real(row.try_get_unchecked(index).or_raise(|| ErrorKind::Database)?),
            "TEXT" => Self::Text(row.try_get_unchecked(index).or_raise(|| ErrorKind::Database)?),
            _ => Self::Blob(row.try_get_unchecked(index).or_raise(|| ErrorKind::Database)?),
        };
        Ok(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}
impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Self::Blob(value.to_vec())
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One result row. Column names are shared by every row of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}
impl Row {
    pub(crate) fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub(crate) fn columns_of(row: &SqliteRow) -> Arc<[String]> {
        row.columns().iter().map(|column| column.name().to_string()).collect()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value by column position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value by column name (first match).
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|column| column == name)
            .and_then(|index| self.values.get(index))
    }
}
