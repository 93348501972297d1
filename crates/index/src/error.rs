//! Index Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Mines raise their own error kinds and
//! wrap them into [`ErrorKind::Mine`] or [`ErrorKind::SourceUnreadable`] at
//! the trait boundary.

use crate::models::{CacheIdentity, FileId, MineId};
use derive_more::{Display, Error};

/// An index error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The backing store could not be opened (missing, permissions, never
    /// initialised when opened read-only).
    #[display("index store unavailable")]
    StoreUnavailable,
    /// A query or statement against an open store failed.
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A persisted mine configuration could not be restored.
    #[display("corrupt index: mine {_0} cannot be restored")]
    CorruptIndex(#[error(not(source))] MineId),
    /// A lazy value was read while no engine for its owning index is open.
    #[display("owning index {_0} is not open")]
    OwningCacheNotOpen(#[error(not(source))] CacheIdentity),
    /// Another live engine already holds this identity.
    #[display("index {_0} is already open")]
    AlreadyOpen(#[error(not(source))] CacheIdentity),
    /// Writes were attempted through a read-only engine.
    #[display("index is read-only")]
    ReadOnly,
    /// A file belongs to a mine that isn't registered with this engine.
    #[display("mine {_0} is not registered")]
    UnknownMine(#[error(not(source))] MineId),
    #[display("file {_0} not found")]
    FileNotFound(#[error(not(source))] FileId),
    #[display("no decoder registered for lazy type {_0}")]
    UnknownDecoder(#[error(not(source))] String),
    /// A discovered item could not be opened or parsed.
    #[display("source unreadable: {_0}")]
    SourceUnreadable(#[error(not(source))] String),
    /// The operation isn't supported by the mine it was dispatched to.
    #[display("unsupported: {_0}")]
    Unsupported(#[error(not(source))] String),
    /// Serialization/deserialization error.
    #[display("invalid index data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// A mine's indexing hook failed.
    #[display("mine failed: {_0}")]
    Mine(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::SourceUnreadable(_) | Self::OwningCacheNotOpen(_))
    }
}
