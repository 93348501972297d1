mod file;
mod mine;

pub use self::file::FileRecord;
pub(crate) use self::file::FileRow;
pub use self::mine::{MineConfig, MineRecord};
pub(crate) use self::mine::MineRow;
use derive_more::Display;
use std::sync::Arc;
use time::UtcDateTime;

/// Timestamps are stored as Unix nanoseconds, so changes within one second
/// stay ordered.
pub(crate) fn to_nanos(at: UtcDateTime) -> i64 {
    at.unix_timestamp_nanos().clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

pub(crate) fn from_nanos(nanos: i64) -> std::result::Result<UtcDateTime, time::error::ComponentRange> {
    UtcDateTime::from_unix_timestamp_nanos(i128::from(nanos))
}

/// Row identity of a [`MineRecord`], stable for the lifetime of the index.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
pub struct MineId(i64);
impl MineId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

/// Row identity of a [`FileRecord`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("{_0}")]
pub struct FileId(i64);
impl FileId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

/// Persistent, globally unique token naming one index store.
///
/// Generated when a store is first created and kept inside it, so reopening
/// the same location in any process yields the same identity. Lazy locators
/// use it to find their owning engine.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
#[display("{_0}")]
pub struct CacheIdentity(Arc<str>);
impl CacheIdentity {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<&str> for CacheIdentity {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}
impl From<String> for CacheIdentity {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_are_unique() {
        let a = CacheIdentity::generate();
        let b = CacheIdentity::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_identity_round_trips_through_text() {
        let identity = CacheIdentity::from("8a1d3a7e-0d2c-4b5e-9a8f-3c2b1a0d9e8f");
        assert_eq!(CacheIdentity::from(identity.to_string()), identity);
    }
}
