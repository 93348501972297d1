//! The contract between the engine and the plugins that populate it.

use crate::engine::Engine;
use crate::error::{ErrorKind, Result};
use crate::lazy::{Decoders, LazyLocator};
use crate::models::{CacheIdentity, FileId, FileRecord, MineConfig, MineId, MineRecord};
use crate::pivot::Pivot;
use crate::query::statement;
use crate::repo;
use crate::value::Value;
use async_trait::async_trait;
use exn::{Exn, OptionExt, ResultExt};
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::{Executor, Sqlite, SqliteConnection, Transaction};
use std::any::Any;
use std::collections::HashMap;
use std::io::{Read, Seek};
use std::sync::Arc;
use time::UtcDateTime;

/// How the caller wants to read an opened file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// The stored bytes, as-is.
    Binary,
    /// Decompressed content, when the mine recognises a compression format.
    Text,
}

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Readable, seekable content of one file.
pub type Stream = Box<dyn ReadSeek>;

/// A pluggable source of files and derived values.
#[async_trait]
pub trait Mine: Any + Send + Sync {
    /// Declare derived tables and decoders; when `force` is set, also
    /// discover files and compute derived rows.
    ///
    /// Called with `force = false` every time the index is opened, so
    /// everything done outside of a forced pass must be idempotent.
    async fn index(&self, ctx: &mut IndexContext<'_>, force: bool) -> Result<()>;

    /// Open the last file of `lineage` (outermost container first), which
    /// this mine owns.
    ///
    /// Called from blocking contexts only.
    fn open(&self, engine: &Engine, lineage: &[FileRecord], mode: OpenMode) -> Result<Stream> {
        let _ = (engine, mode);
        let path = lineage.last().map(|file| file.path.clone()).unwrap_or_default();
        exn::bail!(ErrorKind::Unsupported(format!("opening {path}")))
    }
}

/// A mine with a persisted, versioned configuration.
///
/// The configuration is what identifies a mine across registrations and
/// process restarts: two instances that encode to the same payload are the
/// same mine.
pub trait MineKind: Mine + Sized {
    /// Stable name of the kind, stored with every configuration.
    const KIND: &'static str;
    /// Bumped whenever the payload encoding changes incompatibly.
    const VERSION: u32;

    fn encode(&self) -> Result<String>;

    /// Rebuild an instance from a payload written by `encode` under
    /// `version`.
    fn decode(version: u32, payload: &str) -> Result<Self>;

    fn config(&self) -> Result<MineConfig> {
        Ok(MineConfig::new(Self::KIND, Self::VERSION, self.encode()?))
    }
}

type RestoreFn = Arc<dyn Fn(u32, &str) -> Result<Arc<dyn Mine>> + Send + Sync>;

/// The mine kinds an engine can restore from persisted configurations.
#[derive(Clone, Default)]
pub struct Kinds {
    restore: HashMap<&'static str, RestoreFn>,
}
impl Kinds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<M: MineKind>(mut self) -> Self {
        self.register::<M>();
        self
    }

    pub fn register<M: MineKind>(&mut self) {
        let restore: RestoreFn = Arc::new(|version: u32, payload: &str| {
            let mine: Arc<dyn Mine> = Arc::new(M::decode(version, payload)?);
            Ok(mine)
        });
        self.restore.insert(M::KIND, restore);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.restore.contains_key(kind)
    }

    /// Rebuild the live mine for a persisted record.
    pub(crate) fn restore(&self, record: &MineRecord) -> Result<Arc<dyn Mine>> {
        let restore = self
            .restore
            .get(record.config.kind.as_str())
            .ok_or_raise(|| ErrorKind::CorruptIndex(record.id))?;
        restore(record.config.version, &record.config.payload).or_raise(|| ErrorKind::CorruptIndex(record.id))
    }
}

/// Everything a mine may touch during an indexing pass.
///
/// All statements go through the pass's transaction: nothing written here
/// is visible to other connections until the pass succeeds.
pub struct IndexContext<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) tx: &'a mut Transaction<'static, Sqlite>,
    pub(crate) mine: MineId,
    pub(crate) last_indexed_at: Option<UtcDateTime>,
}
impl IndexContext<'_> {
    pub fn engine(&self) -> &Engine {
        self.engine
    }

    /// Id of the mine being indexed.
    pub fn mine_id(&self) -> MineId {
        self.mine
    }

    pub fn identity(&self) -> &CacheIdentity {
        self.engine.identity()
    }

    /// Start of the last successful forced pass of this mine, if any.
    pub fn last_indexed_at(&self) -> Option<UtcDateTime> {
        self.last_indexed_at
    }

    pub fn is_read_only(&self) -> bool {
        self.engine.is_read_only()
    }

    pub fn decoders(&self) -> &Decoders {
        self.engine.decoders()
    }

    // Boxed, so `Mine::index` futures awaiting them stay `Send`.

    /// Run one or more statements without parameters (schema declarations).
    pub fn execute<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<()>> {
        let conn: &'a mut SqliteConnection = &mut **self.tx;
        async move {
            conn.execute(sqlx::raw_sql(sql)).await.or_raise(|| ErrorKind::Database)?;
            Ok(())
        }
        .boxed()
    }

    /// Run one statement with `?` parameters. Returns the number of rows it
    /// changed.
    pub fn execute_with<'a>(&'a mut self, sql: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<u64>> {
        let conn: &'a mut SqliteConnection = &mut **self.tx;
        async move {
            let done = conn
                .execute(statement(sql, args))
                .await
                .or_raise(|| ErrorKind::Database)?;
            Ok(done.rows_affected())
        }
        .boxed()
    }

    /// First column of the first row of a statement, undecoded.
    pub fn fetch_scalar<'a>(&'a mut self, sql: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Option<Value>>> {
        let conn: &'a mut SqliteConnection = &mut **self.tx;
        async move {
            let row = conn
                .fetch_optional(statement(sql, args))
                .await
                .or_raise(|| ErrorKind::Database)?;
            row.map(|row| Value::from_row(&row, 0)).transpose()
        }
        .boxed()
    }

    /// Rebuild a pivot view inside the pass.
    pub fn create_pivot<'a>(&'a mut self, pivot: &'a Pivot<'_>) -> BoxFuture<'a, Result<Vec<String>>> {
        if self.is_read_only() {
            return async { Err(Exn::from(ErrorKind::ReadOnly)) }.boxed();
        }
        pivot.create(&mut **self.tx)
    }

    /// Record a file owned by this mine. See [`Engine::insert_file`].
    pub fn insert_file<'a>(
        &'a mut self,
        path: &'a str,
        mtime: UtcDateTime,
        parent: Option<FileId>,
    ) -> BoxFuture<'a, Result<FileId>> {
        let (read_only, mine) = (self.is_read_only(), self.mine);
        let conn: &'a mut SqliteConnection = &mut **self.tx;
        async move {
            if read_only {
                exn::bail!(ErrorKind::ReadOnly);
            }
            repo::upsert_file(conn, mine, path, mtime, parent).await
        }
        .boxed()
    }

    pub fn file(&mut self, id: FileId) -> BoxFuture<'_, Result<Option<FileRecord>>> {
        repo::file(&mut **self.tx, id).boxed()
    }

    /// Files of any mine whose path matches one of the `LIKE` patterns.
    pub fn files_like<'a>(&'a mut self, patterns: &'a [&'a str]) -> BoxFuture<'a, Result<Vec<FileRecord>>> {
        repo::files_like(&mut **self.tx, patterns).boxed()
    }

    pub fn children(&mut self, id: FileId) -> BoxFuture<'_, Result<Vec<FileRecord>>> {
        repo::children(&mut **self.tx, id).boxed()
    }

    pub fn lineage(&mut self, id: FileId) -> BoxFuture<'_, Result<Vec<FileRecord>>> {
        repo::lineage(&mut **self.tx, id).boxed()
    }

    /// Open any indexed file, including ones this pass just inserted.
    pub async fn open(&mut self, file: &FileRecord, mode: OpenMode) -> Result<Stream> {
        let lineage = self.lineage(file.id).await?;
        self.engine.open_lineage_blocking(lineage, mode).await
    }

    /// Encoded locator for a lazy value of `file` owned by this index.
    pub fn locator(&self, tag: &str, file: FileId, attribute: &str) -> Result<Vec<u8>> {
        LazyLocator::new(tag, file, self.identity().clone(), attribute).encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(String);
    #[async_trait]
    impl Mine for Fixed {
        async fn index(&self, _ctx: &mut IndexContext<'_>, _force: bool) -> Result<()> {
            Ok(())
        }
    }
    impl MineKind for Fixed {
        const KIND: &'static str = "fixed";
        const VERSION: u32 = 2;
        fn encode(&self) -> Result<String> {
            Ok(self.0.clone())
        }
        fn decode(version: u32, payload: &str) -> Result<Self> {
            if version != Self::VERSION {
                exn::bail!(ErrorKind::InvalidData("fixed version"));
            }
            Ok(Self(payload.to_string()))
        }
    }

    fn record(kind: &str, version: u32) -> MineRecord {
        MineRecord {
            id: MineId::new(9),
            config: MineConfig::new(kind, version, "x"),
            last_indexed_at: None,
        }
    }

    #[test]
    fn test_config_envelope() {
        let config = Fixed("payload".to_string()).config().unwrap();
        assert_eq!(config, MineConfig::new("fixed", 2, "payload"));
    }

    #[test]
    fn test_restore_known_kind() {
        let kinds = Kinds::new().with::<Fixed>();
        assert!(kinds.contains("fixed"));
        let mine = kinds.restore(&record("fixed", 2)).unwrap();
        let any: Arc<dyn Any + Send + Sync> = mine;
        assert_eq!(any.downcast::<Fixed>().unwrap().0, "x");
    }

    #[test]
    fn test_restore_failures_are_corrupt_index() {
        let kinds = Kinds::new().with::<Fixed>();
        for record in [record("unknown", 1), record("fixed", 1)] {
            let err = kinds.restore(&record).err().unwrap();
            assert!(matches!(&*err, ErrorKind::CorruptIndex(id) if *id == MineId::new(9)));
        }
    }
}
