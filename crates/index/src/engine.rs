//! The engine: one open index, its mines and their indexing passes.

use crate::db::Database;
use crate::error::{ErrorKind, Result};
use crate::identity::Registry;
use crate::lazy::Decoders;
use crate::mine::{IndexContext, Kinds, Mine, MineKind, OpenMode, Stream};
use crate::models::{CacheIdentity, FileId, FileRecord, MineId, MineRecord};
use crate::pivot::Pivot;
use crate::query::Query;
use crate::repo;
use exn::{OptionExt, ResultExt};
use sqlx::sqlite::SqlitePool;
use sqlx::{Sqlite, Transaction};
use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use time::UtcDateTime;
use tracing::{debug, info, instrument};

type Mines = BTreeMap<MineId, Arc<dyn Mine>>;

pub(crate) struct Inner {
    db: Database,
    identity: CacheIdentity,
    location: Option<PathBuf>,
    read_only: bool,
    mines: RwLock<Mines>,
    kinds: Kinds,
    registry: Arc<Registry>,
    decoders: Arc<Decoders>,
}
impl Drop for Inner {
    fn drop(&mut self) {
        self.registry.release(&self.identity, self as *const Inner);
    }
}

/// How to open an [`Engine`].
///
/// Persisted mines can only be restored for the kinds registered here; any
/// other kind found in the index fails the open with
/// [`ErrorKind::CorruptIndex`].
#[derive(Clone, Default)]
pub struct EngineOptions {
    read_only: bool,
    kinds: Kinds,
    registry: Option<Arc<Registry>>,
    decoders: Option<Arc<Decoders>>,
}
impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open without creating, migrating or writing anything.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn kinds(mut self, kinds: Kinds) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn kind<M: MineKind>(mut self) -> Self {
        self.kinds.register::<M>();
        self
    }

    /// Identity registry to publish the engine in, instead of the global one.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Decoder table to use, instead of the global one.
    pub fn decoders(mut self, decoders: Arc<Decoders>) -> Self {
        self.decoders = Some(decoders);
        self
    }

    /// Open (or create) the index stored at `location`.
    #[instrument(skip_all, fields(location = %location.as_ref().display(), read_only = self.read_only))]
    pub async fn open(self, location: impl AsRef<Path>) -> Result<Engine> {
        let location = location.as_ref();
        let db = if self.read_only {
            Database::connect_read_only(location).await?
        } else {
            Database::connect(location).await?
        };
        self.start(db, Some(location.to_path_buf())).await
    }

    /// Open a transient index that disappears with the engine.
    pub async fn open_in_memory(self) -> Result<Engine> {
        if self.read_only {
            // Nothing could ever have been written to it.
            exn::bail!(ErrorKind::StoreUnavailable);
        }
        let db = Database::connect_in_memory().await?;
        self.start(db, None).await
    }

    async fn start(self, db: Database, location: Option<PathBuf>) -> Result<Engine> {
        let identity = db.identity(self.read_only).await?;
        let engine = Engine {
            inner: Arc::new(Inner {
                db,
                identity,
                location,
                read_only: self.read_only,
                mines: RwLock::new(BTreeMap::new()),
                kinds: self.kinds,
                registry: self.registry.unwrap_or_else(Registry::global),
                decoders: self.decoders.unwrap_or_else(Decoders::global),
            }),
        };
        engine.inner.registry.register(engine.identity(), &engine)?;
        engine.restore().await?;
        info!(identity = %engine.identity(), mines = engine.mines().len(), "index open");
        Ok(engine)
    }
}

/// Handle to one open index.
///
/// Cheap to clone; every clone refers to the same index. The index stays
/// published in its identity registry until [`Engine::close`] is called or
/// the last handle is dropped.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

/// Non-owning handle to an [`Engine`].
#[derive(Clone)]
pub struct WeakEngine(Weak<Inner>);
impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        self.0.upgrade().map(Engine::from_inner)
    }

    pub(crate) fn into_inner(self) -> Weak<Inner> {
        self.0
    }
}

impl Engine {
    /// Open (or create) the index at `location` with default options.
    pub async fn open(location: impl AsRef<Path>) -> Result<Self> {
        EngineOptions::new().open(location).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        EngineOptions::new().open_in_memory().await
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine(Arc::downgrade(&self.inner))
    }

    /// Whether both handles refer to the same open index.
    pub fn ptr_eq(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn identity(&self) -> &CacheIdentity {
        &self.inner.identity
    }

    /// Where the index is stored; `None` for in-memory indexes.
    pub fn location(&self) -> Option<&Path> {
        self.inner.location.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn decoders(&self) -> &Decoders {
        &self.inner.decoders
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        self.inner.db.pool()
    }

    async fn restore(&self) -> Result<()> {
        for row in repo::mines(self.pool()).await? {
            let record = MineRecord::try_from(row)?;
            let mine = self.inner.kinds.restore(&record)?;
            // A mine that never finished a forced pass is replayed in full.
            let force = !self.is_read_only() && record.last_indexed_at.is_none();
            let mut tx = self.pool().begin().await.or_raise(|| ErrorKind::Database)?;
            self.run(&mut tx, &record, mine, force).await?;
            tx.commit().await.or_raise(|| ErrorKind::Database)?;
        }
        Ok(())
    }

    /// Make `mine` live under `record.id` and run one pass of it.
    ///
    /// The mine is live while its pass runs so that files it inserts can be
    /// opened through the engine. A failed pass puts back whatever instance
    /// was live before.
    async fn run(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        record: &MineRecord,
        mine: Arc<dyn Mine>,
        force: bool,
    ) -> Result<()> {
        let previous = self.write_mines().insert(record.id, Arc::clone(&mine));
        let result = self.pass(tx, record, mine.as_ref(), force).await;
        if result.is_err() {
            let mut mines = self.write_mines();
            match previous {
                Some(previous) => mines.insert(record.id, previous),
                None => mines.remove(&record.id),
            };
        }
        result
    }

    #[instrument(skip_all, fields(mine = %record.id, kind = %record.config.kind, force = force))]
    async fn pass(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        record: &MineRecord,
        mine: &dyn Mine,
        force: bool,
    ) -> Result<()> {
        let began = UtcDateTime::now();
        let mut ctx = IndexContext {
            engine: self,
            tx: &mut *tx,
            mine: record.id,
            last_indexed_at: record.last_indexed_at,
        };
        mine.index(&mut ctx, force).await?;
        if force {
            repo::stamp_mine(&mut **tx, record.id, began).await?;
            info!(elapsed = ?(UtcDateTime::now() - began), "forced pass complete");
        } else {
            debug!("schema pass complete");
        }
        Ok(())
    }

    /// Persist `mine` (or find its existing record) and index it.
    ///
    /// The pass is forced when `force` is set or the mine never completed a
    /// forced pass. Everything happens in one transaction: a failing pass
    /// leaves neither rows nor an index time behind. The returned instance is
    /// the one now live in the engine.
    #[instrument(skip(self, mine), fields(kind = M::KIND))]
    pub async fn register<M: MineKind>(&self, mine: M, force: bool) -> Result<Arc<M>> {
        if self.is_read_only() {
            exn::bail!(ErrorKind::ReadOnly);
        }
        let blob = mine.config()?.to_blob()?;
        let mine = Arc::new(mine);
        let mut tx = self.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let record = MineRecord::try_from(repo::resolve_mine(&mut tx, &blob).await?)?;
        let force = force || record.last_indexed_at.is_none();
        self.run(&mut tx, &record, Arc::clone(&mine) as Arc<dyn Mine>, force).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(mine)
    }

    /// Record a file owned by `mine`, or refresh its modification time if
    /// `(path, mine)` is already known. Returns the file's stable id.
    pub async fn insert_file(
        &self,
        mine: MineId,
        path: &str,
        mtime: UtcDateTime,
        parent: Option<FileId>,
    ) -> Result<FileId> {
        if self.is_read_only() {
            exn::bail!(ErrorKind::ReadOnly);
        }
        repo::upsert_file(self.pool(), mine, path, mtime, parent).await
    }

    pub async fn file(&self, id: FileId) -> Result<Option<FileRecord>> {
        repo::file(self.pool(), id).await
    }

    /// `id` and every container it lives in, outermost first.
    pub async fn lineage(&self, id: FileId) -> Result<Vec<FileRecord>> {
        repo::lineage(self.pool(), id).await
    }

    /// Files directly contained in `id`.
    pub async fn children(&self, id: FileId) -> Result<Vec<FileRecord>> {
        repo::children(self.pool(), id).await
    }

    /// Persisted records of every mine, ordered by id.
    pub async fn mine_records(&self) -> Result<Vec<MineRecord>> {
        repo::mines(self.pool()).await?.into_iter().map(MineRecord::try_from).collect()
    }

    /// Live mines, ordered by id.
    pub fn mines(&self) -> Vec<(MineId, Arc<dyn Mine>)> {
        self.read_mines().iter().map(|(id, mine)| (*id, Arc::clone(mine))).collect()
    }

    /// The live mine registered under `id`, if it is an `M`.
    pub fn mine<M: Mine>(&self, id: MineId) -> Option<Arc<M>> {
        let mine: Arc<dyn Mine> = self.read_mines().get(&id).cloned()?;
        let mine: Arc<dyn Any + Send + Sync> = mine;
        mine.downcast::<M>().ok()
    }

    /// Every live mine of type `M`, ordered by id.
    pub fn mines_of<M: Mine>(&self) -> Vec<(MineId, Arc<M>)> {
        self.read_mines()
            .iter()
            .filter_map(|(id, mine)| {
                let mine: Arc<dyn Mine> = Arc::clone(mine);
                let mine: Arc<dyn Any + Send + Sync> = mine;
                mine.downcast::<M>().ok().map(|mine| (*id, mine))
            })
            .collect()
    }

    fn read_mines(&self) -> std::sync::RwLockReadGuard<'_, Mines> {
        self.inner.mines.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_mines(&self) -> std::sync::RwLockWriteGuard<'_, Mines> {
        self.inner.mines.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `sql` against the index. Lazy values in the result are decoded
    /// as rows are read.
    pub fn query(&self, sql: impl Into<String>) -> Query {
        Query::new(self.clone(), sql)
    }

    /// Rebuild a pivot view over one of the index's tables. Returns the
    /// attribute names that became columns.
    pub async fn create_pivot(&self, pivot: &Pivot<'_>) -> Result<Vec<String>> {
        if self.is_read_only() {
            exn::bail!(ErrorKind::ReadOnly);
        }
        let mut conn = self.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        pivot.create(&mut conn).await
    }

    /// Open an indexed file through the mine that owns it.
    pub async fn open_resource(&self, file: &FileRecord, mode: OpenMode) -> Result<Stream> {
        let lineage = self.lineage(file.id).await?;
        self.open_lineage_blocking(lineage, mode).await
    }

    /// Open the last file of `lineage` through the mine that owns it.
    ///
    /// Blocking: mines do file I/O here.
    pub fn open_lineage(&self, lineage: &[FileRecord], mode: OpenMode) -> Result<Stream> {
        let file = lineage
            .last()
            .ok_or_raise(|| ErrorKind::InvalidData("empty lineage"))?;
        let mine = self
            .read_mines()
            .get(&file.mine)
            .cloned()
            .ok_or_raise(|| ErrorKind::UnknownMine(file.mine))?;
        mine.open(self, lineage, mode)
    }

    pub(crate) async fn open_lineage_blocking(&self, lineage: Vec<FileRecord>, mode: OpenMode) -> Result<Stream> {
        let engine = self.clone();
        let path = lineage.last().map(|file| file.path.clone()).unwrap_or_default();
        tokio::task::spawn_blocking(move || engine.open_lineage(&lineage, mode))
            .await
            .or_raise(|| ErrorKind::SourceUnreadable(path))?
    }

    /// Unpublish the engine and close the store.
    ///
    /// Other clones of this handle stay usable for in-flight work, but lazy
    /// values of this index can no longer be decoded until it is reopened.
    pub async fn close(self) {
        self.inner.registry.release(&self.inner.identity, Arc::as_ptr(&self.inner));
        self.inner.db.close(self.inner.read_only).await;
        info!(identity = %self.inner.identity, "index closed");
    }
}
