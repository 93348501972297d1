//! Index store connection and pool management.

use exn::{OptionExt, ResultExt};
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::models::CacheIdentity;

/// Embedded migrations that are run automatically on a writable connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
// Indexing is one writer at a time; extra connections serve queries and decodes.
const MAX_CONNECTIONS: u32 = 5;

/// Connection pool for one index store.
///
/// Owned by exactly one engine. Writable stores are created and migrated on
/// connect, read-only stores must already carry an identity.
#[derive(Debug, Clone)]
pub(crate) struct Database {
    pool: SqlitePool,
}

impl Database {
    async fn new(options: SqliteConnectOptions, max: Option<u32>, migrate: bool) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // Query-based PRAGMAs must be applied to every connection the
            // pool opens, not only the first one.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::StoreUnavailable)?;
        let db = Self { pool };
        if migrate {
            db.migrate().await?;
        }
        Ok(db)
    }

    /// Connect to the store at `path`, creating it if it doesn't exist.
    pub(crate) async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::base_options()
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::new(options, None, true).await
    }

    /// Connect to an existing store without ever writing to it.
    pub(crate) async fn connect_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::base_options().filename(path.as_ref()).read_only(true);
        Self::new(options, None, false).await
    }

    /// Connect to a transient in-memory store.
    ///
    /// An in-memory database is private to its connection, so the pool is
    /// limited to a single connection.
    pub(crate) async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        Self::new(options, Some(1), true).await
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            // A forced pass over a large dataset holds the write lock for a
            // while; readers in other processes should wait rather than fail.
            .busy_timeout(std::time::Duration::from_millis(1500))
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::None)
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
                PRAGMA mmap_size = 33554432;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    #[instrument("performing index migrations", skip(self))]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    /// Restore the store's identity, generating and persisting one first if
    /// the store is new.
    ///
    /// Read-only stores never generate: a store without an identity was never
    /// initialised and is reported as unavailable.
    pub(crate) async fn identity(&self, read_only: bool) -> Result<CacheIdentity> {
        if !read_only {
            sqlx::query(include_str!("../queries/init_identity.sql"))
                .bind(CacheIdentity::generate().as_str())
                .execute(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        let value: Option<String> = sqlx::query_scalar(include_str!("../queries/select_identity.sql"))
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::StoreUnavailable)?;
        Ok(CacheIdentity::from(value.ok_or_raise(|| ErrorKind::StoreUnavailable)?))
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Wait for every connection to be returned, then close them.
    pub(crate) async fn close(&self, read_only: bool) {
        if !read_only {
            // Let SQLite update query planner statistics
            _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        }
        self.pool.close().await;
    }
}
