//! Statements against the `mines` and `files` tables.
//!
//! Every function takes an executor rather than the pool, so the same
//! statement runs inside an indexing transaction or directly on the pool.
//! In-memory stores only have one connection: code holding a transaction
//! must keep using it.

use crate::error::{ErrorKind, Result};
use crate::models::{FileId, FileRecord, FileRow, MineId, MineRow, to_nanos};
use exn::ResultExt;
use sqlx::{Executor, Sqlite, SqliteConnection};
use time::UtcDateTime;

/// Insert `config` unless an identical blob exists, then resolve its row.
pub(crate) async fn resolve_mine(conn: &mut SqliteConnection, config: &[u8]) -> Result<MineRow> {
    sqlx::query(include_str!("../queries/insert_mine.sql"))
        .bind(config)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    sqlx::query_as(include_str!("../queries/select_mine_by_config.sql"))
        .bind(config)
        .fetch_one(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)
}

pub(crate) async fn mines<'e>(exec: impl Executor<'e, Database = Sqlite>) -> Result<Vec<MineRow>> {
    sqlx::query_as(include_str!("../queries/select_mines.sql"))
        .fetch_all(exec)
        .await
        .or_raise(|| ErrorKind::Database)
}

pub(crate) async fn stamp_mine<'e>(
    exec: impl Executor<'e, Database = Sqlite>,
    mine: MineId,
    at: UtcDateTime,
) -> Result<()> {
    sqlx::query(include_str!("../queries/stamp_mine.sql"))
        .bind(to_nanos(at))
        .bind(mine.get())
        .execute(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Insert a file, or refresh the modification time of the existing row at
/// `(path, mine)`. The row keeps its id either way.
pub(crate) async fn upsert_file<'e>(
    exec: impl Executor<'e, Database = Sqlite>,
    mine: MineId,
    path: &str,
    mtime: UtcDateTime,
    parent: Option<FileId>,
) -> Result<FileId> {
    let id: i64 = sqlx::query_scalar(include_str!("../queries/upsert_file.sql"))
        .bind(path)
        .bind(mine.get())
        .bind(parent.map(FileId::get))
        .bind(to_nanos(mtime))
        .fetch_one(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(FileId::new(id))
}

pub(crate) async fn file<'e>(exec: impl Executor<'e, Database = Sqlite>, id: FileId) -> Result<Option<FileRecord>> {
    let row: Option<FileRow> = sqlx::query_as(include_str!("../queries/select_file.sql"))
        .bind(id.get())
        .fetch_optional(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    row.map(FileRecord::try_from).transpose()
}

/// The chain of files from the outermost container down to `id` itself.
pub(crate) async fn lineage<'e>(exec: impl Executor<'e, Database = Sqlite>, id: FileId) -> Result<Vec<FileRecord>> {
    let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/select_lineage.sql"))
        .bind(id.get())
        .fetch_all(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    if rows.is_empty() {
        exn::bail!(ErrorKind::FileNotFound(id));
    }
    rows.into_iter().map(FileRecord::try_from).collect()
}

pub(crate) async fn children<'e>(exec: impl Executor<'e, Database = Sqlite>, id: FileId) -> Result<Vec<FileRecord>> {
    let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/select_children.sql"))
        .bind(id.get())
        .fetch_all(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    rows.into_iter().map(FileRecord::try_from).collect()
}

/// Files (of any mine) whose path matches at least one `LIKE` pattern.
pub(crate) async fn files_like<'e>(
    exec: impl Executor<'e, Database = Sqlite>,
    patterns: &[&str],
) -> Result<Vec<FileRecord>> {
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let clause = vec!["path LIKE ?"; patterns.len()].join(" OR ");
    let sql = format!("SELECT id, path, mine_id, parent_id, mtime FROM files WHERE {clause} ORDER BY id");
    let mut query = sqlx::query_as::<_, FileRow>(&sql);
    for pattern in patterns {
        query = query.bind(*pattern);
    }
    let rows = query.fetch_all(exec).await.or_raise(|| ErrorKind::Database)?;
    rows.into_iter().map(FileRecord::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup() -> (Database, MineId) {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let row = resolve_mine(&mut conn, b"{\"k\":\"test\"}").await.unwrap();
        drop(conn);
        (db, MineId::new(row.id))
    }

    fn at(seconds: i64) -> UtcDateTime {
        UtcDateTime::from_unix_timestamp(seconds).unwrap()
    }

    #[tokio::test]
    async fn test_identical_config_resolves_same_row() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let first = resolve_mine(&mut conn, b"same").await.unwrap();
        let second = resolve_mine(&mut conn, b"same").await.unwrap();
        let other = resolve_mine(&mut conn, b"other").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other.id);
        assert_eq!(first.last_indexed_at, None);
        drop(conn);
        assert_eq!(mines(db.pool()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stamp_mine() {
        let (db, mine) = setup().await;
        stamp_mine(db.pool(), mine, at(1_700_000_000)).await.unwrap();
        let rows = mines(db.pool()).await.unwrap();
        assert_eq!(rows[0].last_indexed_at, Some(1_700_000_000_000_000_000));
    }

    #[tokio::test]
    async fn test_rediscovery_keeps_identity() {
        let (db, mine) = setup().await;
        let first = upsert_file(db.pool(), mine, "a/b.txt", at(100), None).await.unwrap();
        let second = upsert_file(db.pool(), mine, "a/b.txt", at(200), None).await.unwrap();
        assert_eq!(first, second);
        let stored = file(db.pool(), first).await.unwrap().unwrap();
        assert_eq!(stored.mtime, at(200));

        // An older sighting never winds the clock back.
        upsert_file(db.pool(), mine, "a/b.txt", at(50), None).await.unwrap();
        let stored = file(db.pool(), first).await.unwrap().unwrap();
        assert_eq!(stored.mtime, at(200));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files").fetch_one(db.pool()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_mtime_keeps_sub_second_changes() {
        let (db, mine) = setup().await;
        let early = at(100);
        let late = early + time::Duration::milliseconds(900);
        let id = upsert_file(db.pool(), mine, "a.tar", early, None).await.unwrap();
        upsert_file(db.pool(), mine, "a.tar", late, None).await.unwrap();
        assert_eq!(file(db.pool(), id).await.unwrap().unwrap().mtime, late);
    }

    #[tokio::test]
    async fn test_lineage_is_root_first() {
        let (db, mine) = setup().await;
        let root = upsert_file(db.pool(), mine, "outer.tar", at(1), None).await.unwrap();
        let middle = upsert_file(db.pool(), mine, "inner.tar", at(1), Some(root)).await.unwrap();
        let leaf = upsert_file(db.pool(), mine, "leaf.txt", at(1), Some(middle)).await.unwrap();
        let chain: Vec<_> = lineage(db.pool(), leaf).await.unwrap().into_iter().map(|f| f.id).collect();
        assert_eq!(chain, vec![root, middle, leaf]);
        assert_eq!(children(db.pool(), root).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lineage_of_missing_file() {
        let (db, _) = setup().await;
        let err = lineage(db.pool(), FileId::new(99)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_files_like() {
        let (db, mine) = setup().await;
        for path in ["a.tar", "b.tar.gz", "c.txt", "d.tgz"] {
            upsert_file(db.pool(), mine, path, at(1), None).await.unwrap();
        }
        let found = files_like(db.pool(), &["%.tar", "%.tgz"]).await.unwrap();
        let paths: Vec<_> = found.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.tar", "d.tgz"]);
        assert!(files_like(db.pool(), &[]).await.unwrap().is_empty());
    }
}
