//! Mines for the lode index.
//!
//! - [`Directory`] walks a directory tree and records every regular file.
//! - [`TarArchive`] records the members of tar archives, nested under the
//!   archive they came from.
//! - [`Records`] exposes getar-style record archives as the
//!   `archive_records` table, with record contents read lazily.
//!
//! Engines can only restore mines whose kinds they know about; pass
//! [`kinds()`] to [`EngineOptions::kinds`](lode_index::EngineOptions::kinds)
//! to restore any of these.

mod archive;
pub mod compression;
mod directory;
pub mod error;
mod paths;
mod records;
mod tarfile;

pub use crate::archive::{Archive, ArchiveCache, ArchiveSource, Format, Member, archive_cache};
pub use crate::directory::Directory;
pub use crate::paths::{Exclusions, Relative};
pub use crate::records::{FRAMES, RECORD_TAG, RecordPath, Records, record_value, records_of};
pub use crate::tarfile::TarArchive;

use lode_index::Kinds;

/// Every mine kind in this crate.
pub fn kinds() -> Kinds {
    Kinds::new().with::<Directory>().with::<TarArchive>().with::<Records>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::{tarball, zipball};
    use lode_index::error::ErrorKind;
    use lode_index::lazy::Decoders;
    use lode_index::{Engine, EngineOptions, FileId, MineKind, Registry, Value};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    fn options(registry: &Arc<Registry>) -> EngineOptions {
        EngineOptions::new()
            .registry(Arc::clone(registry))
            .decoders(Arc::new(Decoders::new()))
            .kinds(kinds())
    }

    fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    async fn paths(engine: &Engine) -> Vec<String> {
        engine
            .query("SELECT path FROM files ORDER BY path")
            .fetch_all()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|row| row.get(0).and_then(|path| path.as_str().map(str::to_string)))
            .collect()
    }

    #[tokio::test]
    async fn test_directory_exclusions() {
        let data = tempfile::tempdir().unwrap();
        for name in ["a.tar", "b.txt", "c.dat", "sub/d.tar", ".hidden/e.tar"] {
            write(data.path(), name, b"x");
        }
        let engine = options(&Arc::new(Registry::new())).open_in_memory().await.unwrap();
        let mine = Directory::new(data.path()).with_exclusions(Exclusions::new(["txt"], [r"/\.hidden/"]).unwrap());
        let mine = engine.register(mine, true).await.unwrap();
        assert_eq!(mine.passes(), 1);

        let root = data.path().display().to_string();
        assert_eq!(
            paths(&engine).await,
            vec![format!("{root}/a.tar"), format!("{root}/c.dat"), format!("{root}/sub/d.tar")]
        );
    }

    #[tokio::test]
    async fn test_directory_excludes_by_suffix() {
        let data = tempfile::tempdir().unwrap();
        for name in ["a.tar", "b.txt", "c.dat", "d.tar.gz", "e.zip"] {
            write(data.path(), name, b"x");
        }
        let engine = options(&Arc::new(Registry::new())).open_in_memory().await.unwrap();
        let mine = Directory::new(data.path()).with_exclusions(Exclusions::new(["txt", "dat"], Vec::<String>::new()).unwrap());
        engine.register(mine, true).await.unwrap();

        let root = data.path().display().to_string();
        assert_eq!(
            paths(&engine).await,
            vec![format!("{root}/a.tar"), format!("{root}/d.tar.gz"), format!("{root}/e.zip")]
        );
    }

    #[tokio::test]
    async fn test_directory_suffix_is_last_component() {
        let data = tempfile::tempdir().unwrap();
        for name in ["x.tar.gz", "y.tar"] {
            write(data.path(), name, b"x");
        }
        let engine = options(&Arc::new(Registry::new())).open_in_memory().await.unwrap();
        let mine = Directory::new(data.path()).with_exclusions(Exclusions::new(["tar"], Vec::<String>::new()).unwrap());
        engine.register(mine, true).await.unwrap();
        assert_eq!(paths(&engine).await, vec![format!("{}/x.tar.gz", data.path().display())]);
    }

    #[tokio::test]
    async fn test_reregistering_does_not_walk_again() {
        let data = tempfile::tempdir().unwrap();
        write(data.path(), "a.dat", b"x");
        let engine = options(&Arc::new(Registry::new())).open_in_memory().await.unwrap();
        engine.register(Directory::new(data.path()), true).await.unwrap();
        write(data.path(), "b.dat", b"y");

        let again = engine.register(Directory::new(data.path()), false).await.unwrap();
        assert_eq!(again.passes(), 0);
        assert_eq!(paths(&engine).await.len(), 1);
        assert_eq!(engine.mine_records().await.unwrap().len(), 1);

        // Forcing rediscovers without duplicating.
        let forced = engine.register(Directory::new(data.path()), true).await.unwrap();
        assert_eq!(forced.passes(), 1);
        assert_eq!(paths(&engine).await.len(), 2);
    }

    #[tokio::test]
    async fn test_relative_to_index() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "data/a.dat", b"x");
        let registry = Arc::new(Registry::new());
        let engine = options(&registry).open(dir.path().join("index.db")).await.unwrap();
        engine
            .register(Directory::new(dir.path().join("data")).with_relative(Relative::Index), true)
            .await
            .unwrap();
        assert_eq!(paths(&engine).await, vec!["data/a.dat".to_string()]);

        let file = engine.file(FileId::new(1)).await.unwrap().unwrap();
        let mut content = String::new();
        std::io::Read::read_to_string(
            &mut engine.open_resource(&file, lode_index::OpenMode::Binary).await.unwrap(),
            &mut content,
        )
        .unwrap();
        assert_eq!(content, "x");
    }

    #[tokio::test]
    async fn test_archives_found_by_directory() {
        let data = tempfile::tempdir().unwrap();
        write(data.path(), "run.tar", &tarball(&[("a", b"1"), ("b", b"2"), ("c", b"3")]));
        write(data.path(), "notes.txt", b"not an archive");
        let engine = options(&Arc::new(Registry::new())).open_in_memory().await.unwrap();
        engine.register(Directory::new(data.path()), true).await.unwrap();
        engine.register(TarArchive::new(), true).await.unwrap();

        let archive = engine
            .query("SELECT id FROM files WHERE path LIKE '%run.tar'")
            .fetch_scalar()
            .await
            .unwrap()
            .and_then(|id| id.as_i64())
            .unwrap();
        let members = engine.children(FileId::new(archive)).await.unwrap();
        let names: Vec<&str> = members.iter().map(|file| file.path.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(members.iter().all(|file| file.parent == Some(FileId::new(archive))));

        let lineage = engine.lineage(members[2].id).await.unwrap();
        assert_eq!(lineage.len(), 2);
        assert_eq!(lineage[0].id, FileId::new(archive));
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        write(
            &data,
            "run.tar",
            &tarball(&[
                ("frames/0/position.f32.ind", b"\x00\x00\x80\x3f"),
                ("frames/1/position.f32.ind", b"\x00\x00\x00\x40"),
                ("frames/0/notes.txt", b"first"),
            ]),
        );
        let location = dir.path().join("index.db");
        let registry = Arc::new(Registry::new());

        let engine = options(&registry).open(&location).await.unwrap();
        engine.register(Directory::new(&data), true).await.unwrap();
        engine.register(Records::new(), true).await.unwrap();
        let frames = engine
            .query("SELECT record_index, \"notes.txt\", position FROM archive_frames ORDER BY record_index")
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].get(1), Some(&Value::Text("first".to_string())));
        assert_eq!(frames[1].get(1), Some(&Value::Null));
        assert_eq!(frames[1].get(2), Some(&Value::Blob(vec![0x00, 0x00, 0x00, 0x40])));
        let archive = engine
            .query("SELECT DISTINCT file_id FROM archive_records")
            .fetch_scalar()
            .await
            .unwrap()
            .and_then(|id| id.as_i64())
            .unwrap();
        let before = records_of(&engine, FileId::new(archive)).await.unwrap();
        assert_eq!(before.len(), 3);
        engine.close().await;

        let engine = options(&registry).open(&location).await.unwrap();
        let after = records_of(&engine, FileId::new(archive)).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(Records::frames_view(&engine).await.unwrap(), vec!["notes.txt", "position"]);
        engine.close().await;

        let engine = options(&registry).read_only(true).open(&location).await.unwrap();
        assert_eq!(records_of(&engine, FileId::new(archive)).await.unwrap(), before);
        let err = engine.register(Records::new(), true).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::ReadOnly));
    }

    #[tokio::test]
    async fn test_records_pass_is_incremental() {
        let data = tempfile::tempdir().unwrap();
        write(data.path(), "a.tar", &tarball(&[("box.f32.uni", b"\x00\x00\x80\x3f")]));
        let engine = options(&Arc::new(Registry::new())).open_in_memory().await.unwrap();
        engine.register(Directory::new(data.path()), true).await.unwrap();
        engine.register(Records::new(), true).await.unwrap();

        write(data.path(), "b.tar", &tarball(&[("box.f32.uni", b"\x00\x00\x00\x40")]));
        write(data.path(), "broken.tar", b"definitely not a tar archive, just text");
        engine.register(Directory::new(data.path()), true).await.unwrap();
        engine.register(Records::new(), true).await.unwrap();

        let count = engine
            .query("SELECT COUNT(*) FROM archive_records")
            .fetch_scalar()
            .await
            .unwrap();
        assert_eq!(count, Some(Value::Integer(2)));
    }

    #[tokio::test]
    async fn test_archive_modified_within_pass_second_is_read_again() {
        let data = tempfile::tempdir().unwrap();
        let path = data.path().join("a.tar");
        write(data.path(), "a.tar", &tarball(&[("box.f32.uni", b"\x00\x00\x80\x3f")]));
        let engine = options(&Arc::new(Registry::new())).open_in_memory().await.unwrap();
        engine.register(Directory::new(data.path()), true).await.unwrap();
        engine.register(Records::new(), true).await.unwrap();
        let stamp = engine
            .mine_records()
            .await
            .unwrap()
            .into_iter()
            .find(|record| record.config.kind == Records::KIND)
            .and_then(|record| record.last_indexed_at)
            .unwrap();

        write(
            data.path(),
            "a.tar",
            &tarball(&[("box.f32.uni", b"\x00\x00\x80\x3f"), ("frames/0/position.f32.ind", b"\x00\x00\x00\x40")]),
        );
        let stamp = Duration::from_nanos(u64::try_from(stamp.unix_timestamp_nanos()).unwrap());
        let modified = SystemTime::UNIX_EPOCH + stamp + Duration::from_millis(900);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        engine.register(Directory::new(data.path()), true).await.unwrap();
        engine.register(Records::new(), true).await.unwrap();

        let count = engine
            .query("SELECT COUNT(*) FROM archive_records")
            .fetch_scalar()
            .await
            .unwrap();
        assert_eq!(count, Some(Value::Integer(2)));
    }

    #[tokio::test]
    async fn test_zip_records() {
        let data = tempfile::tempdir().unwrap();
        write(
            data.path(),
            "run.zip",
            &zipball(&[("frames/0/position.f32.ind", b"\x00\x00\x80\x3f"), ("notes.txt", b"zipped")]),
        );
        let engine = options(&Arc::new(Registry::new())).open_in_memory().await.unwrap();
        engine.register(Directory::new(data.path()), true).await.unwrap();
        engine.register(Records::new(), true).await.unwrap();

        let archive = engine
            .query("SELECT id FROM files WHERE path LIKE '%run.zip'")
            .fetch_scalar()
            .await
            .unwrap()
            .and_then(|id| id.as_i64())
            .unwrap();
        let records = records_of(&engine, FileId::new(archive)).await.unwrap();
        assert_eq!(
            records,
            vec![
                ("frames/0/position.f32.ind".to_string(), Value::Blob(vec![0x00, 0x00, 0x80, 0x3f])),
                ("notes.txt".to_string(), Value::Text("zipped".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_record_of_closed_index() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "data/run.tar", &tarball(&[("notes.txt", b"n")]));
        let registry = Arc::new(Registry::new());
        let engine = options(&registry).open(dir.path().join("index.db")).await.unwrap();
        engine.register(Directory::new(dir.path().join("data")), true).await.unwrap();
        engine.register(Records::new(), true).await.unwrap();
        let archive = engine
            .query("SELECT file_id FROM archive_records")
            .fetch_scalar()
            .await
            .unwrap()
            .and_then(|id| id.as_i64())
            .unwrap();

        let identity = engine.identity().clone();
        let decoders = engine.decoders();
        assert!(decoders.contains(RECORD_TAG));
        let bytes = lode_index::LazyLocator::new(RECORD_TAG, FileId::new(archive), identity.clone(), "notes.txt")
            .encode()
            .unwrap();
        let locator = lode_index::LazyLocator::parse(&bytes).unwrap();
        let live = lode_index::lazy::decode(&registry, decoders, &locator).await.unwrap();
        assert_eq!(live, Value::Text("n".to_string()));

        let handle = engine.clone();
        engine.close().await;
        let err = lode_index::lazy::decode(&registry, handle.decoders(), &locator).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::OwningCacheNotOpen(id) if *id == identity));
    }
}
