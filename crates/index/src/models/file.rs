use crate::error::{Error, ErrorKind};
use crate::models::{FileId, MineId};
use exn::ResultExt;
use time::UtcDateTime;

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    pub(crate) id: i64,
    pub(crate) path: String,
    pub(crate) mine_id: i64,
    #[sqlx(default)]
    pub(crate) parent_id: Option<i64>,
    pub(crate) mtime: i64,
}

/// One discovered item.
///
/// What `path` means is up to the owning mine: a filesystem path for a
/// directory walk, a member name for an archive. Items that live inside
/// another indexed item point at it through `parent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: FileId,
    pub path: String,
    pub mine: MineId,
    pub parent: Option<FileId>,
    pub mtime: UtcDateTime,
}
impl FileRecord {
    /// Final path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Last dot-separated component of the name, if the name has one.
    ///
    /// `"a/b/frames.tar.gz"` has suffix `"gz"`, `"a/.hidden"` has `"hidden"`.
    pub fn suffix(&self) -> Option<&str> {
        let name = self.name();
        name.rsplit_once('.').map(|(_, suffix)| suffix)
    }
}
impl TryFrom<FileRow> for FileRecord {
    type Error = Error;
    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: FileId::new(row.id),
            path: row.path,
            mine: MineId::new(row.mine_id),
            parent: row.parent_id.map(FileId::new),
            mtime: super::from_nanos(row.mtime).or_raise(|| ErrorKind::InvalidData("file mtime"))?,
        })
    }
}
