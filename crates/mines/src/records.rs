//! Getar-style record archives.
//!
//! A record archive is a tar or zip archive whose member paths name records:
//!
//! ```text
//! [group/]frames/<index>/<name>[.<type>][.<resolution>]
//! [group/]<name>[.<type>][.<resolution>]
//! ```
//!
//! Every member becomes a row of `archive_records`. The row's `data` column
//! holds a lazy locator; the record's bytes are only read from the archive
//! when a query selects it.

use crate::archive::{ArchiveCache, ArchiveSource, archive_cache};
use crate::tarfile::members;
use async_trait::async_trait;
use exn::ResultExt;
use lode_index::error::{ErrorKind, Result};
use lode_index::pivot::Pivot;
use lode_index::{Engine, FileId, FileRecord, IndexContext, Mine, MineKind, Value};
use std::sync::LazyLock;
use tracing::{debug, info, instrument, warn};

/// Tag of the lazy values stored in `archive_records.data`.
pub const RECORD_TAG: &str = "record";

const DEFAULT_CACHE_SIZE: usize = 16;

/// `LIKE` patterns of the files read as record archives.
const RECORD_PATTERNS: &[&str] = &["%.tar", "%.tar.gz", "%.tgz", "%.tar.bz2", "%.zip"];

const BINARY_TYPES: &[&str] = &["i32", "u32", "i64", "u64", "f32", "f64", "u8"];
const RESOLUTIONS: &[&str] = &["uni", "ind", "var"];

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS archive_records (
    path TEXT NOT NULL,
    record_group TEXT NOT NULL,
    record_index TEXT NOT NULL,
    name TEXT NOT NULL,
    file_id INTEGER NOT NULL REFERENCES files (id),
    data LAZY_RECORD,
    UNIQUE (path, file_id)
)";

const INSERT_RECORD: &str = "INSERT OR IGNORE INTO archive_records
    (path, record_group, record_index, name, file_id, data) VALUES (?, ?, ?, ?, ?, ?)";

const HAS_RECORDS: &str = "SELECT EXISTS (SELECT 1 FROM archive_records WHERE file_id = ?)";

/// One row per (archive, group, frame), one column per record name.
pub const FRAMES: Pivot<'static> = Pivot {
    source: "archive_records",
    view: "archive_frames",
    keys: &["file_id", "record_group", "record_index"],
    name: "name",
    value: "data",
};

static ARCHIVES: LazyLock<ArchiveCache> = LazyLock::new(|| archive_cache(DEFAULT_CACHE_SIZE));

/// A member path, split into its record components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPath<'a> {
    pub group: String,
    /// Empty for records outside of any frame.
    pub index: &'a str,
    pub name: String,
    pub kind: Option<&'a str>,
    pub resolution: Option<&'a str>,
}
impl<'a> RecordPath<'a> {
    pub fn parse(path: &'a str) -> Self {
        let components: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let (group, index, file) = match components.as_slice() {
            [group @ .., "frames", index, file] => (group.join("/"), *index, *file),
            [group @ .., file] => (group.join("/"), "", *file),
            [] => (String::new(), "", ""),
        };
        let mut parts: Vec<&str> = file.split('.').collect();
        let resolution = pop_known(&mut parts, RESOLUTIONS);
        let kind = pop_known(&mut parts, BINARY_TYPES);
        Self {
            group,
            index,
            name: parts.join("."),
            kind,
            resolution,
        }
    }

    /// Whether the record's bytes are an array of numbers.
    pub fn is_binary(&self) -> bool {
        self.kind.is_some()
    }
}

/// Remove the last dot-separated part of a name if it is one of `known`,
/// never leaving the name empty.
fn pop_known<'a>(parts: &mut Vec<&'a str>, known: &[&str]) -> Option<&'a str> {
    if parts.len() > 1 && parts.last().is_some_and(|last| known.contains(last)) {
        return parts.pop();
    }
    None
}

/// The value of a record as read from its archive.
pub fn record_value(path: &RecordPath<'_>, content: Vec<u8>) -> Value {
    if path.is_binary() {
        return Value::Blob(content);
    }
    match String::from_utf8(content) {
        Ok(text) => Value::Text(text),
        Err(err) => Value::Blob(err.into_bytes()),
    }
}

async fn decode_record(engine: Engine, file: FileRecord, attribute: String) -> Result<Value> {
    let lineage = engine.lineage(file.id).await?;
    let source = ArchiveSource::new(&engine, lineage);
    let cache = ARCHIVES.clone();
    let content = tokio::task::spawn_blocking(move || {
        let archive = cache.get(&source)?;
        archive
            .read(&attribute)
            .or_raise(|| ErrorKind::SourceUnreadable(attribute.clone()))
            .map(|content| (attribute, content))
    })
    .await
    .or_raise(|| ErrorKind::SourceUnreadable(file.path.clone()))?;
    let (attribute, content) = content?;
    Ok(record_value(&RecordPath::parse(&attribute), content))
}

/// Indexes the records of every tar and zip archive in the index.
///
/// Forced passes are incremental: archives that already have records and
/// haven't been modified since the last pass are not read again.
#[derive(Debug, Default)]
pub struct Records;
impl Records {
    pub fn new() -> Self {
        Self
    }

    /// Number of parsed archives kept open for decoding records.
    pub fn cache_size() -> usize {
        ARCHIVES.capacity()
    }

    pub fn set_cache_size(capacity: usize) {
        ARCHIVES.set_capacity(capacity);
    }

    /// Rebuild the `archive_frames` view. Returns its record columns.
    pub async fn frames_view(engine: &Engine) -> Result<Vec<String>> {
        engine.create_pivot(&FRAMES).await
    }

    /// Whether `archive` was fully read by an earlier pass. Times are whole
    /// seconds, so an archive modified in the second a pass began is read
    /// again.
    async fn is_current(ctx: &mut IndexContext<'_>, archive: &FileRecord) -> Result<bool> {
        let Some(last_indexed_at) = ctx.last_indexed_at() else {
            return Ok(false);
        };
        if archive.mtime >= last_indexed_at {
            return Ok(false);
        }
        let exists = ctx
            .fetch_scalar(HAS_RECORDS, vec![Value::Integer(archive.id.get())])
            .await?;
        Ok(exists.and_then(|exists| exists.as_i64()).is_some_and(|exists| exists != 0))
    }

    async fn index_archive(ctx: &mut IndexContext<'_>, archive: &FileRecord) -> Result<usize> {
        let lineage = ctx.lineage(archive.id).await?;
        let members = members(&ARCHIVES, ctx.engine(), lineage).await?;
        for member in &members {
            let path = RecordPath::parse(&member.name);
            let data = ctx.locator(RECORD_TAG, archive.id, &member.name)?;
            let args = vec![
                Value::from(member.name.as_str()),
                Value::Text(path.group),
                Value::from(path.index),
                Value::Text(path.name),
                Value::Integer(archive.id.get()),
                Value::Blob(data),
            ];
            ctx.execute_with(INSERT_RECORD, args).await?;
        }
        Ok(members.len())
    }
}

#[async_trait]
impl Mine for Records {
    #[instrument(skip_all, fields(force))]
    async fn index(&self, ctx: &mut IndexContext<'_>, force: bool) -> Result<()> {
        ctx.decoders().register(RECORD_TAG, decode_record);
        if ctx.is_read_only() {
            return Ok(());
        }
        ctx.execute(CREATE_TABLE).await?;
        if !force {
            return Ok(());
        }

        let (mut read, mut current) = (0usize, 0usize);
        for archive in ctx.files_like(RECORD_PATTERNS).await? {
            if Self::is_current(ctx, &archive).await? {
                current += 1;
                continue;
            }
            match Self::index_archive(ctx, &archive).await {
                Ok(records) => {
                    read += 1;
                    debug!(path = %archive.path, records, "archive read");
                },
                Err(err) => warn!(path = %archive.path, error = ?err, "skipping unreadable archive"),
            }
        }
        let columns = ctx.create_pivot(&FRAMES).await?;
        info!(read, current, columns = columns.len(), "records indexed");
        Ok(())
    }
}

impl MineKind for Records {
    const KIND: &'static str = "records";
    const VERSION: u32 = 1;

    fn encode(&self) -> Result<String> {
        Ok(String::new())
    }

    fn decode(_version: u32, _payload: &str) -> Result<Self> {
        Ok(Self)
    }
}

/// Records of `archive`, by member path.
pub async fn records_of(engine: &Engine, archive: FileId) -> Result<Vec<(String, Value)>> {
    let rows = engine
        .query("SELECT path, data FROM archive_records WHERE file_id = ? ORDER BY path")
        .bind(archive.get())
        .fetch_all()
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let mut values = row.into_values().into_iter();
            match (values.next(), values.next()) {
                (Some(Value::Text(path)), Some(data)) => Some((path, data)),
                _ => None,
            }
        })
        .collect())
}
