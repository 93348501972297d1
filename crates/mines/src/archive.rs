//! Parsed archives, shared by the tar and record mines.
//!
//! Parsing walks every header of an archive, so mines keep parsed archives in
//! a [`ResourceCache`] and read members by seeking to their recorded offset.
//! Compressed tar archives are inflated into memory once, when they are
//! loaded. Zip archives keep their own central directory and are read in
//! place.

use crate::compression::Compression;
use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::{OptionExt, ResultExt};
use lode_index::error::ErrorKind as IndexErrorKind;
use lode_index::{CacheIdentity, FileRecord, OpenMode, ResourceCache, Stream, WeakEngine};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, PoisonError};
use time::UtcDateTime;
use tracing::{debug, instrument};

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: [u8; 4] = *b"PK\x05\x06";

/// Container format of an archive.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Format {
    #[display("tar")]
    Tar,
    #[display("zip")]
    Zip,
}
impl Format {
    /// Peek at the start of `reader`, leaving its position where it was.
    fn sniff<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<Self> {
        let start = reader.stream_position().or_raise(|| ErrorKind::Archive)?;
        let mut magic = [0u8; ZIP_MAGIC.len()];
        let mut filled = 0;
        while filled < magic.len() {
            match reader.read(&mut magic[filled..]).or_raise(|| ErrorKind::Archive)? {
                0 => break,
                n => filled += n,
            }
        }
        reader.seek(SeekFrom::Start(start)).or_raise(|| ErrorKind::Archive)?;
        Ok(if magic == ZIP_MAGIC || magic == ZIP_EMPTY_MAGIC {
            Format::Zip
        } else {
            Format::Tar
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Tar { offset: u64 },
    Zip { index: usize },
}

/// One regular file inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    location: Location,
    pub size: u64,
    /// Zip timestamps carry no time zone and are left out.
    pub mtime: Option<UtcDateTime>,
}

enum Reader {
    Tar(Stream),
    Zip(zip::ZipArchive<Stream>),
}

pub struct Archive {
    format: Format,
    compression: Compression,
    members: Vec<Member>,
    by_name: HashMap<String, usize>,
    reader: Mutex<Reader>,
}
impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("format", &self.format)
            .field("compression", &self.compression)
            .field("members", &self.members.len())
            .finish()
    }
}
impl Archive {
    /// Read the member table of the archive in `stream`.
    #[instrument(skip_all, fields(format, compression, members))]
    pub fn load(mut stream: Stream) -> Result<Self> {
        let format = Format::sniff(&mut stream)?;
        tracing::Span::current().record("format", tracing::field::display(format));
        let (compression, members, reader) = match format {
            Format::Zip => {
                let (members, reader) = Self::load_zip(stream)?;
                (Compression::None, members, reader)
            },
            Format::Tar => {
                let compression = Compression::sniff(&mut stream)?;
                let stream: Stream = match compression {
                    Compression::None => stream,
                    compression => Box::new(Cursor::new(compression.decompress(stream)?)),
                };
                let (members, reader) = Self::load_tar(stream)?;
                (compression, members, reader)
            },
        };
        tracing::Span::current().record("compression", tracing::field::display(compression));
        tracing::Span::current().record("members", members.len());

        // Later entries shadow earlier ones with the same name, as on extraction.
        let by_name = members
            .iter()
            .enumerate()
            .map(|(index, member)| (member.name.clone(), index))
            .collect();
        Ok(Self {
            format,
            compression,
            members,
            by_name,
            reader: Mutex::new(reader),
        })
    }

    fn load_tar(mut stream: Stream) -> Result<(Vec<Member>, Reader)> {
        let length = stream.seek(SeekFrom::End(0)).or_raise(|| ErrorKind::Archive)?;
        stream.seek(SeekFrom::Start(0)).or_raise(|| ErrorKind::Archive)?;

        let mut archive = tar::Archive::new(stream);
        let mut members = Vec::new();
        for entry in archive.entries_with_seek().or_raise(|| ErrorKind::Archive)? {
            let entry = entry.or_raise(|| ErrorKind::Archive)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path().or_raise(|| ErrorKind::Archive)?.to_string_lossy().into_owned();
            let offset = entry.raw_file_position();
            let size = entry.size();
            // Headers are not trusted: the member must lie within the archive.
            if offset.checked_add(size).is_none_or(|end| end > length) {
                exn::bail!(ErrorKind::Archive);
            }
            let mtime = entry.header().mtime().or_raise(|| ErrorKind::Archive)?;
            members.push(Member {
                name,
                location: Location::Tar { offset },
                size,
                mtime: i64::try_from(mtime)
                    .ok()
                    .and_then(|mtime| UtcDateTime::from_unix_timestamp(mtime).ok()),
            });
        }
        Ok((members, Reader::Tar(archive.into_inner())))
    }

    fn load_zip(stream: Stream) -> Result<(Vec<Member>, Reader)> {
        let mut archive = zip::ZipArchive::new(stream).or_raise(|| ErrorKind::Archive)?;
        let mut members = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let file = archive.by_index(index).or_raise(|| ErrorKind::Archive)?;
            if file.is_dir() {
                continue;
            }
            members.push(Member {
                name: file.name().to_string(),
                location: Location::Zip { index },
                size: file.size(),
                mtime: None,
            });
        }
        Ok((members, Reader::Zip(archive)))
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Regular file members, in archive order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.by_name.get(name).map(|index| &self.members[*index])
    }

    /// The stored bytes of member `name`.
    ///
    /// Never reads more than the member's recorded size, and fails if the
    /// archive holds fewer bytes than that.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let member = self
            .member(name)
            .ok_or_raise(|| ErrorKind::MissingMember(name.to_string()))?;
        let mut content = Vec::new();
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        match (&mut *reader, member.location) {
            (Reader::Tar(stream), Location::Tar { offset }) => {
                stream.seek(SeekFrom::Start(offset)).or_raise(|| ErrorKind::Archive)?;
                stream
                    .by_ref()
                    .take(member.size)
                    .read_to_end(&mut content)
                    .or_raise(|| ErrorKind::Archive)?;
            },
            (Reader::Zip(archive), Location::Zip { index }) => {
                let mut file = archive.by_index(index).or_raise(|| ErrorKind::Archive)?;
                file.by_ref()
                    .take(member.size)
                    .read_to_end(&mut content)
                    .or_raise(|| ErrorKind::Archive)?;
            },
            _ => exn::bail!(ErrorKind::Archive),
        }
        if content.len() as u64 != member.size {
            exn::bail!(ErrorKind::Archive);
        }
        Ok(content)
    }
}

/// Key of a parsed archive in an archive cache: the indexed file it was read
/// from, as of its recorded modification time.
#[derive(Clone)]
pub struct ArchiveSource {
    pub identity: CacheIdentity,
    pub lineage: Arc<[FileRecord]>,
    pub engine: WeakEngine,
}
impl ArchiveSource {
    pub fn new(engine: &lode_index::Engine, lineage: Vec<FileRecord>) -> Self {
        Self {
            identity: engine.identity().clone(),
            lineage: lineage.into(),
            engine: engine.downgrade(),
        }
    }

    fn file(&self) -> Option<&FileRecord> {
        self.lineage.last()
    }

    fn path(&self) -> String {
        self.file().map(|file| file.path.clone()).unwrap_or_default()
    }
}
impl PartialEq for ArchiveSource {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
            && self.file().map(|file| (file.id, file.mtime)) == other.file().map(|file| (file.id, file.mtime))
    }
}
impl Eq for ArchiveSource {}
impl Hash for ArchiveSource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
        self.file().map(|file| (file.id, file.mtime)).hash(state);
    }
}

pub type ArchiveCache = ResourceCache<ArchiveSource, Archive>;

/// A cache that opens archives through the engine owning them.
pub fn archive_cache(capacity: usize) -> ArchiveCache {
    ResourceCache::new(
        capacity,
        |source: &ArchiveSource| {
            let engine = source
                .engine
                .upgrade()
                .ok_or_raise(|| IndexErrorKind::OwningCacheNotOpen(source.identity.clone()))?;
            let stream = engine.open_lineage(&source.lineage, OpenMode::Binary)?;
            debug!(path = %source.path(), "loading archive");
            Archive::load(stream).or_raise(|| IndexErrorKind::SourceUnreadable(source.path()))
        },
        |archive: Archive| debug!(members = archive.members().len(), "closing archive"),
    )
}
