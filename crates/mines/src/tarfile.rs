//! Members of tar archives as indexed files.

use crate::archive::{ArchiveCache, ArchiveSource, Member, archive_cache};
use crate::compression::decompressed;
use crate::paths::{Exclusions, Relative, RelativeProxy};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use facet_json::{from_str as from_json, to_string as to_json};
use lode_index::error::{ErrorKind, Result};
use lode_index::{Engine, FileRecord, IndexContext, Mine, MineKind, OpenMode, Stream};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use time::UtcDateTime;
use tracing::{info, instrument, warn};

/// `LIKE` patterns of the files treated as archives when no target is set.
const ARCHIVE_PATTERNS: &[&str] = &["%.tar", "%.tar.gz", "%.tgz", "%.tar.bz2"];

const DEFAULT_CACHE_SIZE: usize = 16;

static ARCHIVES: LazyLock<ArchiveCache> = LazyLock::new(|| archive_cache(DEFAULT_CACHE_SIZE));

/// Load the member table of an indexed archive off the async runtime.
pub(crate) async fn members(cache: &ArchiveCache, engine: &Engine, lineage: Vec<FileRecord>) -> Result<Vec<Member>> {
    let path = lineage.last().map(|file| file.path.clone()).unwrap_or_default();
    let cache = cache.clone();
    let source = ArchiveSource::new(engine, lineage);
    tokio::task::spawn_blocking(move || cache.get(&source).map(|archive| archive.members().to_vec()))
        .await
        .or_raise(|| ErrorKind::SourceUnreadable(path))?
}

/// Indexes the regular members of tar archives.
///
/// With a target, the archive itself is recorded as a file of this mine and
/// its members point at it through their parent. Without one, every indexed
/// file that looks like a tar archive is expanded. Compressed archives are
/// recognised by their content.
///
/// Member paths are unique per mine: when two archives expanded by the same
/// mine hold a member with the same name, that name is recorded once, under
/// the archive indexed first. Register one targeted mine per archive to keep
/// such members apart.
#[derive(Debug, Default)]
pub struct TarArchive {
    target: Option<PathBuf>,
    exclusions: Exclusions,
    relative: Relative,
}
impl TarArchive {
    /// Expand every archive already in the index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index one archive from the filesystem.
    pub fn target(target: impl Into<PathBuf>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// How the target's path is stored. Has no effect without a target.
    pub fn with_relative(mut self, relative: Relative) -> Self {
        self.relative = relative;
        self
    }

    pub fn target_path(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    /// Number of parsed archives kept open across all tar mines.
    pub fn cache_size() -> usize {
        ARCHIVES.capacity()
    }

    pub fn set_cache_size(capacity: usize) {
        ARCHIVES.set_capacity(capacity);
    }

    /// Record the target archive itself.
    async fn insert_target(&self, ctx: &mut IndexContext<'_>, target: &Path) -> Result<FileRecord> {
        let metadata = tokio::fs::metadata(target)
            .await
            .or_raise(|| ErrorKind::SourceUnreadable(target.display().to_string()))?;
        let modified = metadata
            .modified()
            .or_raise(|| ErrorKind::SourceUnreadable(target.display().to_string()))?;
        let stored = Relative::store(self.relative.base(ctx.engine()).as_deref(), target);
        let id = ctx
            .insert_file(&stored.to_string_lossy(), UtcDateTime::from(modified), None)
            .await?;
        ctx.file(id).await?.ok_or_raise(|| ErrorKind::FileNotFound(id))
    }

    async fn index_members(&self, ctx: &mut IndexContext<'_>, archive: &FileRecord) -> Result<usize> {
        let lineage = ctx.lineage(archive.id).await?;
        let members = members(&ARCHIVES, ctx.engine(), lineage).await?;
        let mut inserted = 0;
        for member in members.iter().filter(|member| !self.exclusions.excludes(&member.name)) {
            ctx.insert_file(&member.name, member.mtime.unwrap_or(archive.mtime), Some(archive.id))
                .await?;
            inserted += 1;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl Mine for TarArchive {
    #[instrument(skip_all, fields(target = ?self.target, force))]
    async fn index(&self, ctx: &mut IndexContext<'_>, force: bool) -> Result<()> {
        if !force {
            return Ok(());
        }
        match &self.target {
            Some(target) => {
                let archive = self.insert_target(ctx, target).await?;
                let inserted = self.index_members(ctx, &archive).await?;
                info!(path = %archive.path, inserted, "archive indexed");
            },
            None => {
                let own = ctx.mine_id();
                let archives = ctx.files_like(ARCHIVE_PATTERNS).await?;
                for archive in archives.into_iter().filter(|file| file.mine != own) {
                    match self.index_members(ctx, &archive).await {
                        Ok(inserted) => info!(path = %archive.path, inserted, "archive indexed"),
                        Err(err) => warn!(path = %archive.path, error = ?err, "skipping unreadable archive"),
                    }
                }
            },
        }
        Ok(())
    }

    fn open(&self, engine: &Engine, lineage: &[FileRecord], mode: OpenMode) -> Result<Stream> {
        let (file, containers) = lineage
            .split_last()
            .ok_or_raise(|| ErrorKind::InvalidData("empty lineage"))?;
        let stream: Stream = if containers.is_empty() {
            // The target archive itself.
            let path = Relative::resolve(self.relative.base(engine).as_deref(), &file.path);
            Box::new(std::fs::File::open(&path).or_raise(|| ErrorKind::SourceUnreadable(file.path.clone()))?)
        } else {
            let archive = ARCHIVES.get(&ArchiveSource::new(engine, containers.to_vec()))?;
            let content = archive
                .read(&file.path)
                .or_raise(|| ErrorKind::SourceUnreadable(file.path.clone()))?;
            Box::new(Cursor::new(content))
        };
        match mode {
            OpenMode::Binary => Ok(stream),
            OpenMode::Text => decompressed(stream).or_raise(|| ErrorKind::SourceUnreadable(file.path.clone())),
        }
    }
}

#[derive(facet::Facet)]
struct TarArchiveProxy {
    #[facet(rename = "t")]
    target: Option<String>,
    #[facet(rename = "x")]
    patterns: Vec<String>,
    #[facet(rename = "s")]
    suffixes: Vec<String>,
    #[facet(rename = "l")]
    relative: RelativeProxy,
}

impl MineKind for TarArchive {
    const KIND: &'static str = "tar";
    const VERSION: u32 = 1;

    fn encode(&self) -> Result<String> {
        let proxy = TarArchiveProxy {
            target: self.target.as_ref().map(|target| target.to_string_lossy().into_owned()),
            patterns: self.exclusions.patterns(),
            suffixes: self.exclusions.suffixes(),
            relative: self.relative.into(),
        };
        to_json(&proxy).or_raise(|| ErrorKind::InvalidData("tar configuration"))
    }

    fn decode(version: u32, payload: &str) -> Result<Self> {
        if version != Self::VERSION {
            exn::bail!(ErrorKind::InvalidData("tar configuration version"));
        }
        let proxy = from_json::<TarArchiveProxy>(payload).or_raise(|| ErrorKind::InvalidData("tar configuration"))?;
        let exclusions = Exclusions::new(proxy.suffixes, proxy.patterns)
            .or_raise(|| ErrorKind::InvalidData("tar configuration"))?;
        Ok(Self {
            target: proxy.target.map(PathBuf::from),
            exclusions,
            relative: proxy.relative.into(),
        })
    }
}
