//! Recursive filesystem walk.

use crate::compression::decompressed;
use crate::error::{Error, ErrorKind, Result as MineResult};
use crate::paths::{Exclusions, Relative, RelativeProxy};
use async_stream::stream;
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use facet_json::{from_str as from_json, to_string as to_json};
use futures::{Stream as FuturesStream, StreamExt};
use lode_index::error::{ErrorKind as IndexErrorKind, Result};
use lode_index::{Engine, FileRecord, IndexContext, Mine, MineKind, OpenMode, Stream};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::UtcDateTime;
use tokio::fs;
use tracing::{info, instrument, warn};

type WalkStream = Pin<Box<dyn FuturesStream<Item = MineResult<(PathBuf, UtcDateTime)>> + Send>>;

enum WalkEntry {
    File(PathBuf, UtcDateTime),
    Descend(PathBuf),
    Skip,
}

fn io_error(path: &Path) -> impl FnOnce() -> ErrorKind + '_ {
    move || ErrorKind::Io(path.to_path_buf())
}

async fn process_entry(path: PathBuf, visited: &mut HashSet<PathBuf>) -> MineResult<WalkEntry> {
    // Follows symlinks.
    let metadata = match fs::metadata(&path).await {
        Ok(metadata) => metadata,
        // A dangling symlink.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(WalkEntry::Skip),
        Err(err) => return Err(err).or_raise(io_error(&path)),
    };
    if metadata.is_dir() {
        let canonical = fs::canonicalize(&path).await.or_raise(io_error(&path))?;
        if !visited.insert(canonical) {
            return Ok(WalkEntry::Skip);
        }
        return Ok(WalkEntry::Descend(path));
    }
    if metadata.is_file() {
        let modified = metadata.modified().or_raise(io_error(&path))?;
        return Ok(WalkEntry::File(path, UtcDateTime::from(modified)));
    }
    Ok(WalkEntry::Skip)
}

/// Every regular file below `root`, following symlinks and visiting each
/// directory once.
fn walk(root: PathBuf) -> WalkStream {
    Box::pin(stream! {
        let mut visited = HashSet::new();
        if let Ok(canonical) = fs::canonicalize(&root).await {
            visited.insert(canonical);
        }
        let mut stack = vec![root];
        'dirs: while let Some(current) = stack.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(err) => {
                    yield Err::<_, Error>(exn::Exn::from(err).raise(ErrorKind::Io(current.clone())));
                    continue 'dirs;
                },
            };
            let mut children = Vec::new();
            'entries: loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => children.push(entry.path()),
                    Ok(None) => break 'entries,
                    Err(err) => {
                        yield Err(exn::Exn::from(err).raise(ErrorKind::Io(current.clone())));
                        continue 'dirs;
                    },
                }
            }
            children.sort();
            let mut subdirectories = Vec::new();
            for path in children {
                match process_entry(path, &mut visited).await {
                    Ok(WalkEntry::File(path, mtime)) => yield Ok((path, mtime)),
                    Ok(WalkEntry::Descend(path)) => subdirectories.push(path),
                    Ok(WalkEntry::Skip) => {},
                    Err(err) => yield Err(err),
                }
            }
            // Pop in name order.
            stack.extend(subdirectories.into_iter().rev());
        }
    })
}

/// Indexes every regular file below a root directory.
///
/// Files are discovered only on forced passes. Stored paths follow the
/// mine's [`Relative`] mode; files are opened relative to the same base.
#[derive(Debug)]
pub struct Directory {
    root: PathBuf,
    exclusions: Exclusions,
    relative: Relative,
    passes: AtomicUsize,
}
impl Directory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exclusions: Exclusions::default(),
            relative: Relative::default(),
            passes: AtomicUsize::new(0),
        }
    }

    pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn with_relative(mut self, relative: Relative) -> Self {
        self.relative = relative;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exclusions(&self) -> &Exclusions {
        &self.exclusions
    }

    pub fn relative(&self) -> Relative {
        self.relative
    }

    /// Number of filesystem walks this instance has performed.
    pub fn passes(&self) -> usize {
        self.passes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Mine for Directory {
    #[instrument(skip_all, fields(root = %self.root.display(), force))]
    async fn index(&self, ctx: &mut IndexContext<'_>, force: bool) -> Result<()> {
        if !force {
            return Ok(());
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
        let root = self.root.display().to_string();
        let metadata = fs::metadata(&self.root)
            .await
            .or_raise(|| IndexErrorKind::SourceUnreadable(root.clone()))?;
        if !metadata.is_dir() {
            exn::bail!(IndexErrorKind::SourceUnreadable(root));
        }

        let base = self.relative.base(ctx.engine());
        let (mut inserted, mut excluded) = (0usize, 0usize);
        let mut files = walk(self.root.clone());
        while let Some(file) = files.next().await {
            let (path, mtime) = match file {
                Ok(file) => file,
                Err(err) => {
                    warn!(error = ?err, "skipping unreadable entry");
                    continue;
                },
            };
            let stored = Relative::store(base.as_deref(), &path);
            let stored = stored.to_string_lossy();
            if self.exclusions.excludes(&stored) {
                excluded += 1;
                continue;
            }
            ctx.insert_file(&stored, mtime, None).await?;
            inserted += 1;
        }
        info!(inserted, excluded, "directory walked");
        Ok(())
    }

    fn open(&self, engine: &Engine, lineage: &[FileRecord], mode: OpenMode) -> Result<Stream> {
        let file = lineage
            .last()
            .ok_or_raise(|| IndexErrorKind::InvalidData("empty lineage"))?;
        let path = Relative::resolve(self.relative.base(engine).as_deref(), &file.path);
        let stream: Stream = Box::new(
            std::fs::File::open(&path).or_raise(|| IndexErrorKind::SourceUnreadable(file.path.clone()))?,
        );
        match mode {
            OpenMode::Binary => Ok(stream),
            OpenMode::Text => decompressed(stream).or_raise(|| IndexErrorKind::SourceUnreadable(file.path.clone())),
        }
    }
}

#[derive(facet::Facet)]
struct DirectoryProxy {
    #[facet(rename = "r")]
    root: String,
    #[facet(rename = "x")]
    patterns: Vec<String>,
    #[facet(rename = "s")]
    suffixes: Vec<String>,
    #[facet(rename = "l")]
    relative: RelativeProxy,
}

impl MineKind for Directory {
    const KIND: &'static str = "directory";
    const VERSION: u32 = 1;

    fn encode(&self) -> Result<String> {
        let proxy = DirectoryProxy {
            root: self.root.to_string_lossy().into_owned(),
            patterns: self.exclusions.patterns(),
            suffixes: self.exclusions.suffixes(),
            relative: self.relative.into(),
        };
        to_json(&proxy).or_raise(|| IndexErrorKind::InvalidData("directory configuration"))
    }

    fn decode(version: u32, payload: &str) -> Result<Self> {
        if version != Self::VERSION {
            exn::bail!(IndexErrorKind::InvalidData("directory configuration version"));
        }
        let proxy = from_json::<DirectoryProxy>(payload)
            .or_raise(|| IndexErrorKind::InvalidData("directory configuration"))?;
        let exclusions = Exclusions::new(proxy.suffixes, proxy.patterns)
            .or_raise(|| IndexErrorKind::InvalidData("directory configuration"))?;
        Ok(Directory::new(proxy.root)
            .with_exclusions(exclusions)
            .with_relative(proxy.relative.into()))
    }
}
