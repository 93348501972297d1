//! Path filtering and storage modes shared by the filesystem mines.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use lode_index::Engine;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// How discovered filesystem paths are stored in the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Relative {
    /// Exactly as walked.
    #[default]
    Absolute,
    /// Relative to the process's working directory at indexing time. Files
    /// are opened relative to the working directory at read time.
    WorkingDir,
    /// Relative to the directory holding the index file, so the index and
    /// its data can be moved together.
    Index,
}

#[repr(u8)]
#[derive(facet::Facet)]
#[cfg_attr(test, derive(Debug, PartialEq))]
pub(crate) enum RelativeProxy {
    A,
    W,
    I,
}
impl From<Relative> for RelativeProxy {
    fn from(relative: Relative) -> Self {
        match relative {
            Relative::Absolute => Self::A,
            Relative::WorkingDir => Self::W,
            Relative::Index => Self::I,
        }
    }
}
impl From<RelativeProxy> for Relative {
    fn from(relative: RelativeProxy) -> Self {
        match relative {
            RelativeProxy::A => Self::Absolute,
            RelativeProxy::W => Self::WorkingDir,
            RelativeProxy::I => Self::Index,
        }
    }
}

impl Relative {
    /// Directory stored paths are relative to, if any.
    pub fn base(&self, engine: &Engine) -> Option<PathBuf> {
        match self {
            Relative::Absolute => None,
            Relative::WorkingDir => std::env::current_dir().ok(),
            Relative::Index => match engine.location() {
                Some(location) => location.parent().and_then(|dir| std::path::absolute(dir).ok()),
                None => {
                    warn!("paths relative to an in-memory index are stored as walked");
                    None
                },
            },
        }
    }

    /// The form of `path` to store, given the base from [`Relative::base`].
    pub fn store(base: Option<&Path>, path: &Path) -> PathBuf {
        match base {
            Some(base) => std::path::absolute(path)
                .map(|path| relative_to(&path, base))
                .unwrap_or_else(|_| path.to_path_buf()),
            None => path.to_path_buf(),
        }
    }

    /// The filesystem location of a stored path.
    pub fn resolve(base: Option<&Path>, stored: &str) -> PathBuf {
        match base {
            Some(base) => base.join(stored),
            None => PathBuf::from(stored),
        }
    }
}

/// Lexical path from `base` to `path`, both absolute.
fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path: Vec<Component> = path.components().collect();
    let base: Vec<Component> = base.components().collect();
    let common = path.iter().zip(&base).take_while(|(a, b)| a == b).count();
    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &path[common..] {
        relative.push(component);
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

/// Which discovered files a mine leaves out.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    suffixes: BTreeSet<String>,
    patterns: Vec<Regex>,
}
impl Exclusions {
    pub fn new<S, P>(suffixes: S, patterns: P) -> Result<Self>
    where
        S: IntoIterator,
        S::Item: Into<String>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        let mut compiled: Vec<Regex> = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if compiled.iter().any(|regex| regex.as_str() == pattern) {
                continue;
            }
            compiled.push(Regex::new(pattern).or_raise(|| ErrorKind::InvalidPattern(pattern.to_string()))?);
        }
        compiled.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(Self {
            suffixes: suffixes.into_iter().map(Into::into).collect(),
            patterns: compiled,
        })
    }

    /// Suffixes, sorted.
    pub fn suffixes(&self) -> Vec<String> {
        self.suffixes.iter().cloned().collect()
    }

    /// Pattern sources, sorted.
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.iter().map(|regex| regex.as_str().to_string()).collect()
    }

    /// Whether `path` is left out: its name's last dot-separated component
    /// is an excluded suffix, or any pattern matches somewhere in it.
    pub fn excludes(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        let suffix = name.rsplit('.').next().unwrap_or(name);
        self.suffixes.contains(suffix) || self.patterns.iter().any(|regex| regex.is_match(path))
    }
}
impl PartialEq for Exclusions {
    fn eq(&self, other: &Self) -> bool {
        self.suffixes == other.suffixes && self.patterns() == other.patterns()
    }
}
impl Eq for Exclusions {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/data/run/a.txt", "/data", "run/a.txt")]
    #[case("/data/run/a.txt", "/data/run", "a.txt")]
    #[case("/data/run/a.txt", "/data/other", "../run/a.txt")]
    #[case("/data", "/data", ".")]
    fn test_relative_to(#[case] path: &str, #[case] base: &str, #[case] expected: &str) {
        assert_eq!(relative_to(Path::new(path), Path::new(base)), PathBuf::from(expected));
    }

    #[test]
    fn test_store_and_resolve() {
        let base = Path::new("/srv/index");
        let stored = Relative::store(Some(base), Path::new("/srv/index/data/a.tar"));
        assert_eq!(stored, PathBuf::from("data/a.tar"));
        assert_eq!(Relative::resolve(Some(base), "data/a.tar"), PathBuf::from("/srv/index/data/a.tar"));
        assert_eq!(Relative::store(None, Path::new("data/a.tar")), PathBuf::from("data/a.tar"));
    }

    #[rstest]
    #[case("runs/a/trajectory.tar", false)]
    #[case("runs/a/notes.txt", true)]
    #[case("runs/a/archive.tar.zip", true)]
    #[case("runs/.cache/trajectory.tar", true)]
    #[case("runs/a/README", false)]
    fn test_excludes(#[case] path: &str, #[case] excluded: bool) {
        let exclusions = Exclusions::new(["txt", "zip"], [r"/\..*"]).unwrap();
        assert_eq!(exclusions.excludes(path), excluded);
    }

    #[rstest]
    #[case(&["gz"], true)]
    #[case(&["tar"], false)]
    #[case(&["tar.gz"], false)]
    fn test_suffix_is_last_dot_component(#[case] suffixes: &[&str], #[case] excluded: bool) {
        let exclusions = Exclusions::new(suffixes.iter().copied(), Vec::<String>::new()).unwrap();
        assert_eq!(exclusions.excludes("runs/x.tar.gz"), excluded);
    }

    #[test]
    fn test_exclusions_are_normalised() {
        let a = Exclusions::new(["txt", "zip", "txt"], ["b", "a"]).unwrap();
        let b = Exclusions::new(["zip", "txt"], ["a", "b", "a"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.suffixes(), vec!["txt", "zip"]);
        assert_eq!(a.patterns(), vec!["a", "b"]);
    }

    #[test]
    fn test_invalid_pattern() {
        let err = Exclusions::new(Vec::<String>::new(), ["("]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPattern(pattern) if pattern == "("));
    }

    #[test]
    fn test_relative_proxy() {
        for relative in [Relative::Absolute, Relative::WorkingDir, Relative::Index] {
            assert_eq!(Relative::from(RelativeProxy::from(relative)), relative);
        }
    }
}
