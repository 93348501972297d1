//! Mine Error Types
//!
//! Errors raised while walking directories and parsing archives. They are
//! wrapped into [`lode_index::error::ErrorKind`] where they cross the
//! [`Mine`](lode_index::Mine) boundary.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A mine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for mine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Reading from the filesystem or an opened stream failed.
    #[display("I/O error: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// Data is corrupt or malformed. Don't retry with the same input.
    #[display("invalid or corrupted data")]
    InvalidData,
    /// The archive index could not be read.
    #[display("malformed archive")]
    Archive,
    /// An archive was asked for a member it doesn't contain.
    #[display("no such member: {_0}")]
    MissingMember(#[error(not(source))] String),
    /// An exclusion pattern isn't a valid regular expression.
    #[display("invalid pattern: {_0}")]
    InvalidPattern(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exn::ResultExt;

    #[test]
    fn test_display() {
        assert_eq!(ErrorKind::Io(PathBuf::from("/data/a.tar")).to_string(), "I/O error: /data/a.tar");
        assert_eq!(ErrorKind::MissingMember("frames/0/x".to_string()).to_string(), "no such member: frames/0/x");
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::Io(PathBuf::new()).is_retryable());
        assert!(!ErrorKind::Archive.is_retryable());
    }

    #[test]
    fn test_error_from_result() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));
        let err = result.or_raise(|| ErrorKind::Io(PathBuf::from("x"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Io(path) if path == &PathBuf::from("x")));
    }
}
