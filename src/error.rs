use std::path::PathBuf;

use crate::header::HeaderError;

/// The primary error type for all operations in the `minitar` crate.
#[derive(Debug)]
pub enum ArchiverError {
    /// The archive destination could not be opened (permissions, missing directory,
    /// descriptor exhaustion, ...).
    CantOpenFile { source: std::io::Error, path: PathBuf },

    /// An I/O error occurred while reading a source entry or writing the archive.
    /// Includes the path where the error happened.
    Io { source: std::io::Error, path: PathBuf },

    /// A source entry could not be turned into a ustar header.
    Header { source: HeaderError, path: PathBuf },

    /// The run finished and the archive was terminated, but some entries were skipped.
    /// Only produced when the caller asked to keep going after per-entry failures.
    Incomplete { failures: Vec<ArchiverError> },

    /// The existing-entry index supplied for append mode could not be parsed.
    SerdeJson(serde_json::Error),

    /// Any other failure, such as an existing-entry index that describes an impossible archive.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl ArchiverError {
    /// The path this error is about, when there is one.
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            ArchiverError::CantOpenFile { path, .. }
            | ArchiverError::Io { path, .. }
            | ArchiverError::Header { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArchiverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiverError::CantOpenFile { source, path } => write!(f, "Cannot open archive '{}': {}", path.display(), source),
            ArchiverError::Io { source, path } => write!(f, "I/O error on path '{}': {}", path.display(), source),
            ArchiverError::Header { source, path } => write!(f, "Cannot archive '{}': {}", path.display(), source),
            ArchiverError::Incomplete { failures } => {
                write!(f, "{} entr{} could not be archived", failures.len(), if failures.len() == 1 { "y" } else { "ies" })?;
                for failure in failures {
                    write!(f, "\n  {}", failure)?;
                }
                Ok(())
            }
            ArchiverError::SerdeJson(e) => write!(f, "Existing index error: {}", e),
            ArchiverError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ArchiverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArchiverError::CantOpenFile { source, .. } => Some(source),
            ArchiverError::Io { source, .. } => Some(source),
            ArchiverError::Header { source, .. } => Some(source),
            ArchiverError::SerdeJson(e) => Some(e),
            ArchiverError::Other(e) => Some(e.as_ref()),
            ArchiverError::Incomplete { .. } => None,
        }
    }
}

impl From<serde_json::Error> for ArchiverError {
    fn from(err: serde_json::Error) -> Self {
        ArchiverError::SerdeJson(err)
    }
}
