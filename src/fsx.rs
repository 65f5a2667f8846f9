//! Unix filesystem helpers.
//!
//! Member names in a ustar archive are raw byte strings, so paths are handled as bytes via
//! `OsStrExt` rather than going through UTF-8.

use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Raw bytes of a path.
pub fn path_bytes(path: &Path) -> &[u8] {
    path.as_os_str().as_bytes()
}

/// Archive member name for `path`: its bytes with any leading `/` removed, so extraction
/// always lands below the current directory.
pub fn member_name(path: &Path) -> &[u8] {
    let bytes = path_bytes(path);
    let start = bytes.iter().position(|&b| b != b'/').unwrap_or(bytes.len());
    &bytes[start..]
}

/// `(st_dev, st_ino)` pair identifying a file independently of the path used to reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    pub fn of(metadata: &Metadata) -> Self {
        Self { dev: metadata.dev(), ino: metadata.ino() }
    }
}
