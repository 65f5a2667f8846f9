//! Entries already present in an archive that is being appended to.
//!
//! Parsing an existing archive is not this crate's job. Callers hand in the entries they know
//! about, either directly through [`ExistingHeaders`] or as a JSON index read by [`load_index`].

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::header::BLOCK_SIZE;
use crate::ArchiverError;

/// One previously written entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExistingEntry {
    /// Member name as stored in the archive (`prefix` followed by `name`).
    pub path: String,
    /// Byte offset of the entry's header.
    pub offset: u64,
    /// Size of the data following the header.
    #[serde(default)]
    pub size: u64,
}

impl ExistingEntry {
    /// Offset just past this entry's padded data, or `None` if it does not fit a `u64`.
    pub fn end_offset(&self) -> Option<u64> {
        let block = BLOCK_SIZE as u64;
        let data = self.size.div_ceil(block).checked_mul(block)?;
        self.offset.checked_add(block)?.checked_add(data)
    }
}

/// Ordered view of the entries an archive already holds.
pub trait ExistingHeaders {
    fn entries(&self) -> &[ExistingEntry];

    /// Where new entries start: right after the last known entry's data, which is where the
    /// old end-of-archive marker begins.
    ///
    /// Fails when the last entry does not start on a block boundary or ends past `u64::MAX`.
    fn resume_offset(&self) -> Result<Option<u64>, ArchiverError> {
        let Some(last) = self.entries().last() else {
            return Ok(None);
        };
        if last.offset % BLOCK_SIZE as u64 != 0 {
            let msg = format!(
                "existing entry '{}' starts at byte {}, not on a {BLOCK_SIZE}-byte boundary",
                last.path, last.offset
            );
            return Err(ArchiverError::Other(msg.into()));
        }
        last.end_offset().map(Some).ok_or_else(|| {
            let msg = format!(
                "existing entry '{}' at byte {} with {} bytes of data ends past the largest possible offset",
                last.path, last.offset, last.size
            );
            ArchiverError::Other(msg.into())
        })
    }

    /// Whether an entry named `path` is already present.
    fn contains(&self, path: &[u8]) -> bool {
        self.entries().iter().any(|e| e.path.as_bytes() == path)
    }
}

impl ExistingHeaders for [ExistingEntry] {
    fn entries(&self) -> &[ExistingEntry] {
        self
    }
}

impl ExistingHeaders for Vec<ExistingEntry> {
    fn entries(&self) -> &[ExistingEntry] {
        self
    }
}

/// Reads a JSON array of [`ExistingEntry`] values.
pub fn load_index(path: &Path) -> Result<Vec<ExistingEntry>, ArchiverError> {
    let file = File::open(path).map_err(|source| ArchiverError::Io { source, path: path.to_path_buf() })?;
    let entries = serde_json::from_reader(BufReader::new(file))?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn entry(path: &str, offset: u64, size: u64) -> ExistingEntry {
        ExistingEntry { path: path.to_string(), offset, size }
    }

    #[test]
    fn end_offset_rounds_data_up_to_blocks() {
        assert_eq!(entry("d", 0, 0).end_offset(), Some(512));
        assert_eq!(entry("f", 0, 1).end_offset(), Some(1024));
        assert_eq!(entry("f", 0, 512).end_offset(), Some(1024));
        assert_eq!(entry("f", 1024, 513).end_offset(), Some(1024 + 512 + 1024));
    }

    #[test]
    fn end_offset_overflow_is_none() {
        assert_eq!(entry("f", u64::MAX - 100, 0).end_offset(), None);
        assert_eq!(entry("f", 0, u64::MAX).end_offset(), None);
        assert_eq!(entry("f", 1024, u64::MAX - 1024).end_offset(), None);
    }

    #[test]
    fn resume_after_last_entry() -> Result<(), Box<dyn std::error::Error>> {
        let entries = vec![entry("a", 0, 100), entry("b", 1024, 0)];
        assert_eq!(entries.resume_offset()?, Some(1536));
        assert_eq!(Vec::<ExistingEntry>::new().resume_offset()?, None);
        Ok(())
    }

    #[test]
    fn impossible_resume_offsets_are_errors() {
        let overflowing = vec![entry("huge", u64::MAX - 511, 0)];
        assert!(matches!(overflowing.resume_offset(), Err(ArchiverError::Other(_))));

        let misaligned = vec![entry("odd", 700, 3)];
        let err = misaligned.resume_offset().unwrap_err();
        assert!(err.to_string().contains("boundary"), "{err}");
    }

    #[test]
    fn contains_matches_exact_names() {
        let entries = vec![entry("dir/file", 0, 1)];
        assert!(entries.contains(b"dir/file"));
        assert!(!entries.contains(b"dir"));
        assert!(!entries.contains(b"dir/file2"));
    }

    #[test]
    fn index_loads_from_json() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = NamedTempFile::new()?;
        std::io::Write::write_all(
            &mut file,
            br#"[{"path": "a.txt", "offset": 0, "size": 5}, {"path": "sub", "offset": 1024}]"#,
        )?;

        let entries = load_index(file.path())?;
        assert_eq!(entries, vec![entry("a.txt", 0, 5), entry("sub", 1024, 0)]);
        Ok(())
    }

    #[test]
    fn malformed_index_is_a_json_error() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = NamedTempFile::new()?;
        std::io::Write::write_all(&mut file, b"{not json")?;
        assert!(matches!(load_index(file.path()), Err(ArchiverError::SerdeJson(_))));
        Ok(())
    }
}
