//! # Archive Creation
//!
//! Walks the source paths, encodes one header per entry, and streams header and data blocks
//! to an [`Archive`] in walk order, finishing with the end-of-archive marker.
//!
//! Directories are walked depth-first without following symlinks, parent before children,
//! siblings sorted by file name, so the same tree always yields the same bytes.

pub mod existing;

pub use existing::{load_index, ExistingEntry, ExistingHeaders};

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::{Archive, Destination, OpenMode};
use crate::common::{ArchivedFile, EntryType};
use crate::fsx::{self, FileIdentity};
use crate::header::{HeaderEncoder, IdentityPolicy, IdentityResolver, PosixHeader, BLOCK_SIZE};
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::ArchiverError;

/// Two zero blocks terminate every archive.
pub const END_OF_ARCHIVE_LEN: u64 = 2 * BLOCK_SIZE as u64;

// Whole blocks, so only the last read of a file can leave a partial block.
const COPY_BUFFER_SIZE: usize = 128 * BLOCK_SIZE;

/// What to do when a single entry cannot be archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop the run at the first failing entry.
    #[default]
    Abort,
    /// Skip failing entries, finish the archive, then report every failure.
    Continue,
}

/// Knobs for one [`create`] run.
#[derive(Default)]
pub struct CreateOptions {
    pub error_policy: ErrorPolicy,
    pub identity_policy: IdentityPolicy,
    /// In append mode, leave out entries whose name the existing headers already list.
    pub skip_existing: bool,
    /// Called after every archived entry.
    pub progress: Option<Box<ProgressCallback>>,
}

/// Totals of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateSummary {
    pub entries: u64,
    /// Content bytes of regular files.
    pub data_bytes: u64,
    /// Bytes written to the destination in this run, trailer included.
    pub archive_bytes: u64,
    /// Entries left out on purpose (already present, or the archive itself).
    pub skipped: u64,
}

/// Writes `sources` as a ustar archive to `destination`.
///
/// With `append`, existing content is kept and new entries follow it; `existing` then tells
/// where the prior entries end and which names they use. Without `append`, `existing` is not
/// consulted. Owner names come from the system user and group databases.
pub fn create(
    sources: &[PathBuf],
    destination: Destination,
    append: bool,
    existing: Option<&dyn ExistingHeaders>,
    options: CreateOptions,
) -> Result<CreateSummary, ArchiverError> {
    let encoder = HeaderEncoder::system(options.identity_policy);
    create_with_encoder(sources, destination, append, existing, options, encoder)
}

/// [`create`] with a caller-chosen header encoder.
pub fn create_with_encoder<R: IdentityResolver>(
    sources: &[PathBuf],
    destination: Destination,
    append: bool,
    existing: Option<&dyn ExistingHeaders>,
    options: CreateOptions,
    encoder: HeaderEncoder<R>,
) -> Result<CreateSummary, ArchiverError> {
    let existing = if append { existing } else { None };
    let mode = if append {
        let resume_at = match existing {
            Some(existing) => existing.resume_offset()?,
            None => None,
        };
        if resume_at.is_none() && destination_has_data(&destination) {
            warn!(
                archive = %destination,
                "appending after the old end-of-archive marker, readers that stop there will not list new entries"
            );
        }
        OpenMode::Append { resume_at }
    } else {
        OpenMode::Create
    };

    let mut archive = Archive::open(destination, mode)?;
    let mut writer = EntryWriter {
        archive_identity: archive.identity(),
        archive: &mut archive,
        encoder,
        existing,
        options,
        tracker: ProgressTracker::new(),
        failures: Vec::new(),
        skipped: 0,
    };

    for source in sources {
        writer.add_tree(source)?;
    }
    writer.archive.write_zeros(END_OF_ARCHIVE_LEN)?;

    let failures = std::mem::take(&mut writer.failures);
    let summary = CreateSummary {
        entries: writer.tracker.processed_entries(),
        data_bytes: writer.tracker.processed_bytes(),
        archive_bytes: writer.archive.bytes_written(),
        skipped: writer.skipped,
    };
    let elapsed = writer.tracker.elapsed();
    drop(writer);
    archive.close()?;

    info!(
        entries = summary.entries,
        data_bytes = summary.data_bytes,
        archive_bytes = summary.archive_bytes,
        skipped = summary.skipped,
        failed = failures.len(),
        "archive written in {:.2?}",
        elapsed
    );

    if failures.is_empty() {
        Ok(summary)
    } else {
        Err(ArchiverError::Incomplete { failures })
    }
}

/// Whether `destination` is a file that already holds bytes.
pub fn destination_has_data(destination: &Destination) -> bool {
    match destination {
        Destination::Stdout => false,
        Destination::File(path) => std::fs::metadata(path).is_ok_and(|m| m.len() > 0),
    }
}

/// An entry whose header is encoded and whose content, if any, is open for reading.
struct PreparedEntry {
    file: ArchivedFile,
    header: PosixHeader,
    content: Option<File>,
    source: PathBuf,
}

struct EntryWriter<'a, R> {
    archive: &'a mut Archive,
    archive_identity: Option<FileIdentity>,
    encoder: HeaderEncoder<R>,
    existing: Option<&'a dyn ExistingHeaders>,
    options: CreateOptions,
    tracker: ProgressTracker,
    failures: Vec<ArchiverError>,
    skipped: u64,
}

impl<R: IdentityResolver> EntryWriter<'_, R> {
    fn add_tree(&mut self, root: &Path) -> Result<(), ArchiverError> {
        if fsx::path_bytes(root).first() == Some(&b'/') {
            warn!(path = %root.display(), "removing leading '/' from member names");
        }

        for entry in WalkDir::new(root).follow_links(false).follow_root_links(false).sort_by_file_name() {
            match entry {
                Ok(entry) => self.add_entry(entry.path())?,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    self.entry_failed(ArchiverError::Io { source: io::Error::from(err), path })?;
                }
            }
        }
        Ok(())
    }

    fn add_entry(&mut self, source: &Path) -> Result<(), ArchiverError> {
        match self.prepare(source) {
            Ok(Some(prepared)) => self.emit(prepared),
            Ok(None) => Ok(()),
            Err(err) => self.entry_failed(err),
        }
    }

    /// Applies the error policy to a failure that left the stream intact.
    fn entry_failed(&mut self, err: ArchiverError) -> Result<(), ArchiverError> {
        match self.options.error_policy {
            ErrorPolicy::Abort => Err(err),
            ErrorPolicy::Continue => {
                warn!("skipping entry: {}", err);
                self.failures.push(err);
                Ok(())
            }
        }
    }

    /// Captures and encodes `source` without touching the archive. `Ok(None)` means the entry
    /// is deliberately left out.
    fn prepare(&mut self, source: &Path) -> Result<Option<PreparedEntry>, ArchiverError> {
        let io_error = |err: io::Error| ArchiverError::Io { source: err, path: source.to_path_buf() };

        let name = fsx::member_name(source);
        if name.is_empty() {
            debug!(path = %source.display(), "entry has no member name, skipping");
            self.skipped += 1;
            return Ok(None);
        }

        let file = ArchivedFile::capture(source, name.to_vec()).map_err(io_error)?;

        if let Some(identity) = self.archive_identity {
            let metadata = std::fs::symlink_metadata(source).map_err(io_error)?;
            if FileIdentity::of(&metadata) == identity {
                warn!(path = %source.display(), "file is the archive; not dumped");
                self.skipped += 1;
                return Ok(None);
            }
        }

        if self.options.skip_existing && self.existing.is_some_and(|e| e.contains(&file.path)) {
            debug!(path = %source.display(), "already in archive, skipping");
            self.skipped += 1;
            return Ok(None);
        }

        let header = self
            .encoder
            .fill_header(&file)
            .map_err(|err| ArchiverError::Header { source: err, path: source.to_path_buf() })?;

        let content = match file.entry_type() {
            Some(EntryType::Regular) => Some(File::open(source).map_err(io_error)?),
            _ => None,
        };

        Ok(Some(PreparedEntry { file, header, content, source: source.to_path_buf() }))
    }

    /// Writes header and data. Any failure here breaks the stream and aborts the run.
    fn emit(&mut self, prepared: PreparedEntry) -> Result<(), ArchiverError> {
        let PreparedEntry { file, header, content, source } = prepared;
        debug!(path = %source.display(), typeflag = %char::from(header.typeflag()), "adding entry");

        self.archive.write(header.as_bytes())?;
        let size = file.data_size();
        if let Some(content) = content {
            self.copy_data(content, size, &source)?;
        }

        self.tracker.record_entry(size);
        if let Some(progress) = &self.options.progress {
            progress(&self.tracker.state(&file, &header, self.archive.bytes_written()));
        }
        Ok(())
    }

    /// Streams exactly `size` bytes of `content` and pads them to a whole block.
    fn copy_data(&mut self, content: File, size: u64, source: &Path) -> Result<(), ArchiverError> {
        let mut reader = content.take(size);
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied: u64 = 0;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ArchiverError::Io { source: err, path: source.to_path_buf() }),
            };
            self.archive.write(&buf[..n])?;
            copied += n as u64;
        }

        if copied < size {
            warn!(
                path = %source.display(),
                missing = size - copied,
                "file shrank while being read, padding with zeros"
            );
            self.archive.write_zeros(size - copied)?;
        }

        let tail = size % BLOCK_SIZE as u64;
        if tail != 0 {
            self.archive.write_zeros(BLOCK_SIZE as u64 - tail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    fn read_archive(path: &Path) -> Vec<u8> {
        fs::read(path).unwrap()
    }

    #[test]
    fn empty_run_is_just_the_trailer() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let out = dir.path().join("empty.tar");

        let summary = create(&[], Destination::File(out.clone()), false, None, CreateOptions::default())?;

        assert_eq!(summary, CreateSummary { archive_bytes: 1024, ..Default::default() });
        let bytes = read_archive(&out);
        assert_eq!(bytes.len(), 1024);
        assert!(bytes.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn file_data_is_padded_to_blocks() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let src = dir.path().join("data.bin");
        fs::File::create(&src)?.write_all(&[0xAB; 513])?;
        let out = dir.path().join("out.tar");

        let summary = create(&[src], Destination::File(out.clone()), false, None, CreateOptions::default())?;
        assert_eq!(summary.entries, 1);
        assert_eq!(summary.data_bytes, 513);

        let bytes = read_archive(&out);
        assert_eq!(bytes.len(), 512 + 1024 + 1024);
        assert!(bytes[512..1025].iter().all(|&b| b == 0xAB));
        assert!(bytes[1025..].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn walk_order_is_parent_first_and_sorted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("b"))?;
        fs::write(root.join("c.txt"), b"c")?;
        fs::write(root.join("a.txt"), b"a")?;
        fs::write(root.join("b").join("inner"), b"i")?;
        let out = dir.path().join("out.tar");

        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = seen.clone();
        let options = CreateOptions {
            progress: Some(Box::new(move |state: &crate::progress::ProgressState<'_>| {
                sink.borrow_mut().push(state.entry.path.clone());
            })),
            ..Default::default()
        };
        create(&[root.clone()], Destination::File(out), false, None, options)?;

        let base = fsx::member_name(&root).to_vec();
        let expect: Vec<Vec<u8>> = ["", "/a.txt", "/b", "/b/inner", "/c.txt"]
            .iter()
            .map(|suffix| [base.as_slice(), suffix.as_bytes()].concat())
            .collect();
        assert_eq!(*seen.borrow(), expect);
        Ok(())
    }

    #[test]
    fn missing_source_aborts_by_default() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let out = dir.path().join("out.tar");
        let missing = dir.path().join("nope");

        let err = create(&[missing.clone()], Destination::File(out), false, None, CreateOptions::default())
            .unwrap_err();
        assert_eq!(err.path(), Some(missing.as_path()));
        Ok(())
    }

    #[test]
    fn continue_policy_finishes_and_reports() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let good = dir.path().join("good.txt");
        fs::write(&good, b"fine")?;
        let missing = dir.path().join("nope");
        let out = dir.path().join("out.tar");

        let options = CreateOptions { error_policy: ErrorPolicy::Continue, ..Default::default() };
        let err = create(&[missing.clone(), good], Destination::File(out.clone()), false, None, options)
            .unwrap_err();

        match err {
            ArchiverError::Incomplete { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].path(), Some(missing.as_path()));
            }
            other => panic!("unexpected error: {other}"),
        }
        // header + one data block + trailer
        assert_eq!(read_archive(&out).len(), 512 + 512 + 1024);
        Ok(())
    }

    #[test]
    fn continue_policy_skips_entries_that_cannot_be_encoded() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let root = dir.path().join("mixed");
        fs::create_dir(&root)?;
        fs::write(root.join("a.txt"), b"a")?;
        let socket = root.join("b.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket)?;
        fs::write(root.join("c.txt"), b"c")?;
        let out = dir.path().join("out.tar");

        let options = CreateOptions { error_policy: ErrorPolicy::Continue, ..Default::default() };
        let err = create(&[root], Destination::File(out.clone()), false, None, options).unwrap_err();

        match err {
            ArchiverError::Incomplete { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(
                    &failures[0],
                    ArchiverError::Header { source: crate::header::HeaderError::UnsupportedType { .. }, path }
                        if *path == socket
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        // directory + two one-block files + trailer, and no header for the socket
        assert_eq!(read_archive(&out).len(), 512 + 2 * (512 + 512) + 1024);
        Ok(())
    }

    #[test]
    fn encoding_failure_aborts_by_default() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let socket = dir.path().join("s.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket)?;
        let out = dir.path().join("out.tar");

        let err = create(&[socket.clone()], Destination::File(out.clone()), false, None, CreateOptions::default())
            .unwrap_err();
        assert!(matches!(err, ArchiverError::Header { .. }));
        assert_eq!(err.path(), Some(socket.as_path()));
        assert!(read_archive(&out).is_empty());
        Ok(())
    }

    #[test]
    fn overflowing_index_leaves_the_archive_alone() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file = dir.path().join("f");
        fs::write(&file, b"f")?;
        let out = dir.path().join("out.tar");
        create(&[file.clone()], Destination::File(out.clone()), false, None, CreateOptions::default())?;
        let before = read_archive(&out);

        let existing = vec![ExistingEntry { path: "f".to_string(), offset: u64::MAX - 511, size: 0 }];
        let err = create(&[file], Destination::File(out.clone()), true, Some(&existing), CreateOptions::default())
            .unwrap_err();

        assert!(matches!(err, ArchiverError::Other(_)), "{err}");
        assert_eq!(read_archive(&out), before);
        Ok(())
    }

    #[test]
    fn archive_inside_the_tree_is_not_added()-> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("x"), b"x")?;
        let out = dir.path().join("self.tar");

        let summary = create(
            &[dir.path().to_path_buf()],
            Destination::File(out),
            false,
            None,
            CreateOptions::default(),
        )?;
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.skipped, 1);
        Ok(())
    }

    #[test]
    fn append_resumes_after_existing_entries() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::write(&first, b"one")?;
        fs::write(&second, b"two")?;
        let out = dir.path().join("out.tar");

        create(&[first.clone()], Destination::File(out.clone()), false, None, CreateOptions::default())?;
        assert_eq!(read_archive(&out).len(), 2048);

        let existing = vec![ExistingEntry {
            path: String::from_utf8(fsx::member_name(&first).to_vec())?,
            offset: 0,
            size: 3,
        }];
        let summary = create(
            &[second],
            Destination::File(out.clone()),
            true,
            Some(&existing),
            CreateOptions::default(),
        )?;
        assert_eq!(summary.archive_bytes, 512 + 512 + 1024);

        let bytes = read_archive(&out);
        assert_eq!(bytes.len(), 4 * 512 + 1024);
        assert_eq!(&bytes[1024 + 257..1024 + 263], b"ustar\0");
        assert!(bytes[4 * 512..].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn append_can_skip_known_names() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file = dir.path().join("dup");
        fs::write(&file, b"dup")?;
        let out = dir.path().join("out.tar");

        create(&[file.clone()], Destination::File(out.clone()), false, None, CreateOptions::default())?;
        let existing = vec![ExistingEntry {
            path: String::from_utf8(fsx::member_name(&file).to_vec())?,
            offset: 0,
            size: 3,
        }];
        let options = CreateOptions { skip_existing: true, ..Default::default() };
        let summary = create(&[file], Destination::File(out.clone()), true, Some(&existing), options)?;

        assert_eq!(summary.entries, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(read_archive(&out).len(), 2048);
        Ok(())
    }
}
