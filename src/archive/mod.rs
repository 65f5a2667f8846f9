//! # Archive Sink
//!
//! Owns the destination byte stream of one archive-creation run: either a regular file or the
//! process's standard output. Writes are strictly sequential; nothing already emitted is ever
//! revisited, so every header must be complete (checksum included) before it gets here.

use std::ffi::OsStr;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, StdoutLock, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::fsx::FileIdentity;
use crate::header::BLOCK_SIZE;
use crate::ArchiverError;

/// Destination token meaning "the process's standard output".
pub const STDOUT_PATH: &str = "-";

/// Permission bits of a newly created archive: rw-r--r--.
pub const ARCHIVE_MODE: u32 = 0o644;

// 64 KiB keeps syscalls few while staying a whole number of blocks.
const WRITE_BUFFER_SIZE: usize = 128 * BLOCK_SIZE;

static ZERO_BLOCK: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

/// Where the archive goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

impl Destination {
    /// Interprets a user-supplied path, mapping [`STDOUT_PATH`] to standard output.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if path.as_os_str() == OsStr::new(STDOUT_PATH) {
            Destination::Stdout
        } else {
            Destination::File(path.to_path_buf())
        }
    }

    /// The path used in error messages.
    pub fn path(&self) -> PathBuf {
        match self {
            Destination::Stdout => PathBuf::from(STDOUT_PATH),
            Destination::File(path) => path.clone(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Stdout => f.write_str("<stdout>"),
            Destination::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// How a file destination is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the file or truncate existing content.
    Create,
    /// Keep existing content and add after it. With `resume_at`, content past that offset
    /// (the old end-of-archive marker) is cut off first.
    Append { resume_at: Option<u64> },
}

enum Sink {
    Stdout(BufWriter<StdoutLock<'static>>),
    File(BufWriter<File>),
}

/// An open archive destination. Dropping it without [`Archive::close`] still releases the
/// descriptor but swallows any deferred write error.
pub struct Archive {
    destination: Destination,
    sink: Sink,
    identity: Option<FileIdentity>,
    bytes_written: u64,
}

impl Archive {
    /// Opens `destination`. Standard output is used as-is and never opened by path.
    pub fn open(destination: Destination, mode: OpenMode) -> Result<Self, ArchiverError> {
        let (sink, identity) = match &destination {
            Destination::Stdout => {
                let out = io::stdout().lock();
                (Sink::Stdout(BufWriter::with_capacity(WRITE_BUFFER_SIZE, out)), None)
            }
            Destination::File(path) => {
                let file = open_file(path, mode)
                    .map_err(|source| ArchiverError::CantOpenFile { source, path: path.clone() })?;
                let identity = file.metadata().ok().map(|m| FileIdentity::of(&m));
                (Sink::File(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)), identity)
            }
        };
        debug!(%destination, ?mode, "archive opened");
        Ok(Self { destination, sink, identity, bytes_written: 0 })
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Device/inode of a file destination, used to keep the archive out of itself.
    pub fn identity(&self) -> Option<FileIdentity> {
        self.identity
    }

    /// Bytes written during this run.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Appends `bytes` to the stream.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), ArchiverError> {
        let result = match &mut self.sink {
            Sink::Stdout(w) => w.write_all(bytes),
            Sink::File(w) => w.write_all(bytes),
        };
        result.map_err(|source| ArchiverError::Io { source, path: self.destination.path() })?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Appends `count` zero bytes.
    pub fn write_zeros(&mut self, count: u64) -> Result<(), ArchiverError> {
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(BLOCK_SIZE as u64) as usize;
            self.write(&ZERO_BLOCK[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Flushes buffered data and releases the destination.
    ///
    /// Errors that only surface at flush or `close(2)` time are reported here. Standard output
    /// is flushed but left open for the rest of the process.
    pub fn close(self) -> Result<(), ArchiverError> {
        let path = self.destination.path();
        let to_archiver_error = |source: io::Error| ArchiverError::Io { source, path: path.clone() };
        match self.sink {
            Sink::Stdout(mut w) => w.flush().map_err(to_archiver_error)?,
            Sink::File(w) => {
                let file = w.into_inner().map_err(|e| to_archiver_error(e.into_error()))?;
                close_file(file).map_err(to_archiver_error)?;
            }
        }
        debug!(destination = %self.destination, bytes = self.bytes_written, "archive closed");
        Ok(())
    }
}

fn open_file(path: &Path, mode: OpenMode) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).mode(ARCHIVE_MODE);
    match mode {
        OpenMode::Create => options.write(true).truncate(true),
        OpenMode::Append { .. } => options.append(true),
    };
    let file = options.open(path)?;

    if let OpenMode::Append { resume_at: Some(offset) } = mode {
        let len = file.metadata()?.len();
        if offset > len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("existing entries end at byte {offset} but the archive is only {len} bytes"),
            ));
        }
        if offset < len {
            debug!(offset, len, "dropping old end-of-archive marker");
            file.set_len(offset)?;
        }
    }
    Ok(file)
}

/// Closes `file` explicitly so an error from `close(2)` is not lost the way `Drop` loses it.
fn close_file(file: File) -> io::Result<()> {
    let fd = file.into_raw_fd();
    nix::unistd::close(fd).map_err(io::Error::from)
}
