//! Common types shared by the header encoder and the archive writer.

use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::fsx;

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;
const S_IFLNK: u32 = libc::S_IFLNK as u32;
const S_IFCHR: u32 = libc::S_IFCHR as u32;
const S_IFBLK: u32 = libc::S_IFBLK as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFIFO: u32 = libc::S_IFIFO as u32;

/// The entry kinds a ustar header can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Regular,
    Symlink,
    CharDevice,
    BlockDevice,
    Directory,
    Fifo,
}

impl EntryType {
    /// Derives the type from the `S_IFMT` bits of a `st_mode` value.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(EntryType::Regular),
            S_IFLNK => Some(EntryType::Symlink),
            S_IFCHR => Some(EntryType::CharDevice),
            S_IFBLK => Some(EntryType::BlockDevice),
            S_IFDIR => Some(EntryType::Directory),
            S_IFIFO => Some(EntryType::Fifo),
            _ => None,
        }
    }

    /// The ustar `typeflag` byte.
    pub fn typeflag(self) -> u8 {
        match self {
            EntryType::Regular => b'0',
            EntryType::Symlink => b'2',
            EntryType::CharDevice => b'3',
            EntryType::BlockDevice => b'4',
            EntryType::Directory => b'5',
            EntryType::Fifo => b'6',
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, EntryType::CharDevice | EntryType::BlockDevice)
    }
}

/// Metadata snapshot of one filesystem entry, taken once right before it is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedFile {
    /// Member name as stored in the archive.
    pub path: Vec<u8>,
    /// Full `st_mode`, type bits included.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: i64,
    /// Device number the node refers to; only meaningful for device entries.
    pub rdev: u64,
    /// Target of a symlink, read at capture time.
    pub link_target: Option<Vec<u8>>,
}

impl ArchivedFile {
    /// `lstat`s `source` and records it under the member name `path`.
    pub fn capture(source: &Path, path: Vec<u8>) -> io::Result<Self> {
        let metadata = std::fs::symlink_metadata(source)?;
        let link_target = if metadata.file_type().is_symlink() {
            Some(fsx::path_bytes(&std::fs::read_link(source)?).to_vec())
        } else {
            None
        };
        Ok(Self::from_metadata(path, &metadata, link_target))
    }

    pub fn from_metadata(path: Vec<u8>, metadata: &Metadata, link_target: Option<Vec<u8>>) -> Self {
        Self {
            path,
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            size: metadata.size(),
            mtime: metadata.mtime(),
            rdev: metadata.rdev(),
            link_target,
        }
    }

    pub fn entry_type(&self) -> Option<EntryType> {
        EntryType::from_mode(self.mode)
    }

    /// Bytes of content following the header: the file size for regular files, zero otherwise.
    pub fn data_size(&self) -> u64 {
        match self.entry_type() {
            Some(EntryType::Regular) => self.size,
            _ => 0,
        }
    }
}
