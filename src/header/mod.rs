//! # ustar Header Encoding
//!
//! Turns an [`ArchivedFile`] snapshot into the 512-byte POSIX ustar header that precedes the
//! entry's data in the archive.
//!
//! ## Layout
//!
//! | field    | offset | width | encoding                      |
//! |----------|--------|-------|-------------------------------|
//! | name     | 0      | 100   | raw bytes, NUL-padded         |
//! | mode     | 100    | 8     | octal                         |
//! | uid      | 108    | 8     | octal                         |
//! | gid      | 116    | 8     | octal                         |
//! | size     | 124    | 12    | octal                         |
//! | mtime    | 136    | 12    | octal                         |
//! | chksum   | 148    | 8     | 6 octal digits, NUL, space    |
//! | typeflag | 156    | 1     | tag byte                      |
//! | linkname | 157    | 100   | raw bytes, NUL-padded         |
//! | magic    | 257    | 6     | `"ustar\0"`                   |
//! | version  | 263    | 2     | `"00"`                        |
//! | uname    | 265    | 32    | raw bytes, NUL-padded         |
//! | gname    | 297    | 32    | raw bytes, NUL-padded         |
//! | devmajor | 329    | 8     | octal                         |
//! | devminor | 337    | 8     | octal                         |
//! | prefix   | 345    | 155   | raw bytes, NUL-padded         |
//! | pad      | 500    | 12    | zero                          |
//!
//! Octal fields are zero-padded on the left and NUL-terminated, so a field of width `w` holds
//! values up to `8^(w-1) - 1`. Anything larger is reported as [`HeaderError::FieldOverflow`];
//! nothing is ever truncated silently. The checksum is computed last, over the finished record.

mod identity;

pub use identity::{IdentityKind, IdentityPolicy, IdentityResolver, SystemIdentities};

use std::fmt;
use std::ops::Range;

use thiserror::Error;
use tracing::warn;

use crate::common::{ArchivedFile, EntryType};

/// Size of a header record and of every data block.
pub const BLOCK_SIZE: usize = 512;

/// Longest path that still fits the `prefix` + `name` pair.
pub const MAX_PATH_LEN: usize = NAME_CAPACITY + PREFIX.width;

/// Bytes of the `name` field used for the path tail. The last byte stays NUL.
const NAME_CAPACITY: usize = NAME.width - 1;

/// Permission, setuid/setgid and sticky bits kept in the `mode` field.
const MODE_BITS: u32 = 0o7777;

pub const MAGIC_TOKEN: &[u8; 6] = b"ustar\0";
pub const VERSION_TOKEN: &[u8; 2] = b"00";

/// A named, fixed-width slice of the header record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
}

impl Field {
    const fn new(name: &'static str, offset: usize, width: usize) -> Self {
        Self { name, offset, width }
    }

    pub fn range(self) -> Range<usize> {
        self.offset..self.offset + self.width
    }
}

pub const NAME: Field = Field::new("name", 0, 100);
pub const MODE: Field = Field::new("mode", 100, 8);
pub const UID: Field = Field::new("uid", 108, 8);
pub const GID: Field = Field::new("gid", 116, 8);
pub const SIZE: Field = Field::new("size", 124, 12);
pub const MTIME: Field = Field::new("mtime", 136, 12);
pub const CHKSUM: Field = Field::new("chksum", 148, 8);
pub const TYPEFLAG: Field = Field::new("typeflag", 156, 1);
pub const LINKNAME: Field = Field::new("linkname", 157, 100);
pub const MAGIC: Field = Field::new("magic", 257, 6);
pub const VERSION: Field = Field::new("version", 263, 2);
pub const UNAME: Field = Field::new("uname", 265, 32);
pub const GNAME: Field = Field::new("gname", 297, 32);
pub const DEVMAJOR: Field = Field::new("devmajor", 329, 8);
pub const DEVMINOR: Field = Field::new("devminor", 337, 8);
pub const PREFIX: Field = Field::new("prefix", 345, 155);

/// Reasons an entry cannot be encoded.
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("value {value} does not fit the {width}-byte octal `{field}` field")]
    FieldOverflow { field: &'static str, value: u64, width: usize },

    #[error("path is {len} bytes long, ustar names hold at most {} bytes", MAX_PATH_LEN)]
    PathTooLong { len: usize },

    #[error("`{field}` is {len} bytes long, at most {max} fit")]
    FieldTooLong { field: &'static str, len: usize, max: usize },

    #[error("no {kind} name is known for id {id}")]
    IdentityLookupFailure { kind: IdentityKind, id: u32 },

    #[error("{kind} database lookup for id {id} failed: {source}")]
    IdentityDatabase {
        kind: IdentityKind,
        id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("file type {mode:#o} cannot be stored in a ustar archive")]
    UnsupportedType { mode: u32 },

    #[error("modification time {mtime} is before the epoch")]
    NegativeTimestamp { mtime: i64 },
}

/// `copy_octal` could not fit a value into the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{value} needs more than {digits} octal digits")]
pub struct OctalOverflow {
    pub value: u64,
    pub digits: usize,
}

/// Writes `value` into `dst` as base-8 ASCII digits, right-aligned and left-padded with `'0'`,
/// followed by a terminating NUL in the last byte.
///
/// `dst` is left untouched when the value needs more than `dst.len() - 1` digits.
pub fn copy_octal(dst: &mut [u8], value: u64) -> Result<(), OctalOverflow> {
    let digits = dst.len().saturating_sub(1);
    // 22 octal digits cover every u64.
    let fits = !dst.is_empty() && (digits >= 22 || value >> (3 * digits) == 0);
    if !fits {
        return Err(OctalOverflow { value, digits });
    }

    let mut rest = value;
    for slot in dst[..digits].iter_mut().rev() {
        *slot = b'0' + (rest % 8) as u8;
        rest /= 8;
    }
    dst[digits] = 0;
    Ok(())
}

/// Reads an octal field back. Leading spaces are skipped and parsing stops at the first
/// NUL or space; `None` means the field held something other than octal digits.
pub fn parse_octal(field: &[u8]) -> Option<u64> {
    let digits = field
        .iter()
        .skip_while(|&&b| b == b' ')
        .take_while(|&&b| b != 0 && b != b' ');
    let mut value: u64 = 0;
    for &b in digits {
        if !(b'0'..=b'7').contains(&b) {
            return None;
        }
        value = value.checked_mul(8)?.checked_add(u64::from(b - b'0'))?;
    }
    Some(value)
}

/// Returns the bytes before the first NUL.
fn truncate_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(i) => &bytes[..i],
        None => bytes,
    }
}

/// A single 512-byte ustar header record.
#[derive(Clone, PartialEq, Eq)]
pub struct PosixHeader {
    bytes: [u8; BLOCK_SIZE],
}

impl Default for PosixHeader {
    fn default() -> Self {
        Self { bytes: [0; BLOCK_SIZE] }
    }
}

impl fmt::Debug for PosixHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PosixHeader")
            .field("path", &String::from_utf8_lossy(&self.path()))
            .field("typeflag", &char::from(self.typeflag()))
            .field("size", &self.octal(SIZE))
            .finish()
    }
}

impl PosixHeader {
    /// An all-zero record.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.bytes
    }

    pub fn field(&self, field: Field) -> &[u8] {
        &self.bytes[field.range()]
    }

    fn field_mut(&mut self, field: Field) -> &mut [u8] {
        &mut self.bytes[field.range()]
    }

    /// Decoded value of an octal field.
    pub fn octal(&self, field: Field) -> Option<u64> {
        parse_octal(self.field(field))
    }

    pub fn typeflag(&self) -> u8 {
        self.bytes[TYPEFLAG.offset]
    }

    /// `prefix` followed by `name`, which is the full stored path.
    pub fn path(&self) -> Vec<u8> {
        let mut path = truncate_nul(self.field(PREFIX)).to_vec();
        path.extend_from_slice(truncate_nul(self.field(NAME)));
        path
    }

    pub fn linkname(&self) -> &[u8] {
        truncate_nul(self.field(LINKNAME))
    }

    pub fn uname(&self) -> &[u8] {
        truncate_nul(self.field(UNAME))
    }

    pub fn gname(&self) -> &[u8] {
        truncate_nul(self.field(GNAME))
    }

    /// Unsigned sum of all bytes, with the `chksum` field counted as eight spaces.
    pub fn compute_checksum(&self) -> u32 {
        let chksum = CHKSUM.range();
        self.bytes
            .iter()
            .enumerate()
            .map(|(i, &b)| if chksum.contains(&i) { u32::from(b' ') } else { u32::from(b) })
            .sum()
    }

    /// Whether the stored checksum matches the record.
    pub fn checksum_matches(&self) -> bool {
        self.octal(CHKSUM) == Some(u64::from(self.compute_checksum()))
    }

    fn set_octal(&mut self, field: Field, value: u64) -> Result<(), HeaderError> {
        copy_octal(self.field_mut(field), value).map_err(|_| HeaderError::FieldOverflow {
            field: field.name,
            value,
            width: field.width,
        })
    }

    fn set_bytes(&mut self, field: Field, value: &[u8]) -> Result<(), HeaderError> {
        if value.len() > field.width {
            return Err(HeaderError::FieldTooLong { field: field.name, len: value.len(), max: field.width });
        }
        let slot = self.field_mut(field);
        slot.fill(0);
        slot[..value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Splits `path` so the last (up to) 99 bytes land in `name` and the rest in `prefix`.
    fn set_path(&mut self, path: &[u8]) -> Result<(), HeaderError> {
        let len = path.len();
        if len > MAX_PATH_LEN {
            return Err(HeaderError::PathTooLong { len });
        }
        let cutoff = len - len.min(NAME_CAPACITY);
        self.set_bytes(PREFIX, &path[..cutoff])?;
        self.set_bytes(NAME, &path[cutoff..])
    }

    fn set_linkname(&mut self, target: &[u8]) {
        let kept = target.len().min(LINKNAME.width);
        if kept < target.len() {
            warn!(
                link = %String::from_utf8_lossy(target),
                "symlink target longer than {} bytes, truncating",
                LINKNAME.width
            );
        }
        let slot = self.field_mut(LINKNAME);
        slot.fill(0);
        slot[..kept].copy_from_slice(&target[..kept]);
    }

    /// Stores the checksum as 6 octal digits, a NUL and a space.
    fn seal(&mut self) -> Result<(), HeaderError> {
        let sum = self.compute_checksum();
        let slot = self.field_mut(CHKSUM);
        copy_octal(&mut slot[..CHKSUM.width - 1], u64::from(sum)).map_err(|_| HeaderError::FieldOverflow {
            field: CHKSUM.name,
            value: u64::from(sum),
            width: CHKSUM.width,
        })?;
        slot[CHKSUM.width - 1] = b' ';
        Ok(())
    }
}

/// Splits a raw device number into its major and minor parts.
#[cfg(target_os = "linux")]
fn split_device(rdev: u64) -> (u64, u64) {
    use nix::sys::stat::{major, minor};
    (major(rdev), minor(rdev))
}

#[cfg(not(target_os = "linux"))]
fn split_device(rdev: u64) -> (u64, u64) {
    let dev = rdev as libc::dev_t;
    (libc::major(dev) as u64, libc::minor(dev) as u64)
}

/// Builds headers for captured entries, resolving owner names through `R`.
pub struct HeaderEncoder<R = SystemIdentities> {
    resolver: R,
    policy: IdentityPolicy,
}

impl HeaderEncoder<SystemIdentities> {
    /// Encoder backed by the system user and group databases.
    pub fn system(policy: IdentityPolicy) -> Self {
        Self::new(SystemIdentities::default(), policy)
    }
}

impl<R: IdentityResolver> HeaderEncoder<R> {
    pub fn new(resolver: R, policy: IdentityPolicy) -> Self {
        Self { resolver, policy }
    }

    /// Encodes `file` into a complete, checksummed header.
    ///
    /// Nothing is written anywhere: callers emit the returned record only after this succeeded.
    pub fn fill_header(&self, file: &ArchivedFile) -> Result<PosixHeader, HeaderError> {
        let entry_type = file.entry_type().ok_or(HeaderError::UnsupportedType { mode: file.mode })?;
        let mut header = PosixHeader::new();

        header.set_path(&file.path)?;
        header.set_octal(MODE, u64::from(file.mode & MODE_BITS))?;
        header.set_octal(UID, u64::from(file.uid))?;
        header.set_octal(GID, u64::from(file.gid))?;
        header.set_octal(SIZE, file.data_size())?;
        let mtime = u64::try_from(file.mtime).map_err(|_| HeaderError::NegativeTimestamp { mtime: file.mtime })?;
        header.set_octal(MTIME, mtime)?;

        header.bytes[TYPEFLAG.offset] = entry_type.typeflag();
        if let (EntryType::Symlink, Some(target)) = (entry_type, file.link_target.as_deref()) {
            header.set_linkname(target);
        }

        header.set_bytes(MAGIC, MAGIC_TOKEN)?;
        header.set_bytes(VERSION, VERSION_TOKEN)?;

        let uname = self.resolve(IdentityKind::User, file.uid)?;
        header.set_bytes(UNAME, uname.as_bytes())?;
        let gname = self.resolve(IdentityKind::Group, file.gid)?;
        header.set_bytes(GNAME, gname.as_bytes())?;

        if entry_type.is_device() {
            let (major, minor) = split_device(file.rdev);
            header.set_octal(DEVMAJOR, major)?;
            header.set_octal(DEVMINOR, minor)?;
        }

        header.seal()?;
        Ok(header)
    }

    fn resolve(&self, kind: IdentityKind, id: u32) -> Result<String, HeaderError> {
        let name = match kind {
            IdentityKind::User => self.resolver.user_name(id)?,
            IdentityKind::Group => self.resolver.group_name(id)?,
        };
        match (name, self.policy) {
            (Some(name), _) => Ok(name),
            (None, IdentityPolicy::Fallback) => Ok(String::new()),
            (None, IdentityPolicy::Strict) => Err(HeaderError::IdentityLookupFailure { kind, id }),
        }
    }
}
