//! # minitar Core Library
//!
//! This crate writes POSIX ustar archives. It backs the `minitar` command-line application,
//! and its public API can be used to produce archives programmatically.
//!
//! ## Key Modules
//!
//! - [`header`]: Encodes filesystem metadata into 512-byte ustar headers.
//! - [`archive`]: The archive sink, a file or standard output, written strictly sequentially.
//! - [`create`]: Walks the inputs and streams headers, data blocks and the end-of-archive marker.
//! - [`progress`]: Per-entry progress reporting.
//!
//! ## Examples
//!
//! ```no_run
//! use minitar::archive::Destination;
//! use minitar::create::{create, CreateOptions};
//! use std::path::PathBuf;
//!
//! let summary = create(
//!     &[PathBuf::from("docs")],
//!     Destination::from_path("docs.tar"),
//!     false,
//!     None,
//!     CreateOptions::default(),
//! )?;
//! println!("{} entries", summary.entries);
//! # Ok::<(), minitar::ArchiverError>(())
//! ```

#[cfg(not(unix))]
compile_error!("minitar stores Unix ownership and file-type metadata and only builds on Unix targets");

pub mod archive;
pub mod cli;
pub mod cli_runner;
pub mod common;
pub mod create;
pub mod error;
pub use error::ArchiverError;

pub mod header;
pub mod progress;

// Unix path and metadata helpers
pub mod fsx;
