//! Progress reporting for archive creation.
//!
//! The writer calls a user-supplied callback once per archived entry, after its header and
//! data reached the sink.

use std::time::{Duration, Instant};

use crate::common::ArchivedFile;
use crate::header::PosixHeader;

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone)]
pub struct ProgressState<'a> {
    /// The entry that was just written.
    pub entry: &'a ArchivedFile,
    /// Its encoded header.
    pub header: &'a PosixHeader,
    pub processed_entries: u64,
    /// Content bytes of regular files written so far.
    pub processed_bytes: u64,
    /// Total bytes emitted to the archive so far, headers and padding included.
    pub archive_bytes: u64,
    pub elapsed_time: Duration,
    pub speed_mbps: f32,
}

/// Progress callback function type
pub type ProgressCallback = dyn Fn(&ProgressState<'_>);

/// Running totals for one archive-creation run.
#[derive(Debug)]
pub struct ProgressTracker {
    started: Instant,
    processed_entries: u64,
    processed_bytes: u64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self { started: Instant::now(), processed_entries: 0, processed_bytes: 0 }
    }

    /// Record an entry as written, with `data_bytes` of file content.
    pub fn record_entry(&mut self, data_bytes: u64) {
        self.processed_entries += 1;
        self.processed_bytes += data_bytes;
    }

    pub fn processed_entries(&self) -> u64 {
        self.processed_entries
    }

    pub fn processed_bytes(&self) -> u64 {
        self.processed_bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Builds the state passed to callbacks for the entry just recorded.
    pub fn state<'a>(&self, entry: &'a ArchivedFile, header: &'a PosixHeader, archive_bytes: u64) -> ProgressState<'a> {
        let elapsed_time = self.elapsed();
        let secs = elapsed_time.as_secs_f32();
        let speed_mbps = if secs > 0.0 {
            (self.processed_bytes as f32 / (1024.0 * 1024.0)) / secs
        } else {
            0.0
        };
        ProgressState {
            entry,
            header,
            processed_entries: self.processed_entries,
            processed_bytes: self.processed_bytes,
            archive_bytes,
            elapsed_time,
            speed_mbps,
        }
    }
}
