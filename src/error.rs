//! Error types for the stats file lifecycle and the reader.
//!
//! [`StatsError`] covers everything that can go wrong while configuring or
//! growing the writer-side stats file (`open`, geometry publication, slot
//! allocation). [`ReaderError`] is the reader's separate taxonomy: format
//! errors are never confused with I/O errors, matching the error taxonomy
//! the counters are specified against.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while configuring the active stats file.
///
/// These are all slow-path, non-hot-path errors: nothing on the counter
/// write path can fail (it is a single store), so every variant here
/// originates from `open()`, geometry publication, or slot allocation.
#[derive(Debug, Error)]
pub enum StatsError {
    /// The stats file could not be created, opened, or locked.
    #[error("{path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another process already holds the advisory lock on this path.
    #[error("{0}: already locked by another process")]
    AlreadyLocked(PathBuf),

    /// The temporary file used for the atomic rename could not be created
    /// or renamed into place.
    #[error("replacing {path}: {source}")]
    Replace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Growing the file (`posix_fallocate`) or mapping a slot failed.
    #[error("extending or mapping stats file: {0}")]
    Mmap(#[source] io::Error),

    /// A system call on the allocation slow path failed outside of the
    /// cases above (e.g. `madvise`, thread-id lookup).
    #[error("system call failed: {0}")]
    Sys(#[source] io::Error),
}

/// Errors raised while reading a stats file.
///
/// Distinct from [`StatsError`] per the specified taxonomy: a corrupt file
/// is a format error, not an I/O error, even though both terminate the
/// reader with a nonzero status.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// The file could not be opened, `fstat`'d, or mapped.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The path did not name a regular file.
    #[error("{0}: not a regular file")]
    NotRegularFile(PathBuf),

    /// The file is smaller than the fixed header, or the slot region past
    /// `slot_offset` is not a whole multiple of `slot_size`.
    #[error("{0}: invalid file format")]
    InvalidFormat(PathBuf),
}
