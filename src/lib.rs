//! Lock-free, per-thread statistic counters for long-running processes.
//!
//! A counter is a dotted name (`"http.requests"`) that resolves, once per
//! call site, to a pointer-sized signed integer an application thread
//! mutates with plain stores - no locks, no atomics, no runtime name
//! lookup once the call site has run once. A separate process samples
//! values out-of-band by reading a shared-memory-backed file this crate
//! maintains.
//!
//! ```
//! slotstat::stats_module!(MODULE);
//!
//! fn handle_request() {
//!     *slotstat::counter!(MODULE, "demo.requests") += 1;
//! }
//! ```
//!
//! Call [`open`] once, near process start, to point counters at a file a
//! `reader` process can sample; without it, counters still work (each
//! thread gets a private scratch slot) but nothing is ever visible
//! outside the process. Setting the `SLOTSTAT_FILE` environment variable
//! before the process starts has the same effect and needs no explicit
//! call - see the crate's startup constructor below.
//!
//! After `fork()`, call [`atfork_child`] in the child before it touches
//! any counter.

mod counter;
mod error;
mod file;
mod module;
mod slot;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};

use fs4::fs_std::FileExt;
use tempfile::NamedTempFile;

pub use counter::Counter;
pub use error::{ReaderError, StatsError};
pub use module::Module;

pub mod reader;

/// Implementation details [`stats_module!`] needs to expand in callers'
/// crates. Not part of the public API.
#[doc(hidden)]
pub mod __private {
    pub use crate::module::{register_module, CounterDecl};
    pub use ctor::ctor;
    pub use inventory;
}

use file::SharedFile;

static ACTIVE_FILE: Mutex<Option<Arc<SharedFile>>> = Mutex::new(None);

pub(crate) fn active_file() -> Option<Arc<SharedFile>> {
    ACTIVE_FILE
        .lock()
        .expect("active stats file lock poisoned")
        .clone()
}

/// Installs `path` as the active stats file, atomically replacing
/// whatever was there before.
///
/// This tears down the *calling thread's* current binding first (if any),
/// whether it was bound to a different file or to no file at all - the
/// next counter touch on this thread lazily rebinds to the new one.
/// Other threads that already bound to a previous file keep using it
/// until they exit; their counters are simply absent from the new file.
/// Not safe to call concurrently with other threads already using
/// counters - call once, near process start, or otherwise serialize
/// callers yourself.
///
/// Returns an error without disturbing `path` on disk if the file cannot
/// be created, is already locked by another process, or the atomic
/// replace fails for any other reason.
pub fn open<P: AsRef<Path>>(path: P) -> Result<(), StatsError> {
    let path = path.as_ref().to_path_buf();
    teardown_current_file();
    configure_file(&path)
}

/// Closes the active stats file without installing a new one.
///
/// Equivalent to the spec's `open(NULL)`: after this call counters keep
/// working (each thread falls back to a private scratch slot) but are no
/// longer visible to any reader.
pub fn close() {
    teardown_current_file();
}

fn teardown_current_file() {
    slot::drop_current_thread_slot();
    *ACTIVE_FILE.lock().expect("active stats file lock poisoned") = None;
}

fn configure_file(path: &Path) -> Result<(), StatsError> {
    // Locking the file that is *currently* at `path` (creating an empty
    // one if absent) is what detects a second process already using this
    // path - the replacement below always targets a brand new inode, so
    // locking only that would never contend with anyone.
    let guard_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|source| StatsError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    guard_file
        .try_lock_exclusive()
        .map_err(|_| StatsError::AlreadyLocked(path.to_path_buf()))?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp = NamedTempFile::new_in(dir).map_err(|source| StatsError::Replace {
        path: path.to_path_buf(),
        source,
    })?;
    // Locked before it becomes visible, so the file appears pre-locked
    // from the instant `rename` makes it visible under `path`.
    tmp.as_file()
        .try_lock_exclusive()
        .map_err(|source| StatsError::Replace {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::WouldBlock, source),
        })?;

    // `rename` is the last fallible step; on failure the original file
    // at `path` is untouched.
    let new_file = tmp.persist(path).map_err(|e| StatsError::Replace {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    drop(guard_file);

    let shared = Arc::new(SharedFile::new(new_file, path.to_path_buf())?);
    *ACTIVE_FILE.lock().expect("active stats file lock poisoned") = Some(shared);
    Ok(())
}

/// Recovers this thread's counter state after a `fork()` that did not
/// immediately `exec*`.
///
/// Must be called in the child, on the thread that called `fork`, before
/// that thread touches any counter. The child inherits no slot mappings
/// (they are mapped `MADV_DONTFORK`); this drops the stale local state so
/// the next counter access lazily allocates a fresh slot from the same
/// file.
pub fn atfork_child() {
    slot::reset_after_fork();
}

/// If `SLOTSTAT_FILE` is set at process start, behaves as though
/// [`open`] were called with its value, then unsets the variable so
/// children of a later `exec*` do not inherit it. A failure here is
/// fatal, matching the spec's "process-lifetime errors are fatal" rule
/// for environment-driven initialization.
#[ctor::ctor]
fn init_from_env() {
    if let Ok(path) = std::env::var("SLOTSTAT_FILE") {
        if let Err(err) = open(&path) {
            panic!("SLOTSTAT_FILE={path}: {err}");
        }
        // SAFETY: this constructor runs single-threaded, before `main`.
        unsafe { std::env::remove_var("SLOTSTAT_FILE") };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{counter, stats_module};
    use std::sync::Mutex;

    /// `ACTIVE_FILE` is one process-wide slot; `cargo test` runs tests in
    /// parallel threads of the same process by default, so every test
    /// that calls `open`/`close` must hold this for its duration.
    static GLOBAL_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn open_close_roundtrip_leaves_file_intact() {
        let _guard = GLOBAL_TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats");
        open(&path).unwrap();
        *slotstat_counter_for_test() += 1;
        close();
        assert!(path.exists());
    }

    fn slotstat_counter_for_test() -> Counter {
        stats_module!(TEST_MODULE);
        counter!(TEST_MODULE, "lib.roundtrip")
    }

    #[test]
    fn open_replace_does_not_mutate_old_file_content() {
        let _guard = GLOBAL_TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");

        open(&path_a).unwrap();
        let len_before = std::fs::metadata(&path_a).unwrap().len();

        open(&path_b).unwrap();
        let len_after = std::fs::metadata(&path_a).unwrap().len();
        assert_eq!(len_before, len_after);
    }

    #[test]
    fn single_thread_three_counters_reports_only_touched_ones() {
        let _guard = GLOBAL_TEST_LOCK.lock().unwrap();
        stats_module!(SINGLE_THREAD_MODULE);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("single.stats");
        open(&path).unwrap();

        *counter!(SINGLE_THREAD_MODULE, "single.a") += 1;
        *counter!(SINGLE_THREAD_MODULE, "single.a") += 1;
        *counter!(SINGLE_THREAD_MODULE, "single.b") += 1;
        // "single.c"'s declaration is submitted at startup the moment this
        // call site is compiled in, whether or not it ever actually runs;
        // `if false` keeps it out of this test's own counts while still
        // proving it shows up in the snapshot at its default value.
        if false {
            *counter!(SINGLE_THREAD_MODULE, "single.c") += 1;
        }

        let dumps = reader::snapshot(&path).unwrap();
        assert_eq!(dumps.len(), 1);
        let mut values: std::collections::HashMap<_, _> = dumps[0]
            .counters
            .iter()
            .map(|c| (c.name.as_str(), c.value))
            .collect();
        assert_eq!(values.remove("single.a"), Some(2));
        assert_eq!(values.remove("single.b"), Some(1));
        assert_eq!(values.remove("single.c"), Some(0));
        assert!(values.is_empty());

        close();
    }

    #[test]
    fn two_threads_see_distinct_slots_for_the_same_counter() {
        let _guard = GLOBAL_TEST_LOCK.lock().unwrap();
        stats_module!(TWO_THREAD_MODULE);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two.stats");
        open(&path).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..3 {
                    *counter!(TWO_THREAD_MODULE, "two.hits") += 1;
                }
            });
            scope.spawn(|| {
                for _ in 0..5 {
                    *counter!(TWO_THREAD_MODULE, "two.hits") += 1;
                }
            });
        });

        let dumps = reader::snapshot(&path).unwrap();
        assert_eq!(dumps.len(), 2);
        let mut totals: Vec<i64> = dumps
            .iter()
            .flat_map(|d| d.counters.iter())
            .map(|c| c.value)
            .collect();
        totals.sort_unstable();
        assert_eq!(totals, vec![3, 5]);

        close();
    }

    #[test]
    fn thread_churn_reuses_freed_slots_from_the_free_list() {
        let _guard = GLOBAL_TEST_LOCK.lock().unwrap();
        stats_module!(CHURN_MODULE);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("churn.stats");
        open(&path).unwrap();

        for _ in 0..16 {
            std::thread::spawn(|| {
                *counter!(CHURN_MODULE, "churn.touches") += 1;
            })
            .join()
            .unwrap();
        }

        // Each joined thread frees its slot back onto the free list before
        // the next one allocates, so the file should have grown by only
        // one slot's worth of data rather than sixteen.
        let dumps = reader::snapshot(&path).unwrap();
        assert!(dumps.len() <= 2, "expected free-list reuse, got {} live slots", dumps.len());

        close();
    }

    #[test]
    fn atfork_child_resets_the_calling_threads_binding() {
        let _guard = GLOBAL_TEST_LOCK.lock().unwrap();
        stats_module!(FORK_MODULE);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fork.stats");
        open(&path).unwrap();

        *counter!(FORK_MODULE, "fork.before") += 1;
        // `fork()` itself is not exercised here (forking a multi-threaded
        // test process is unsafe); `atfork_child` is called directly to
        // confirm it drops this thread's stale binding so the next touch
        // allocates a fresh slot, which is the only thing the child-side
        // contract depends on.
        atfork_child();
        *counter!(FORK_MODULE, "fork.after") += 1;

        let dumps = reader::snapshot(&path).unwrap();
        // Two allocations from the same OS thread: one before the reset,
        // one after. Both remain live (neither was ever freed).
        assert_eq!(dumps.len(), 2);

        close();
    }
}
