//! Component C: the per-thread slot manager - first-touch allocation, the
//! per-module base-pointer cache, and thread-exit cleanup.
//!
//! Every thread that touches a counter binds, lazily and at most once, to
//! one slot of the active stats file (or, if no file is configured, a
//! private scratch region never visible to the reader). Once bound,
//! reaching any given counter is a cached pointer plus an index added to
//! it - no lookup, no lock, no atomic. Slots are sized from each module's
//! final counter count, which [`inventory`] has already collected in full
//! by the time any thread runs this code, so there is no "late counter"
//! case to special-case here.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};

use crate::error::StatsError;
use crate::file::{MappedSlot, SharedFile};
use crate::module::{Module, MODULE_REGISTRY};

/// Size, in bytes, of a slot's fixed header word: the single `i64` that
/// doubles as the negated tid while the slot is active and as the next
/// free-list offset while it is vacant.
pub(crate) const SLOT_HEADER_SIZE: usize = std::mem::size_of::<i64>();

#[cfg(target_os = "linux")]
fn gettid() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

#[cfg(not(target_os = "linux"))]
fn gettid() -> i64 {
    // No portable `gettid()`. This crate's file format and free-list
    // recycling are specified against Linux's real thread-id namespace;
    // off Linux we hand out a synthetic, process-unique id so a thread
    // still binds to exactly one slot, but nothing here is exercised
    // outside scratch mode (see [`Backing::Scratch`]).
    use std::sync::atomic::{AtomicI64, Ordering};
    thread_local! {
        static TID: i64 = next_synthetic_tid();
    }
    fn next_synthetic_tid() -> i64 {
        static NEXT: AtomicI64 = AtomicI64::new(1);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }
    TID.with(|t| *t)
}

/// Where one thread's bound values actually live.
enum Backing {
    /// A real slot in the active, file-backed stats file.
    File {
        shared: Arc<SharedFile>,
        offset: u64,
        /// `None` only during the brief window inside `Drop`.
        slot: Option<MappedSlot>,
    },
    /// No stats file was configured when this thread first touched a
    /// counter. A private anonymous mapping stands in so counters keep
    /// working, but it is never part of any file and the reader never
    /// sees it.
    Scratch { mmap: MmapMut },
}

struct SlotGuard {
    backing: Backing,
}

impl SlotGuard {
    fn values_base_mut(&mut self) -> *mut i64 {
        match &mut self.backing {
            Backing::File { slot, .. } => slot
                .as_mut()
                .expect("slot is only taken during drop")
                .values_base_mut(),
            // SAFETY: `mmap` is at least `SLOT_HEADER_SIZE` bytes, laid
            // out identically to a real slot (header word, then values).
            Backing::Scratch { mmap } => unsafe { (mmap.as_mut_ptr() as *mut i64).add(1) },
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Backing::File { shared, offset, slot } = &mut self.backing {
            if let Some(slot) = slot.take() {
                shared.free_slot(*offset, slot);
            }
        }
    }
}

thread_local! {
    /// This thread's binding, created lazily on first counter touch.
    static SLOT_GUARD: RefCell<Option<SlotGuard>> = const { RefCell::new(None) };

    /// Per-module cached base pointer, keyed by the module's address.
    static MODULE_BASE: RefCell<HashMap<usize, *mut i64>> = RefCell::new(HashMap::new());
}

fn module_key(module: &Module) -> usize {
    module as *const Module as usize
}

fn create_slot_guard() -> Result<SlotGuard, StatsError> {
    match crate::active_file() {
        Some(shared) => {
            shared.publish_geometry()?;
            let slot_size = shared.slot_size();
            let (offset, mut slot) = shared.alloc_slot(slot_size)?;
            slot.publish_active(gettid());
            Ok(SlotGuard {
                backing: Backing::File {
                    shared,
                    offset,
                    slot: Some(slot),
                },
            })
        }
        None => {
            let value_count: u32 = MODULE_REGISTRY
                .lock()
                .expect("module registry poisoned")
                .iter()
                .map(|m| m.value_count())
                .sum();
            let size = SLOT_HEADER_SIZE + 8 * value_count as usize;
            let mut mmap = MmapOptions::new()
                .len(size.max(SLOT_HEADER_SIZE))
                .map_anon()
                .map_err(StatsError::Mmap)?;
            // Never visible to the reader, but still flagged "do not
            // fork" like a real slot: a forked child must not inherit a
            // stale scratch mapping before it calls `atfork_child`.
            let rc = unsafe {
                libc::madvise(mmap.as_mut_ptr() as *mut _, mmap.len(), libc::MADV_DONTFORK)
            };
            if rc != 0 {
                return Err(StatsError::Sys(std::io::Error::last_os_error()));
            }
            Ok(SlotGuard {
                backing: Backing::Scratch { mmap },
            })
        }
    }
}

/// Binds the current thread to a slot, if it isn't already, and caches
/// every registered module's base pointer for this thread.
fn ensure_thread_slot() {
    SLOT_GUARD.with(|guard_cell| {
        if guard_cell.borrow().is_some() {
            return;
        }
        let mut guard =
            create_slot_guard().expect("allocating this thread's stats slot failed");

        let modules = MODULE_REGISTRY.lock().expect("module registry poisoned");
        let mut cursor = guard.values_base_mut();
        let mut bases = Vec::with_capacity(modules.len());
        for module in modules.iter() {
            bases.push((module_key(module), cursor));
            // SAFETY: slots are sized to fit exactly the sum of every
            // module's counter count, in the same registration order
            // used here; every name across every module was already
            // collected before this thread ran, so the sizes agree.
            cursor = unsafe { cursor.add(module.value_count() as usize) };
        }
        drop(modules);

        MODULE_BASE.with(|m| {
            let mut m = m.borrow_mut();
            for (key, ptr) in bases {
                m.insert(key, ptr);
            }
        });

        *guard_cell.borrow_mut() = Some(guard);
    });
}

impl Module {
    /// Returns a pointer to this thread's cell for counter `idx` within
    /// this module, binding the thread to a slot first if necessary.
    pub fn value_ptr(&self, idx: u32) -> *mut i64 {
        let key = module_key(self);
        let base = match MODULE_BASE.with(|m| m.borrow().get(&key).copied()) {
            Some(base) => base,
            None => {
                ensure_thread_slot();
                MODULE_BASE
                    .with(|m| m.borrow().get(&key).copied())
                    .expect("ensure_thread_slot populates every registered module")
            }
        };
        // SAFETY: `idx` is always a valid index handed out by
        // `Module::index_of`, which never exceeds `value_count()`.
        unsafe { base.add(idx as usize) }
    }
}

/// Frees this thread's current slot binding (if any) the ordinary way -
/// onto the old file's free list if it was file-backed, or simply
/// unmapped if it was a scratch region - and clears its cached base
/// pointers. The next counter touch on this thread lazily rebinds,
/// picking up whatever file is active at that time.
///
/// Call this from the thread that is reconfiguring the active file
/// (`open`/`close`); other threads that already bound to the previous
/// file are left alone and keep using it until they exit.
pub(crate) fn drop_current_thread_slot() {
    SLOT_GUARD.with(|guard_cell| {
        guard_cell.borrow_mut().take();
    });
    MODULE_BASE.with(|m| m.borrow_mut().clear());
}

/// Drops this thread's slot binding (if any) without running the normal
/// free-list push, and clears its cached base pointers.
///
/// Call this in a child process immediately after `fork()`, before
/// touching any counter. `MADV_DONTFORK` means the child's copy of the
/// address space simply does not have the slot mapping any more; the
/// `Drop` impl's usual `free_slot` push would write through a mapping
/// that no longer exists in this process.
pub(crate) fn reset_after_fork() {
    SLOT_GUARD.with(|guard_cell| {
        if let Some(guard) = guard_cell.borrow_mut().take() {
            // The mapping inside `guard` is gone in this process (never
            // inherited across fork); forgetting it skips `Drop`'s
            // `munmap`/free-list push, both of which would touch memory
            // or file state this process no longer owns a slot in.
            std::mem::forget(guard);
        }
    });
    MODULE_BASE.with(|m| m.borrow_mut().clear());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{CounterDecl, Module};

    #[test]
    fn scratch_mode_counters_are_independent_per_thread() {
        static M: Module = Module::new();
        inventory::submit! { CounterDecl { module: &M, name: "slot.scratch_counter" } }
        let idx = M.index_of("slot.scratch_counter");

        let a = unsafe { *M.value_ptr(idx) };
        assert_eq!(a, 0);
        unsafe { *M.value_ptr(idx) = 41 };
        unsafe { *M.value_ptr(idx) += 1 };
        assert_eq!(unsafe { *M.value_ptr(idx) }, 42);

        std::thread::spawn(move || {
            // A fresh thread gets its own slot; this must not observe 42.
            assert_eq!(unsafe { *M.value_ptr(idx) }, 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn distinct_counters_in_one_module_get_distinct_cells() {
        static M: Module = Module::new();
        inventory::submit! { CounterDecl { module: &M, name: "slot.first" } }
        inventory::submit! { CounterDecl { module: &M, name: "slot.second" } }
        let first = M.index_of("slot.first");
        let second = M.index_of("slot.second");

        unsafe { *M.value_ptr(first) = 7 };
        unsafe { *M.value_ptr(second) = 99 };

        assert_eq!(unsafe { *M.value_ptr(first) }, 7);
        assert_eq!(unsafe { *M.value_ptr(second) }, 99);
    }
}
