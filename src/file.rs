//! Component B: the shared stats file - header, name table, slot geometry,
//! and the free-list/fresh-append allocation policy.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

use memmap2::{MmapMut, MmapOptions};

use crate::error::StatsError;
use crate::module::MODULE_REGISTRY;

/// Fixed-layout header written at the start of every stats file.
///
/// Bit-exact, little-endian (the file is architecture-specific, matching
/// the spec: pointer size and endianness follow the writing host).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatsFileHeader {
    pub value_count: u32,
    pub slot_size: u32,
    pub slot_offset: u32,
}

pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<StatsFileHeader>();

fn page_mask() -> u64 {
    static PAGE_MASK: OnceLock<u64> = OnceLock::new();
    *PAGE_MASK.get_or_init(|| {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        page_size as u64 - 1
    })
}

fn cache_line_mask() -> u64 {
    static CACHE_LINE_MASK: OnceLock<u64> = OnceLock::new();
    *CACHE_LINE_MASK.get_or_init(|| {
        let line = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
        // Some kernels/libc report 0 when the topology isn't exposed;
        // fall back to the universally-safe 64 bytes.
        let line = if line > 0 { line as u64 } else { 64 };
        line - 1
    })
}

fn round_up(value: u64, mask: u64) -> u64 {
    (value + mask) & !mask
}

/// Mutable coordination counters shared across `fork()`.
///
/// These must live in an anonymous `MAP_SHARED` mapping rather than
/// ordinary process memory: after `fork()` both parent and child continue
/// appending to the *same* underlying file, so `file_size` and
/// `head_free_offset` have to stay the same physical memory in both
/// processes, not a copy-on-write snapshot that would silently diverge
/// the moment either side allocates a slot.
#[repr(C)]
struct CoordCounters {
    file_size: AtomicU64,
    head_free_offset: AtomicI64,
    /// Set once, after every header and name-table byte has been written,
    /// so a thread that lost the publication race can wait for the
    /// winner instead of reading a half-written header.
    ready: AtomicBool,
    /// Mirrors the published `slot_size` so `SharedFile::slot_size()`
    /// doesn't need to re-map the header on every first-touch.
    slot_size: AtomicU32,
}

/// The currently active, writer-side stats file.
pub(crate) struct SharedFile {
    file: File,
    path: PathBuf,
    coord_mmap: MmapMut,
}

// SAFETY: `coord_mmap` is a `MAP_SHARED` region; every access through
// `counters()` goes through atomics, so concurrent use from multiple
// threads (and, after fork, multiple processes) is sound.
unsafe impl Send for SharedFile {}
unsafe impl Sync for SharedFile {}

impl SharedFile {
    pub(crate) fn new(file: File, path: PathBuf) -> Result<Self, StatsError> {
        let coord_mmap = MmapOptions::new()
            .len(std::mem::size_of::<CoordCounters>())
            .map_anon()
            .map_err(StatsError::Mmap)?;
        Ok(SharedFile {
            file,
            path,
            coord_mmap,
        })
    }

    fn counters(&self) -> &CoordCounters {
        // SAFETY: the mapping is exactly `size_of::<CoordCounters>()`
        // bytes, zero-filled by the kernel, which is a valid all-zero bit
        // pattern for both atomic fields.
        unsafe { &*(self.coord_mmap.as_ptr() as *const CoordCounters) }
    }

    fn raw_fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    /// Grows the file to at least `offset + size` bytes, rounded up to the
    /// next page boundary so existing mappings are never invalidated.
    fn extend(&self, offset: u64, size: u64) -> Result<(), StatsError> {
        let total = round_up(offset + size, page_mask());
        let grow_by = total - offset;
        let rc = unsafe {
            libc::posix_fallocate(self.raw_fd(), offset as libc::off_t, grow_by as libc::off_t)
        };
        if rc != 0 {
            return Err(StatsError::Mmap(std::io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }

    /// Maps exactly one slot (or the header region, when `len` covers it)
    /// starting at `offset`, flagged so the mapping is not inherited by a
    /// forked child (`MADV_DONTFORK`).
    fn map_at(&self, offset: u64, len: usize) -> Result<MmapMut, StatsError> {
        let page_offset = offset & page_mask();
        let map_len = page_offset as usize + len;
        let map_start = offset & !page_mask();
        let mut mmap = unsafe {
            MmapOptions::new()
                .offset(map_start)
                .len(map_len)
                .map_mut(&self.file)
                .map_err(StatsError::Mmap)?
        };
        let rc =
            unsafe { libc::madvise(mmap.as_mut_ptr() as *mut _, map_len, libc::MADV_DONTFORK) };
        if rc != 0 {
            return Err(StatsError::Sys(std::io::Error::last_os_error()));
        }
        Ok(mmap)
    }

    /// Maps a single slot of `slot_size` bytes at `offset` (relative to
    /// the start of the file), returning the mapping positioned so its
    /// first byte is the slot's first byte.
    pub(crate) fn map_slot(&self, offset: u64, slot_size: u32) -> Result<MappedSlot, StatsError> {
        let page_offset = (offset & page_mask()) as usize;
        let mmap = self.map_at(offset, slot_size as usize)?;
        Ok(MappedSlot {
            mmap,
            slot_start: page_offset,
            slot_size: slot_size as usize,
        })
    }

    /// Publishes geometry exactly once per process: computes `value_count`
    /// and `slot_size` from every registered module, writes the header and
    /// name table, then releases `value_count` to readers. Callers that
    /// lose the publication race simply wait for the winner to finish.
    pub(crate) fn publish_geometry(&self) -> Result<(), StatsError> {
        let counters = self.counters();
        if counters.file_size.load(Ordering::Acquire) != 0 {
            self.wait_until_ready();
            return Ok(());
        }

        let modules = MODULE_REGISTRY.lock().expect("module registry poisoned");
        let mut value_count: u64 = 0;
        let mut names_size: u64 = 0;
        for module in modules.iter() {
            value_count += module.value_count() as u64;
            names_size += module.names_blob_len() as u64;
        }

        let header_size = round_up(
            HEADER_SIZE as u64 + 4 * value_count + names_size,
            cache_line_mask(),
        );
        let slot_size = round_up(
            crate::slot::SLOT_HEADER_SIZE as u64 + 8 * value_count,
            cache_line_mask(),
        );

        let zero: u64 = 0;
        if counters
            .file_size
            .compare_exchange(zero, header_size, Ordering::Release, Ordering::Acquire)
            .is_err()
        {
            // Another thread won the race and is publishing concurrently;
            // wait for it rather than reading a half-written header.
            self.wait_until_ready();
            return Ok(());
        }
        counters.slot_size.store(slot_size as u32, Ordering::Relaxed);
        drop(modules);

        self.extend(0, header_size)?;
        let mut header_map = self.map_at(0, header_size as usize)?;

        {
            let bytes = &mut header_map[..];
            bytes[4..8].copy_from_slice(&(slot_size as u32).to_le_bytes());
            bytes[8..12]
                .copy_from_slice(&((header_size as usize - HEADER_SIZE) as u32).to_le_bytes());

            let modules = MODULE_REGISTRY.lock().expect("module registry poisoned");
            let data_base = HEADER_SIZE;
            let name_refs_bytes = 4 * value_count as usize;
            let mut name_string_cursor = name_refs_bytes;
            let mut name_ref_cursor = data_base;
            let mut name_blob = Vec::with_capacity(names_size as usize);

            for module in modules.iter() {
                for name in module.names_snapshot() {
                    let off = name_string_cursor as u32;
                    bytes[name_ref_cursor..name_ref_cursor + 4].copy_from_slice(&off.to_le_bytes());
                    name_ref_cursor += 4;
                    name_blob.extend_from_slice(name.as_bytes());
                    name_blob.push(0);
                    name_string_cursor += name.len() + 1;
                }
            }
            bytes[data_base + name_refs_bytes..data_base + name_refs_bytes + name_blob.len()]
                .copy_from_slice(&name_blob);
        }

        // Synchronizes with the acquire load in the reader.
        header_map[0..4].copy_from_slice(&(value_count as u32).to_le_bytes());
        header_map.flush().map_err(StatsError::Mmap)?;

        // Everything above, including every module's base index, is now
        // visible to any thread that observes this flag.
        counters.ready.store(true, Ordering::Release);

        Ok(())
    }

    /// Spins until a concurrent (or earlier) `publish_geometry` call has
    /// finished writing the header and name table. Cheap: `ready` lives in
    /// the anonymous coordination mapping, not the file itself, so this
    /// never re-maps or touches disk.
    fn wait_until_ready(&self) {
        let counters = self.counters();
        while !counters.ready.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    /// The published slot size, in bytes. Blocks until geometry has been
    /// published (by this call or a concurrent one).
    pub(crate) fn slot_size(&self) -> u32 {
        self.wait_until_ready();
        self.counters().slot_size.load(Ordering::Relaxed)
    }

    /// Pops a slot from the free list, or appends a fresh one if the list
    /// is empty. Returns the slot's byte offset and its mapping.
    pub(crate) fn alloc_slot(&self, slot_size: u32) -> Result<(u64, MappedSlot), StatsError> {
        let counters = self.counters();
        let mut offset = counters.head_free_offset.load(Ordering::Acquire);
        let mut candidate: Option<MappedSlot> = None;

        while offset != 0 {
            let mapped = self.map_slot(offset as u64, slot_size)?;
            let next_free = mapped.next_free_offset();
            match counters.head_free_offset.compare_exchange_weak(
                offset,
                next_free,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let mut mapped = mapped;
                    mapped.zero_values();
                    return Ok((offset as u64, mapped));
                }
                Err(observed) => {
                    offset = observed;
                    candidate = Some(mapped);
                }
            }
        }
        drop(candidate);

        let offset = counters
            .file_size
            .fetch_add(slot_size as u64, Ordering::Relaxed);
        self.extend(offset, slot_size as u64)?;
        let mapped = self.map_slot(offset, slot_size)?;
        Ok((offset, mapped))
    }

    /// Pushes a vacated slot back onto the free list (LIFO).
    pub(crate) fn free_slot(&self, offset: u64, mut mapped: MappedSlot) {
        let counters = self.counters();
        let mut head = counters.head_free_offset.load(Ordering::Relaxed);
        loop {
            mapped.set_next_free_offset(head);
            match counters.head_free_offset.compare_exchange_weak(
                head,
                offset as i64,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// A single mapped thread slot (or, during geometry publication, the
/// header region - both are plain byte windows over the file).
pub(crate) struct MappedSlot {
    mmap: MmapMut,
    slot_start: usize,
    slot_size: usize,
}

impl std::ops::Deref for MappedSlot {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.mmap[self.slot_start..self.slot_start + self.slot_size]
    }
}

impl std::ops::DerefMut for MappedSlot {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[self.slot_start..self.slot_start + self.slot_size]
    }
}

impl MappedSlot {
    fn first_word_ptr(&self) -> *const i64 {
        self.mmap[self.slot_start..].as_ptr() as *const i64
    }

    fn first_word_mut_ptr(&mut self) -> *mut i64 {
        self.mmap[self.slot_start..].as_mut_ptr() as *mut i64
    }

    pub(crate) fn next_free_offset(&self) -> i64 {
        unsafe { *self.first_word_ptr() }
    }

    fn set_next_free_offset(&mut self, value: i64) {
        unsafe { *self.first_word_mut_ptr() = value };
    }

    /// Publishes this slot as active for `tid`, with release ordering so
    /// the reader's acquire load at snapshot start observes everything
    /// written to `values` beforehand (there is none yet, but this also
    /// matches the spec's ordering requirement verbatim).
    pub(crate) fn publish_active(&mut self, tid: i64) {
        let ptr = self.first_word_mut_ptr();
        unsafe {
            (*(ptr as *const AtomicI64)).store(-tid, Ordering::Release);
        }
    }

    fn zero_values(&mut self) {
        let values = &mut self[crate::slot::SLOT_HEADER_SIZE..];
        values.fill(0);
    }

    /// Pointer to the first `i64` of this slot's value array.
    pub(crate) fn values_base_mut(&mut self) -> *mut i64 {
        unsafe { self.first_word_mut_ptr().add(1) }
    }
}
