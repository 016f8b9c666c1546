//! Component D (library half): opening a stats file read-only and walking
//! its slots with the seqlock-style handshake.
//!
//! The `reader` binary is a thin formatting layer over [`snapshot`]; this
//! module holds everything that doesn't depend on argument parsing or
//! output formatting, so other processes can embed the same walk.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use memmap2::Mmap;

use crate::error::ReaderError;
use crate::file::HEADER_SIZE;
use crate::slot::SLOT_HEADER_SIZE;

/// One counter's value, as observed in one consistent snapshot of one
/// thread's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterReading {
    pub name: String,
    pub value: i64,
}

/// Every counter reading for one thread, from a single consistent
/// snapshot of that thread's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThreadDump {
    pub tid: i64,
    pub counters: Vec<CounterReading>,
}

/// A validated, mapped stats file, ready to be walked any number of
/// times (each [`OpenStatsFile::snapshot`] call re-walks live state).
pub struct OpenStatsFile {
    mmap: Option<Mmap>,
    value_count: u32,
    slot_size: u32,
    slots_start: usize,
    names: Vec<String>,
}

/// Opens `path` read-only and validates its header, without taking any
/// lock (readers never contend with the writer - see the spec's locking
/// section). A zero-length file is valid and yields an empty snapshot.
pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<OpenStatsFile, ReaderError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ReaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let metadata = file.metadata().map_err(|source| ReaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if !metadata.is_file() {
        return Err(ReaderError::NotRegularFile(path.to_path_buf()));
    }

    if metadata.len() == 0 {
        return Ok(OpenStatsFile {
            mmap: None,
            value_count: 0,
            slot_size: 0,
            slots_start: 0,
            names: Vec::new(),
        });
    }

    if metadata.len() < HEADER_SIZE as u64 {
        return Err(ReaderError::InvalidFormat(path.to_path_buf()));
    }

    // SAFETY: the file is not truncated for the lifetime of this mapping
    // (the writer only ever extends it); a concurrent extend is fine,
    // readers only ever look at bytes within the length observed here.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|source| ReaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let data = &mmap[..];
    let value_count = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let slot_size = u32::from_le_bytes(data[4..8].try_into().unwrap());
    let slot_offset = u32::from_le_bytes(data[8..12].try_into().unwrap());

    let data_base = HEADER_SIZE;
    let name_refs_bytes = 4usize
        .checked_mul(value_count as usize)
        .ok_or_else(|| ReaderError::InvalidFormat(path.to_path_buf()))?;
    if data.len() < data_base + name_refs_bytes {
        return Err(ReaderError::InvalidFormat(path.to_path_buf()));
    }

    let mut names = Vec::with_capacity(value_count as usize);
    for i in 0..value_count as usize {
        let ref_off = data_base + 4 * i;
        let name_off = u32::from_le_bytes(data[ref_off..ref_off + 4].try_into().unwrap()) as usize;
        let start = data_base
            .checked_add(name_off)
            .ok_or_else(|| ReaderError::InvalidFormat(path.to_path_buf()))?;
        names.push(read_cstr(data, start, path)?);
    }

    let slots_start = data_base
        .checked_add(slot_offset as usize)
        .ok_or_else(|| ReaderError::InvalidFormat(path.to_path_buf()))?;
    if data.len() < slots_start {
        return Err(ReaderError::InvalidFormat(path.to_path_buf()));
    }
    let slots_span = data.len() - slots_start;
    if slot_size == 0 {
        if slots_span != 0 {
            return Err(ReaderError::InvalidFormat(path.to_path_buf()));
        }
    } else if slots_span % slot_size as usize != 0 {
        return Err(ReaderError::InvalidFormat(path.to_path_buf()));
    }

    Ok(OpenStatsFile {
        mmap: Some(mmap),
        value_count,
        slot_size,
        slots_start,
        names,
    })
}

fn read_cstr(data: &[u8], start: usize, path: &Path) -> Result<String, ReaderError> {
    let rest = data
        .get(start..)
        .ok_or_else(|| ReaderError::InvalidFormat(path.to_path_buf()))?;
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ReaderError::InvalidFormat(path.to_path_buf()))?;
    std::str::from_utf8(&rest[..len])
        .map(str::to_owned)
        .map_err(|_| ReaderError::InvalidFormat(path.to_path_buf()))
}

impl OpenStatsFile {
    /// Walks every slot, returning one [`ThreadDump`] per currently
    /// active thread. Order across threads is unspecified; within each
    /// thread, counters are in file (counter-ordinal) order.
    pub fn snapshot(&self) -> Vec<ThreadDump> {
        let Some(mmap) = &self.mmap else {
            return Vec::new();
        };
        let data = &mmap[..];
        let mut dumps = Vec::new();
        let mut offset = self.slots_start;
        while offset < data.len() {
            if let Some(dump) = read_slot(data, offset, self.value_count as usize, &self.names) {
                dumps.push(dump);
            }
            offset += self.slot_size as usize;
        }
        dumps
    }
}

/// Runs the seqlock-style handshake for one slot: read the tid word,
/// copy the values, re-read the tid word, and discard the sample if the
/// two reads disagree (the slot was recycled mid-copy).
fn read_slot(data: &[u8], slot_off: usize, value_count: usize, names: &[String]) -> Option<ThreadDump> {
    // SAFETY: `slot_off` is within `data` and naturally aligned for an
    // `i64` (slots are cache-line aligned, a multiple of 8).
    let word = || unsafe { &*(data[slot_off..].as_ptr() as *const AtomicI64) };

    loop {
        let word0 = word().load(Ordering::Acquire);
        if word0 >= 0 {
            return None; // free slot
        }
        let tid0 = -word0;

        let values_start = slot_off + SLOT_HEADER_SIZE;
        let mut values = Vec::with_capacity(value_count);
        for i in 0..value_count {
            let off = values_start + i * 8;
            values.push(i64::from_le_bytes(data[off..off + 8].try_into().unwrap()));
        }

        // Step 3 of the seqlock handshake: an `Acquire` load only orders
        // what comes *after* it, so without this fence the compiler is
        // free to sink the non-atomic value loads above past the re-read
        // below, defeating torn-read detection entirely.
        std::sync::atomic::fence(Ordering::Acquire);
        let word1 = word().load(Ordering::Acquire);
        if word1 >= 0 {
            return None; // freed during the copy
        }
        let tid1 = -word1;
        if tid1 == tid0 {
            let counters = values
                .into_iter()
                .zip(names.iter())
                .map(|(value, name)| CounterReading {
                    name: name.clone(),
                    value,
                })
                .collect();
            return Some(ThreadDump { tid: tid0, counters });
        }
        // Slot was recycled mid-copy (possibly by a different thread);
        // retry against the new occupant.
    }
}

/// Opens `path` and returns one consistent snapshot. Convenience wrapper
/// over [`open_readonly`] for callers that only need a single pass.
pub fn snapshot<P: AsRef<Path>>(path: P) -> Result<Vec<ThreadDump>, ReaderError> {
    Ok(open_readonly(path)?.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_file_yields_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();
        let dumps = snapshot(&path).unwrap();
        assert!(dumps.is_empty());
    }

    #[test]
    fn short_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        std::fs::write(&path, [0u8; 4]).unwrap();
        assert!(matches!(
            snapshot(&path),
            Err(ReaderError::InvalidFormat(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dumps = snapshot("/nonexistent/path/for/slotstat/tests");
        assert!(matches!(dumps, Err(ReaderError::Io { .. })));
    }
}
