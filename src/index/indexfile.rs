use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use memmap2::MmapMut;
use parking_lot::Mutex;

use super::{IndexError, Result};

/// Size in bytes of the fixed index file header.
pub const HEADER_LEN: usize = 40;
/// Size in bytes of one hash slot.
const SLOT_LEN: usize = 4;
/// Size in bytes of one entry: key_hash(4) + phy_offset(8) + time_delta(4) + prev_index(4).
const ENTRY_LEN: usize = 20;

/// Coerced value used when `nonnegative_hash` encounters `i32::MIN`.
pub const MAX_KEY_HASH_I32_MIN_COERCED: i32 = 0;

const OFF_BEGIN_TS: usize = 0;
const OFF_END_TS: usize = 8;
const OFF_BEGIN_PHY: usize = 16;
const OFF_END_PHY: usize = 24;
const OFF_SLOT_COUNT: usize = 32;
const OFF_INDEX_COUNT: usize = 36;

/// Polynomial string hash (multiplier 31, i32-wrapping), folded into the
/// non-negative range.
///
/// Matches the algorithm described for the on-disk index: a standard
/// multiplier-31 hash, negated if negative, with `i32::MIN` (whose negation
/// still overflows) coerced to zero.
fn nonnegative_hash(key: &str) -> i32 {
    let mut h: i32 = 0;
    for b in key.as_bytes() {
        h = h.wrapping_mul(31).wrapping_add(*b as i32);
    }
    if h < 0 {
        h = h.wrapping_neg();
        if h < 0 {
            h = MAX_KEY_HASH_I32_MIN_COERCED;
        }
    }
    h
}

/// Snapshot of an [`IndexFile`]'s header, useful for rollover and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexFileStats {
    pub begin_timestamp: i64,
    pub end_timestamp: i64,
    pub begin_phy_offset: i64,
    pub end_phy_offset: i64,
    pub hash_slot_count: u32,
    pub index_count: u32,
}

/// A fixed-size memory-mapped index file: header + slot array + entry array.
///
/// Entries within a bucket form a singly-linked, most-recent-first chain.
/// Link values (slot entries and `prev_index`) are 1-based; `0` means "no
/// entry", which lets entries be stored 0-based in the physical array
/// without colliding with the empty sentinel.
#[derive(Debug)]
pub struct IndexFile {
    path: PathBuf,
    mmap: Mutex<MmapMut>,
    max_entries: u32,
}

impl IndexFile {
    /// Create a new index file at `path` sized for `slot_count` hash buckets
    /// and `max_entries` entries.
    pub fn create(path: impl AsRef<Path>, slot_count: u32, max_entries: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let total_len = HEADER_LEN as u64
            + SLOT_LEN as u64 * slot_count as u64
            + ENTRY_LEN as u64 * max_entries as u64;
        let file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(total_len)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        write_i32(&mut mmap, OFF_SLOT_COUNT, slot_count as i32);
        write_i32(&mut mmap, OFF_INDEX_COUNT, 0);
        Ok(Self {
            path,
            mmap: Mutex::new(mmap),
            max_entries,
        })
    }

    /// Open an existing index file, recovering `max_entries` from its
    /// on-disk size (the slot count is read from the header).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN as u64 {
            return Err(IndexError::InvalidFormat(path.display().to_string()));
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let slot_count = read_i32(&mmap, OFF_SLOT_COUNT) as u64;
        let remaining = len - HEADER_LEN as u64 - SLOT_LEN as u64 * slot_count;
        if remaining % ENTRY_LEN as u64 != 0 {
            return Err(IndexError::InvalidFormat(path.display().to_string()));
        }
        let max_entries = (remaining / ENTRY_LEN as u64) as u32;
        Ok(Self {
            path,
            mmap: Mutex::new(mmap),
            max_entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn stats(&self) -> IndexFileStats {
        let mmap = self.mmap.lock();
        IndexFileStats {
            begin_timestamp: read_i64(&mmap, OFF_BEGIN_TS),
            end_timestamp: read_i64(&mmap, OFF_END_TS),
            begin_phy_offset: read_i64(&mmap, OFF_BEGIN_PHY),
            end_phy_offset: read_i64(&mmap, OFF_END_PHY),
            hash_slot_count: read_i32(&mmap, OFF_SLOT_COUNT) as u32,
            index_count: read_i32(&mmap, OFF_INDEX_COUNT) as u32,
        }
    }

    fn slot_offset(slot_count: u32, bucket: u32) -> usize {
        debug_assert!(bucket < slot_count);
        HEADER_LEN + SLOT_LEN * bucket as usize
    }

    fn entry_offset(slot_count: u32, physical_index: u32) -> usize {
        HEADER_LEN + SLOT_LEN * slot_count as usize + ENTRY_LEN * physical_index as usize
    }

    /// Insert `key` -> `phy_offset`, recording `store_timestamp` (ms).
    ///
    /// Returns `Ok(false)` without mutating anything if the file is full;
    /// that is not an error, it signals the caller to roll over.
    pub fn put_key(&self, key: &str, phy_offset: i64, store_timestamp: i64) -> Result<bool> {
        let mut mmap = self.mmap.lock();
        let index_count = read_i32(&mmap, OFF_INDEX_COUNT) as u32;
        if index_count >= self.max_entries {
            return Ok(false);
        }

        let slot_count = read_i32(&mmap, OFF_SLOT_COUNT) as u32;
        let h = nonnegative_hash(key);
        let bucket = (h as u32) % slot_count;

        let slot_off = Self::slot_offset(slot_count, bucket);
        let prev_link = read_i32(&mmap, slot_off) as u32;

        let mut begin_ts = read_i64(&mmap, OFF_BEGIN_TS);
        let first_put = begin_ts == 0 && read_i64(&mmap, OFF_END_TS) == 0;
        if first_put {
            begin_ts = store_timestamp;
            write_i64(&mut mmap, OFF_BEGIN_TS, begin_ts);
            write_i64(&mut mmap, OFF_BEGIN_PHY, phy_offset);
        }

        let raw_delta = store_timestamp - begin_ts;
        let time_delta = if first_put {
            0
        } else if let Ok(d) = i32::try_from(raw_delta) {
            d
        } else {
            warn!(
                "time_delta out of i32 range for key {key:?} (store_timestamp={store_timestamp}, \
                 begin_timestamp={begin_ts}); clamping to 0"
            );
            0
        };

        let entry_off = Self::entry_offset(slot_count, index_count);
        write_i32(&mut mmap, entry_off, h);
        write_i64(&mut mmap, entry_off + 4, phy_offset);
        write_i32(&mut mmap, entry_off + 12, time_delta);
        write_i32(&mut mmap, entry_off + 16, prev_link as i32);

        write_i32(&mut mmap, slot_off, (index_count + 1) as i32);
        write_i64(&mut mmap, OFF_END_PHY, phy_offset);
        write_i64(&mut mmap, OFF_END_TS, store_timestamp);
        write_i32(&mut mmap, OFF_INDEX_COUNT, (index_count + 1) as i32);

        Ok(true)
    }

    /// Append up to `max_count` physical offsets for `key` whose reconstructed
    /// timestamp falls in `[t_begin, t_end]`, newest-first.
    ///
    /// `is_last_file` is advisory only; callers use it to decide whether
    /// lock promotion is needed around a concurrent flush, it does not
    /// affect the result.
    pub fn select_phy_offset(
        &self,
        out: &mut Vec<i64>,
        key: &str,
        max_count: usize,
        t_begin: i64,
        t_end: i64,
        _is_last_file: bool,
    ) {
        let mmap = self.mmap.lock();
        let slot_count = read_i32(&mmap, OFF_SLOT_COUNT) as u32;
        let begin_ts = read_i64(&mmap, OFF_BEGIN_TS);
        let h = nonnegative_hash(key);
        let bucket = (h as u32) % slot_count;

        let mut link = read_i32(&mmap, Self::slot_offset(slot_count, bucket)) as u32;
        while link != 0 && out.len() < max_count {
            let physical_index = link - 1;
            let entry_off = Self::entry_offset(slot_count, physical_index);
            let entry_hash = read_i32(&mmap, entry_off);
            let entry_phy = read_i64(&mmap, entry_off + 4);
            let entry_delta = read_i32(&mmap, entry_off + 12);
            let prev_link = read_i32(&mmap, entry_off + 16) as u32;

            if entry_hash == h {
                let ts = begin_ts + entry_delta as i64;
                if ts >= t_begin && ts <= t_end {
                    out.push(entry_phy);
                }
            }
            link = prev_link;
        }
    }

    /// True iff `[begin_timestamp, end_timestamp]` overlaps `[t_begin, t_end]`
    /// and this file has seen at least one put (both timestamps non-zero).
    pub fn is_time_matched(&self, t_begin: i64, t_end: i64) -> bool {
        let mmap = self.mmap.lock();
        let begin_ts = read_i64(&mmap, OFF_BEGIN_TS);
        let end_ts = read_i64(&mmap, OFF_END_TS);
        if begin_ts == 0 && end_ts == 0 {
            return false;
        }
        begin_ts <= t_end && end_ts >= t_begin
    }

    pub fn begin_timestamp(&self) -> i64 {
        read_i64(&self.mmap.lock(), OFF_BEGIN_TS)
    }

    /// Pre-set `begin_phy_offset`/`begin_timestamp` (and the matching
    /// `end_*` fields) on a freshly created, still-empty file.
    ///
    /// Used by rollover to carry continuity across files: the new tail's
    /// `begin_phy_offset` must equal the previous tail's `end_phy_offset`,
    /// not the offset of whatever message happens to be indexed into it
    /// first. Must be called before any [`Self::put_key`].
    pub fn seed_begin(&self, begin_phy_offset: i64, begin_timestamp: i64) {
        let mut mmap = self.mmap.lock();
        debug_assert_eq!(read_i32(&mmap, OFF_INDEX_COUNT), 0);
        write_i64(&mut mmap, OFF_BEGIN_TS, begin_timestamp);
        write_i64(&mut mmap, OFF_END_TS, begin_timestamp);
        write_i64(&mut mmap, OFF_BEGIN_PHY, begin_phy_offset);
        write_i64(&mut mmap, OFF_END_PHY, begin_phy_offset);
    }

    pub fn end_phy_offset(&self) -> i64 {
        read_i64(&self.mmap.lock(), OFF_END_PHY)
    }

    /// Flush the mapped region to disk.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.lock().flush()
    }

    /// Attempt to acquire exclusive access within `timeout` and delete the
    /// file. Returns `true` iff the file was deleted.
    pub fn destroy(&self, timeout: Duration) -> bool {
        match self.mmap.try_lock_for(timeout) {
            Some(mmap) => {
                if let Err(e) = mmap.flush() {
                    warn!(
                        "flush before destroy of {} failed: {e}",
                        self.path.display()
                    );
                }
                drop(mmap);
                match fs::remove_file(&self.path) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("failed to delete index file {}: {e}", self.path.display());
                        false
                    }
                }
            }
            None => {
                debug!(
                    "could not acquire index file lock for {} within {:?}, skipping destroy",
                    self.path.display(),
                    timeout
                );
                false
            }
        }
    }
}

fn read_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn write_i32(buf: &mut [u8], off: usize, v: i32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn read_i64(buf: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn write_i64(buf: &mut [u8], off: usize, v: i64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_file(dir: &TempDir, name: &str, slots: u32, max: u32) -> IndexFile {
        IndexFile::create(dir.path().join(name), slots, max).unwrap()
    }

    #[test]
    fn insert_and_find() {
        let dir = TempDir::new().unwrap();
        let f = new_file(&dir, "a", 4, 100);

        assert!(f.put_key("A#x", 1000, 5000).unwrap());
        assert!(f.put_key("A#y", 2000, 5100).unwrap());

        let mut out = Vec::new();
        f.select_phy_offset(&mut out, "A#x", 10, 0, i64::MAX, true);
        assert_eq!(out, vec![1000]);

        out.clear();
        f.select_phy_offset(&mut out, "A#y", 10, 0, i64::MAX, true);
        assert_eq!(out, vec![2000]);
    }

    #[test]
    fn time_filter_excludes_out_of_range() {
        let dir = TempDir::new().unwrap();
        let f = new_file(&dir, "a", 4, 100);
        f.put_key("A#x", 1000, 5000).unwrap();
        f.put_key("A#y", 2000, 5100).unwrap();

        let mut out = Vec::new();
        f.select_phy_offset(&mut out, "A#x", 10, 6000, 7000, true);
        assert!(out.is_empty());
    }

    #[test]
    fn fills_to_exactly_max_entries() {
        let dir = TempDir::new().unwrap();
        let f = new_file(&dir, "a", 4, 2);
        assert!(f.put_key("k1", 1, 10).unwrap());
        assert!(f.put_key("k2", 2, 20).unwrap());
        assert!(!f.put_key("k3", 3, 30).unwrap());
        assert_eq!(f.stats().index_count, 2);
    }

    #[test]
    fn hash_collision_both_entries_reachable() {
        let dir = TempDir::new().unwrap();
        // slot_count=1 forces every key into the same bucket.
        let f = new_file(&dir, "a", 1, 10);
        f.put_key("alpha", 111, 1).unwrap();
        f.put_key("beta", 222, 2).unwrap();

        let mut out = Vec::new();
        f.select_phy_offset(&mut out, "alpha", 10, 0, i64::MAX, true);
        assert_eq!(out, vec![111]);

        out.clear();
        f.select_phy_offset(&mut out, "beta", 10, 0, i64::MAX, true);
        assert_eq!(out, vec![222]);
    }

    #[test]
    fn bucket_chain_newest_first() {
        let dir = TempDir::new().unwrap();
        let f = new_file(&dir, "a", 1, 10);
        for i in 0..5 {
            f.put_key("same-key", i, i).unwrap();
        }
        let mut out = Vec::new();
        f.select_phy_offset(&mut out, "same-key", 10, 0, i64::MAX, true);
        assert_eq!(out, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn reload_from_disk_preserves_query_results() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        {
            let f = IndexFile::create(&path, 4, 100).unwrap();
            f.put_key("A#x", 1000, 5000).unwrap();
            f.flush().unwrap();
        }
        let reopened = IndexFile::open(&path).unwrap();
        let mut out = Vec::new();
        reopened.select_phy_offset(&mut out, "A#x", 10, 0, i64::MAX, true);
        assert_eq!(out, vec![1000]);
        assert_eq!(reopened.stats().index_count, 1);
    }

    #[test]
    fn time_delta_clamped_on_clock_skew() {
        let dir = TempDir::new().unwrap();
        let f = new_file(&dir, "a", 4, 10);
        f.put_key("first", 1, 10_000).unwrap();
        // store_timestamp far before begin_timestamp overflows i32 ms delta.
        let skewed = 10_000_i64 - (i64::from(i32::MAX) + 100);
        f.put_key("skewed", 2, skewed).unwrap();

        let mut out = Vec::new();
        // Clamped time_delta of 0 means reconstructed timestamp == begin_timestamp.
        f.select_phy_offset(&mut out, "skewed", 10, 10_000, 10_000, true);
        assert_eq!(out, vec![2]);
    }
}
