/// Shared-memory hash table backend.
///
/// Provides `ShmHashTable` — a cross-process key/value store backed by a
/// single mmap segment: a bitmap block allocator over a flat data arena,
/// and an open-addressed header table whose buckets chain through header
/// records allocated out of that same arena.
pub mod bitmap;
pub mod defrag;
pub mod hashtable;
pub mod layout;
pub mod lock;
pub mod region;

use crate::error::ShmError;
use bitmap::MemInfo;
use region::ShmRegion;

/// Default block size used when a config is built without an explicit
/// override, matching §6.1's `block_size = 512` default.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Builder for the parameters of a segment: `name`, `key_count`,
/// `data_count`, and `block_size` (defaulted to `DEFAULT_BLOCK_SIZE`).
///
/// Grouping these into one struct keeps `ShmHashTable::create_or_open`'s
/// four positional arguments from growing further as the builder gains
/// optional knobs, and matches the way the teacher groups cache
/// construction parameters before handing them to `ShmCache::create_or_open`.
#[derive(Clone, Debug)]
pub struct ShmHashTableConfig {
    name: String,
    key_count: u32,
    data_count: u32,
    block_size: u32,
}

impl ShmHashTableConfig {
    /// Starts a config for segment `name` with the default block size and
    /// `key_count`/`data_count` both zero — callers must set both before
    /// calling `open`.
    pub fn new(name: impl Into<String>) -> Self {
        ShmHashTableConfig {
            name: name.into(),
            key_count: 0,
            data_count: 0,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn key_count(mut self, key_count: u32) -> Self {
        self.key_count = key_count;
        self
    }

    pub fn data_count(mut self, data_count: u32) -> Self {
        self.data_count = data_count;
        self
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Opens or creates the segment described by this config.
    pub fn open(&self) -> Result<ShmHashTable, ShmError> {
        ShmHashTable::create_or_open(&self.name, self.key_count, self.data_count, self.block_size)
    }
}

/// The main shared-memory hash table handle.
///
/// One instance per attaching process; multiple processes opening the same
/// named segment each get an independent `ShmHashTable` pointing at the
/// same mapping.
pub struct ShmHashTable {
    region: ShmRegion,
}

impl ShmHashTable {
    /// Opens a segment named `name` if one already exists with matching
    /// dimensions, otherwise creates it.
    pub fn create_or_open(
        name: &str,
        key_count: u32,
        data_count: u32,
        block_size: u32,
    ) -> Result<Self, ShmError> {
        let region = ShmRegion::create_or_open(name, key_count, data_count, block_size)?;
        Ok(ShmHashTable { region })
    }

    /// Inserts or replaces the value for `key`. Returns `false` only when
    /// the arena has no room left for the new entry.
    pub fn set(&self, key: &[u8], value: &[u8]) -> bool {
        unsafe { hashtable::set(&self.region, key, value) }
    }

    /// Looks up `key`, returning a copy of the stored value on a hit.
    pub fn get_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        unsafe { hashtable::get(&self.region, key) }
    }

    /// Removes `key`. See [`hashtable::unset`] for the meaning of the
    /// returned code.
    pub fn unset(&self, key: &[u8]) -> i32 {
        unsafe { hashtable::unset(&self.region, key) }
    }

    /// Removes every entry by zeroing the header table, the bitmap, and the
    /// data arena. Equivalent to, but far cheaper than, unsetting every key.
    pub fn clear(&self) {
        let layout = *self.region.layout();
        unsafe {
            std::ptr::write_bytes(self.region.header_base(), 0, layout.header_len);
            std::ptr::write_bytes(self.region.bitmap_base(), 0, layout.data_count as usize);
            std::ptr::write_bytes(self.region.data_base(), 0, layout.data_len);
        }
    }

    /// Runs a full compaction pass, returning the number of blocks moved.
    pub fn hard_defragmentation(&self) -> u32 {
        let moved = unsafe { defrag::hard_defragmentation(&self.region) };
        log::debug!("hard_defragmentation on {}: moved {moved} blocks", self.region.name());
        moved
    }

    /// Snapshot of allocator occupancy. Advisory only — taken without
    /// holding the service mutex, so it can race concurrent mutation.
    pub fn mem_info(&self) -> MemInfo {
        let layout = self.region.layout();
        unsafe {
            let free = bitmap::free_bytes(self.region.bitmap_base(), layout.data_count, layout.block_size);
            let longest_free =
                bitmap::longest_free_block(self.region.bitmap_base(), layout.data_count, layout.block_size);
            let (longest_allocated, segments) = bitmap::longest_allocated_block(
                self.region.bitmap_base(),
                layout.data_count,
                layout.block_size,
            );
            MemInfo {
                free_bytes: free,
                longest_free_block: longest_free,
                longest_allocated_block: longest_allocated,
                segments,
            }
        }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn key_count(&self) -> u32 {
        self.region.layout().key_count
    }

    pub fn data_count(&self) -> u32 {
        self.region.layout().data_count
    }

    pub fn block_size(&self) -> u32 {
        self.region.layout().block_size
    }

    /// Removes the backing file for `name`. Processes that already have it
    /// mapped keep working against their existing mapping.
    pub fn unlink(name: &str) -> std::io::Result<()> {
        ShmRegion::unlink(name)
    }
}

unsafe impl Send for ShmHashTable {}
unsafe impl Sync for ShmHashTable {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn fresh_table(key_count: u32, data_count: u32, block_size: u32) -> ShmHashTable {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!("smht_mod_test_{}_{id}", std::process::id());
        let _ = ShmHashTable::unlink(&name);
        ShmHashTable::create_or_open(&name, key_count, data_count, block_size).unwrap()
    }

    #[test]
    fn crud_round_trip() {
        let table = fresh_table(16, 512, 8);
        assert!(table.set(b"a", b"1"));
        assert!(table.set(b"b", b"2"));
        assert_eq!(table.get_value(b"a"), Some(b"1".to_vec()));
        assert_eq!(table.unset(b"a"), 2);
        assert_eq!(table.get_value(b"a"), None);
        assert_eq!(table.get_value(b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn clear_empties_every_bucket() {
        let table = fresh_table(16, 512, 8);
        for i in 0..10 {
            table.set(format!("k{i}").as_bytes(), b"v");
        }
        table.clear();
        for i in 0..10 {
            assert_eq!(table.get_value(format!("k{i}").as_bytes()), None);
        }
        assert!(table.set(b"fresh", b"value"));
        assert_eq!(table.get_value(b"fresh"), Some(b"value".to_vec()));
    }

    #[test]
    fn mem_info_reflects_free_space() {
        let table = fresh_table(16, 256, 8);
        let before = table.mem_info();
        table.set(b"key", b"value");
        let after = table.mem_info();
        assert!(after.free_bytes < before.free_bytes);
    }

    #[test]
    fn reopen_with_mismatched_dimensions_errors() {
        let name = format!("smht_mod_test_mismatch_{}", std::process::id());
        let _ = ShmHashTable::unlink(&name);
        let _first = ShmHashTable::create_or_open(&name, 16, 512, 8).unwrap();
        let reopened = ShmHashTable::create_or_open(&name, 32, 512, 8);
        assert!(reopened.is_err());
        let _ = ShmHashTable::unlink(&name);
    }

    #[test]
    fn config_builder_opens_a_segment() {
        let name = format!("smht_mod_test_config_{}", std::process::id());
        let _ = ShmHashTable::unlink(&name);
        let table = ShmHashTableConfig::new(name.as_str())
            .key_count(16)
            .data_count(512)
            .block_size(8)
            .open()
            .unwrap();
        assert!(table.set(b"k", b"v"));
        assert_eq!(table.get_value(b"k"), Some(b"v".to_vec()));
        let _ = ShmHashTable::unlink(&name);
    }

    #[test]
    fn config_defaults_block_size() {
        let cfg = ShmHashTableConfig::new("unused").key_count(1).data_count(1);
        assert_eq!(cfg.block_size, DEFAULT_BLOCK_SIZE);
    }
}
