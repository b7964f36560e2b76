/// Shared memory region management using mmap.
///
/// Creates or opens a single named memory-mapped file holding the entire
/// segment: service zone (metadata + robust mutex), header table, block
/// bitmap, and data arena, laid out contiguously so any attaching process
/// can compute every zone's address from `key_count`/`data_count`/
/// `block_size` alone.
use std::fs;
use std::io;
use std::path::PathBuf;

use memmap2::MmapMut;

use super::layout::{self, ServiceMeta, MAGIC, SERVICE_META_SIZE, VERSION};
use super::lock::ShmMutex;
use crate::error::ShmError;

/// Where to store the mmap-backed segment file.
fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir().join("shm_hashtable")
    }
}

/// The full shared-memory region: owns the mmap handle and exposes raw
/// zone accessors. All four zones live in one file, one mapping.
pub struct ShmRegion {
    mmap: MmapMut,
    path: PathBuf,
    layout: layout::ShmLayout,
}

impl ShmRegion {
    /// Create a brand new segment, zeroing and initializing every zone.
    pub fn create(
        name: &str,
        key_count: u32,
        data_count: u32,
        block_size: u32,
    ) -> Result<Self, ShmError> {
        let layout = layout::ShmLayout::new(key_count, data_count, block_size);

        let dir = shm_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(ShmError::Io)?;
        }
        let path = dir.join(format!("{name}.smht"));

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                log::error!("failed to open/create segment file {path:?}: {e}");
                ShmError::Io(e)
            })?;
        file.set_len(layout.memory_size as u64)
            .map_err(ShmError::Io)?;

        let mut mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| {
                log::error!("failed to mmap segment {path:?}: {e}");
                ShmError::Io(e)
            })?
        };
        mmap.fill(0);

        let meta = unsafe { &mut *(mmap.as_mut_ptr() as *mut ServiceMeta) };
        meta.magic = MAGIC;
        meta.version = VERSION;
        meta.key_count = key_count;
        meta.data_count = data_count;
        meta.block_size = block_size;
        meta._pad = 0;

        unsafe {
            let mutex_ptr = mmap.as_mut_ptr().add(SERVICE_META_SIZE);
            ShmMutex::init(mutex_ptr).map_err(|e| {
                log::error!("failed to initialize process-shared robust mutex for {path:?}: {e}");
                ShmError::Io(e)
            })?;
        }

        mmap.flush().map_err(ShmError::Io)?;

        Ok(ShmRegion { mmap, path, layout })
    }

    /// Attach to an existing segment, validating its metadata.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let dir = shm_dir();
        let path = dir.join(format!("{name}.smht"));

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                log::error!("failed to open existing segment file {path:?}: {e}");
                ShmError::Io(e)
            })?;

        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| {
                log::error!("failed to mmap existing segment {path:?}: {e}");
                ShmError::Io(e)
            })?
        };

        if mmap.len() < SERVICE_META_SIZE {
            let reason = format!("segment {name} is smaller than the service zone");
            log::error!("{reason}");
            return Err(ShmError::CorruptSegment { reason });
        }

        let meta = unsafe { &*(mmap.as_ptr() as *const ServiceMeta) };
        if meta.magic != MAGIC {
            let reason = format!("segment {name} has bad magic {:#x}", meta.magic);
            log::error!("{reason}");
            return Err(ShmError::CorruptSegment { reason });
        }
        if meta.version != VERSION {
            let reason = format!(
                "segment {name} has unsupported version {} (expected {VERSION})",
                meta.version
            );
            log::error!("{reason}");
            return Err(ShmError::CorruptSegment { reason });
        }

        let layout = layout::ShmLayout::new(meta.key_count, meta.data_count, meta.block_size);
        if mmap.len() != layout.memory_size {
            log::error!(
                "segment {name} has size {} but its metadata implies {}",
                mmap.len(),
                layout.memory_size
            );
            return Err(ShmError::CorruptSegment {
                reason: format!(
                    "segment {name} has size {} but its metadata implies {}",
                    mmap.len(),
                    layout.memory_size
                ),
            });
        }

        Ok(ShmRegion { mmap, path, layout })
    }

    /// Open an existing segment matching `(key_count, data_count,
    /// block_size)` if one exists; otherwise create it.
    ///
    /// A mismatch between the requested dimensions and an existing
    /// segment's metadata is surfaced as `ShmError::InvalidConfig` rather
    /// than silently recreating the file — recreating would discard
    /// whatever another process has already stored in it.
    pub fn create_or_open(
        name: &str,
        key_count: u32,
        data_count: u32,
        block_size: u32,
    ) -> Result<Self, ShmError> {
        if key_count == 0 || data_count == 0 || block_size < 16 {
            return Err(ShmError::InvalidConfig {
                reason: format!(
                    "key_count ({key_count}) and data_count ({data_count}) must be nonzero, \
                     block_size ({block_size}) must be at least 16"
                ),
            });
        }

        let dir = shm_dir();
        let path = dir.join(format!("{name}.smht"));

        if path.exists() {
            let region = Self::open(name)?;
            if region.layout.key_count != key_count
                || region.layout.data_count != data_count
                || region.layout.block_size != block_size
            {
                return Err(ShmError::InvalidConfig {
                    reason: format!(
                        "segment {name} already exists with key_count={}, data_count={}, \
                         block_size={}, which does not match the requested dimensions",
                        region.layout.key_count, region.layout.data_count, region.layout.block_size
                    ),
                });
            }
            return Ok(region);
        }

        Self::create(name, key_count, data_count, block_size)
    }

    pub fn layout(&self) -> &layout::ShmLayout {
        &self.layout
    }

    pub fn name(&self) -> &str {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
    }

    pub fn base_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn base_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    pub fn header_base(&self) -> *mut u8 {
        unsafe { (self.mmap.as_ptr() as *mut u8).add(self.layout.header_offset) }
    }

    pub fn bitmap_base(&self) -> *mut u8 {
        unsafe { (self.mmap.as_ptr() as *mut u8).add(self.layout.bitmap_offset) }
    }

    pub fn data_base(&self) -> *mut u8 {
        unsafe { (self.mmap.as_ptr() as *mut u8).add(self.layout.data_offset) }
    }

    /// Attach to the segment's process-shared robust mutex.
    ///
    /// # Safety
    /// The mutex must have been initialized by a prior `create` on this
    /// same segment, which is guaranteed by construction: every path that
    /// produces an `ShmRegion` goes through `create` or `open` against an
    /// already-created file.
    pub fn mutex(&self) -> ShmMutex {
        unsafe { ShmMutex::from_existing(self.mmap.as_ptr().add(SERVICE_META_SIZE) as *mut u8) }
    }

    /// Remove the backing file. Does not affect processes that already
    /// have it mapped.
    pub fn unlink(name: &str) -> io::Result<()> {
        let path = shm_dir().join(format!("{name}.smht"));
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ShmRegion is Send+Sync because all cross-process mutation is guarded by
// the robust mutex inside the mapping itself.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}
