//! Cross-process shared-memory hash table.
//!
//! `ShmHashTable` maps byte-string keys to byte-string values in a single
//! mmap segment that several processes can open independently. Lookups and
//! inserts never take a lock beyond the allocator's own scan; periodic
//! [`shm::ShmHashTable::hard_defragmentation`] compacts the arena once
//! deletions have fragmented it.

pub mod error;
pub mod hash;
pub mod shm;

pub use error::ShmError;
pub use shm::bitmap::MemInfo;
pub use shm::{ShmHashTable, ShmHashTableConfig};
