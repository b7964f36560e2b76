/// `#[repr(C)]` structures that live in shared memory (mmap), and the
/// arithmetic that carves the segment into its four zones:
///
/// ```text
/// [ service ][ header table ][ block bitmap ][ data arena ]
/// ```
use super::lock::MUTEX_SIZE;

/// Validates a previously-created segment is ours, not stale garbage.
pub const MAGIC: u32 = 0x534D_4854; // b"SMHT" as a little-endian u32
pub const VERSION: u32 = 1;

/// Fixed metadata written once at segment creation, ahead of the
/// process-shared mutex, so any attacher can validate the mapping and
/// recover `key_count`/`data_count`/`block_size` without being told them
/// out of band.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ServiceMeta {
    pub magic: u32,
    pub version: u32,
    pub key_count: u32,
    pub data_count: u32,
    pub block_size: u32,
    pub _pad: u32,
}

pub const SERVICE_META_SIZE: usize = std::mem::size_of::<ServiceMeta>();
const _: () = assert!(SERVICE_META_SIZE == 24);

/// Total size of the service zone: metadata prefix + the robust mutex.
pub fn service_size() -> usize {
    SERVICE_META_SIZE + MUTEX_SIZE
}

/// Sentinel meaning "no next" in `linked_item`, and (combined with a zero
/// `val_offset`) "empty" in a header slot.
pub const OFFSET_NONE: u32 = 0;

/// Fixed-size header record: lives both in the index table (one per bucket)
/// and, for collision chains, embedded in the data arena. All fields are
/// 4-byte offsets/sizes so the struct is naturally 4-byte aligned with no
/// padding.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HeaderSlot {
    /// Offset, from the data-arena base, of the stored key (NUL-terminated).
    pub key_offset: u32,
    /// Key length including the trailing NUL.
    pub key_size: u32,
    /// Offset, from the data-arena base, of the stored value (NUL-terminated).
    pub val_offset: u32,
    /// Value length including the trailing NUL.
    pub val_size: u32,
    /// Offset, from the data-arena base, of the next chain-node header, or
    /// `OFFSET_NONE` for end-of-chain.
    pub linked_item: u32,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<HeaderSlot>();
const _: () = assert!(HEADER_SIZE == 20);

impl HeaderSlot {
    pub const EMPTY: HeaderSlot = HeaderSlot {
        key_offset: 0,
        key_size: 0,
        val_offset: 0,
        val_size: 0,
        linked_item: 0,
    };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.val_offset == 0
    }
}

/// Every arena block (whether it holds a payload or a chain-node header)
/// opens with an 8-byte tag word, read unaligned, that the compactor uses
/// to tell the two kinds apart without consulting anything outside the
/// block itself:
///
/// - bit 63 (`PAYLOAD_TAG`): set for a payload block, clear for a
///   chain-node-header block.
/// - bit 32 (`OWNER_IN_ARENA_TAG`, meaningful only when bit 63 is set):
///   set if the payload's owning header record is a chain-node header
///   living in the data arena (offset in bits 0..32 is arena-relative),
///   clear if the owner is a table head (offset in bits 0..32 is
///   header-table-relative).
///
/// Chain-node-header blocks carry no information in their tag word beyond
/// "not a payload" — the compactor locates a chain node's predecessor by
/// rehashing its key and walking the bucket chain, not through a stored
/// backpointer.
pub const PAYLOAD_TAG: u64 = 1u64 << 63;
pub const OWNER_IN_ARENA_TAG: u64 = 1u64 << 32;
pub const CHAIN_NODE_TAG: u64 = 0;

/// Where a header record lives: inline in the header table, or as a
/// chain-node-header block in the data arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderLocation {
    /// Byte offset from the header-table base.
    Head(u32),
    /// Byte offset from the data-arena base.
    ChainNode(u32),
}

#[inline]
pub fn make_payload_tag(owner: HeaderLocation) -> u64 {
    match owner {
        HeaderLocation::Head(off) => PAYLOAD_TAG | off as u64,
        HeaderLocation::ChainNode(off) => PAYLOAD_TAG | OWNER_IN_ARENA_TAG | off as u64,
    }
}

#[inline]
pub fn tag_is_payload(raw: u64) -> bool {
    raw & PAYLOAD_TAG != 0
}

#[inline]
pub fn payload_owner(raw: u64) -> HeaderLocation {
    let off = (raw & 0xFFFF_FFFF) as u32;
    if raw & OWNER_IN_ARENA_TAG != 0 {
        HeaderLocation::ChainNode(off)
    } else {
        HeaderLocation::Head(off)
    }
}

/// Size in bytes of a chain-node-header block's content: the 8-byte tag
/// word followed by one `HeaderSlot`.
pub const CHAIN_NODE_SIZE: usize = 8 + HEADER_SIZE;

/// `ceil(x / y)`, used throughout the allocator for block-count math.
#[inline]
pub fn ceil_div(x: u32, y: u32) -> u32 {
    (x + y - 1) / y
}

/// Process-local "segment descriptor": every dimension an attaching process
/// needs to address the four zones, cached once at attach time.
#[derive(Clone, Copy, Debug)]
pub struct ShmLayout {
    pub key_count: u32,
    pub data_count: u32,
    pub block_size: u32,

    pub header_size: usize,
    pub header_len: usize,
    pub data_len: usize,
    pub memory_size: usize,

    pub service_offset: usize,
    pub header_offset: usize,
    pub bitmap_offset: usize,
    pub data_offset: usize,
}

impl ShmLayout {
    pub fn new(key_count: u32, data_count: u32, block_size: u32) -> Self {
        let header_size = HEADER_SIZE;
        let header_len = header_size * key_count as usize;
        let data_len = data_count as usize * block_size as usize;
        let service = service_size();
        let memory_size = service + header_len + data_count as usize + data_len;

        ShmLayout {
            key_count,
            data_count,
            block_size,
            header_size,
            header_len,
            data_len,
            memory_size,
            service_offset: 0,
            header_offset: service,
            bitmap_offset: service + header_len,
            data_offset: service + header_len + data_count as usize,
        }
    }

    /// Number of blocks needed to hold one chain-node-header record (tag
    /// word + `HeaderSlot`).
    #[inline]
    pub fn header_blocks(&self) -> u32 {
        ceil_div(CHAIN_NODE_SIZE as u32, self.block_size)
    }

    /// Number of blocks needed to hold a payload of `key_size + val_size`
    /// bytes plus the 8-byte backpointer prefix.
    #[inline]
    pub fn payload_blocks(&self, key_size: u32, val_size: u32) -> u32 {
        ceil_div(8 + key_size + val_size, self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_dims_match_spec_formula() {
        let layout = ShmLayout::new(10_000, 40_000, 8);
        assert_eq!(layout.header_len, HEADER_SIZE * 10_000);
        assert_eq!(layout.data_len, 40_000 * 8);
        assert_eq!(
            layout.memory_size,
            service_size() + layout.header_len + 40_000 + layout.data_len
        );
    }

    #[test]
    fn zones_are_disjoint_and_ordered() {
        let layout = ShmLayout::new(100, 400, 16);
        assert!(layout.header_offset >= layout.service_offset + service_size());
        assert!(layout.bitmap_offset >= layout.header_offset + layout.header_len);
        assert!(layout.data_offset >= layout.bitmap_offset + layout.data_count as usize);
        assert_eq!(layout.memory_size, layout.data_offset + layout.data_len);
    }

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(7, 8), 1);
        assert_eq!(ceil_div(8, 8), 1);
        assert_eq!(ceil_div(9, 8), 2);
        assert_eq!(ceil_div(16, 8), 2);
    }

    #[test]
    fn payload_tag_roundtrips_head_owner() {
        let tag = make_payload_tag(HeaderLocation::Head(12345));
        assert!(tag_is_payload(tag));
        assert_eq!(payload_owner(tag), HeaderLocation::Head(12345));
    }

    #[test]
    fn payload_tag_roundtrips_chain_node_owner() {
        let tag = make_payload_tag(HeaderLocation::ChainNode(98765));
        assert!(tag_is_payload(tag));
        assert_eq!(payload_owner(tag), HeaderLocation::ChainNode(98765));
    }

    #[test]
    fn chain_node_tag_is_not_payload() {
        assert!(!tag_is_payload(CHAIN_NODE_TAG));
    }
}
