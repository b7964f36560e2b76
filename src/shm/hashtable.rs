/// Bucket-chained hash table operations: `set`, `get`, `unset`.
///
/// The header table holds one `HeaderSlot` per bucket (the "head"). A
/// bucket with more than one entry chains through `HeaderSlot` records
/// allocated out of the data arena itself (`HeaderLocation::ChainNode`),
/// linked via `linked_item`. Only the allocator's scan (`bitmap::find_block`)
/// is synchronized by the service mutex; header mutation is not otherwise
/// locked, matching the concurrency model described alongside `ShmMutex`.
use super::bitmap;
use super::layout::{self, HeaderLocation, HeaderSlot, CHAIN_NODE_TAG, OFFSET_NONE};
use super::region::ShmRegion;

#[inline]
fn bucket_index(key: &[u8], key_count: u32) -> u32 {
    crate::hash::meiyan(key) % key_count
}

unsafe fn header_slot(base: *mut u8, byte_offset: u32) -> *mut HeaderSlot {
    base.add(byte_offset as usize) as *mut HeaderSlot
}

/// Reads or writes the tag word at the start of an arena block, unaligned:
/// block addresses are multiples of `block_size`, which is not guaranteed
/// to be a multiple of 8.
#[inline]
unsafe fn write_tag(addr: *mut u8, tag: u64) {
    std::ptr::write_unaligned(addr as *mut u64, tag);
}

/// Compares a stored, NUL-terminated key against a candidate key.
unsafe fn key_matches(data_base: *const u8, key_offset: u32, key_size: u32, key: &[u8]) -> bool {
    if key_size as usize != key.len() + 1 {
        return false;
    }
    let stored = std::slice::from_raw_parts(data_base.add(key_offset as usize), key.len());
    stored == key
}

unsafe fn read_value(data_base: *const u8, val_offset: u32, val_size: u32) -> Vec<u8> {
    let len = val_size as usize - 1;
    std::slice::from_raw_parts(data_base.add(val_offset as usize), len).to_vec()
}

/// Allocates a payload block (tag + key + NUL + value + NUL) and writes it.
/// Returns `(key_offset, key_size, val_offset, val_size)`, or `None` on
/// allocator exhaustion.
unsafe fn alloc_payload(
    region: &ShmRegion,
    owner: HeaderLocation,
    key: &[u8],
    value: &[u8],
) -> Option<(u32, u32, u32, u32)> {
    let layout = region.layout();
    let key_size = key.len() as u32 + 1;
    let val_size = value.len() as u32 + 1;
    let blocks = layout.payload_blocks(key_size, val_size);

    let mutex = region.mutex();
    mutex.lock();
    let found = bitmap::find_block(region.bitmap_base(), layout.data_count, blocks, 0);
    mutex.unlock();
    let block_index = found?;

    let addr = bitmap::data_addr(region.data_base(), layout.block_size, block_index);
    let arena_offset = block_index * layout.block_size;

    write_tag(addr, layout::make_payload_tag(owner));
    let key_offset = arena_offset + 8;
    std::ptr::copy_nonoverlapping(key.as_ptr(), addr.add(8), key.len());
    *addr.add(8 + key.len()) = 0;
    let val_offset = key_offset + key_size;
    std::ptr::copy_nonoverlapping(value.as_ptr(), addr.add(8 + key_size as usize), value.len());
    *addr.add(8 + key_size as usize + value.len()) = 0;

    Some((key_offset, key_size, val_offset, val_size))
}

unsafe fn free_payload(region: &ShmRegion, key_offset: u32, key_size: u32, val_size: u32) {
    let layout = region.layout();
    let arena_offset = key_offset - 8;
    let blocks = layout.payload_blocks(key_size, val_size);
    let block_index = arena_offset / layout.block_size;
    bitmap::free(region.bitmap_base(), block_index, blocks);
}

/// Writes `value` into the bucket's head or chain node matching `key`,
/// replacing it if present or appending a new chain node otherwise.
/// Returns `false` only when the allocator is exhausted.
///
/// Matches the reference semantics for same-key replacement: the old
/// payload is freed before the new one is allocated, so an allocation
/// failure on replacement loses the previous value rather than rolling it
/// back. This mirrors the original implementation's behavior rather than
/// attempting to make replacement atomic.
pub unsafe fn set(region: &ShmRegion, key: &[u8], value: &[u8]) -> bool {
    let layout = region.layout();
    let bucket = bucket_index(key, layout.key_count);
    let header_byte_offset = bucket * layout.header_size as u32;
    let head = header_slot(region.header_base(), header_byte_offset);

    if (*head).is_empty() {
        // Case A: empty bucket.
        let owner = HeaderLocation::Head(header_byte_offset);
        return match alloc_payload(region, owner, key, value) {
            Some((ko, ks, vo, vs)) => {
                (*head).key_offset = ko;
                (*head).key_size = ks;
                (*head).val_offset = vo;
                (*head).val_size = vs;
                (*head).linked_item = OFFSET_NONE;
                true
            }
            None => false,
        };
    }

    if key_matches(region.data_base(), (*head).key_offset, (*head).key_size, key) {
        // Case B: replace the head's value in place.
        return replace_in_slot(region, head, HeaderLocation::Head(header_byte_offset), key, value);
    }

    // Case C: the head didn't match, so this is a collision. The source
    // only checks the head for a same-key match before taking the chain
    // path — it walks the rest of the chain purely to find the tail, with
    // no further key comparison, and unconditionally appends there. A
    // same-key collision deeper in the chain is therefore never updated in
    // place; it shadows (or is shadowed by) whichever of the two the lookup
    // walk reaches first.
    let mut cur_arena_offset = (*head).linked_item;
    let mut parent = head;
    while cur_arena_offset != OFFSET_NONE {
        let node = header_slot(region.data_base(), cur_arena_offset + 8);
        parent = node;
        cur_arena_offset = (*node).linked_item;
    }

    append_chain_node(region, parent, key, value)
}

/// Replaces the value stored at `slot` (its key is already known to match).
/// When the new value fits in the same number of blocks as the old one, it
/// is rewritten in place, keeping the same blocks and the same key bytes —
/// only `val_offset`/`val_size` change. Otherwise the old payload is freed
/// and a new one is allocated at whatever size class it now needs.
unsafe fn replace_in_slot(
    region: &ShmRegion,
    slot: *mut HeaderSlot,
    owner: HeaderLocation,
    key: &[u8],
    value: &[u8],
) -> bool {
    let layout = region.layout();
    let (old_key_offset, old_key_size, old_val_size) =
        ((*slot).key_offset, (*slot).key_size, (*slot).val_size);
    let new_val_size = value.len() as u32 + 1;

    let old_blocks = layout.payload_blocks(old_key_size, old_val_size);
    let new_blocks = layout.payload_blocks(old_key_size, new_val_size);

    if old_blocks == new_blocks {
        let addr = region.data_base().add(old_key_offset as usize - 8);
        let val_offset = old_key_offset + old_key_size;
        std::ptr::copy_nonoverlapping(value.as_ptr(), addr.add(8 + old_key_size as usize), value.len());
        *addr.add(8 + old_key_size as usize + value.len()) = 0;
        (*slot).val_offset = val_offset;
        (*slot).val_size = new_val_size;
        return true;
    }

    free_payload(region, old_key_offset, old_key_size, old_val_size);
    match alloc_payload(region, owner, key, value) {
        Some((ko, ks, vo, vs)) => {
            (*slot).key_offset = ko;
            (*slot).key_size = ks;
            (*slot).val_offset = vo;
            (*slot).val_size = vs;
            true
        }
        None => false,
    }
}

/// Allocates a new chain-node-header block, links it after `parent`, and
/// writes the new key/value payload into it.
unsafe fn append_chain_node(
    region: &ShmRegion,
    parent: *mut HeaderSlot,
    key: &[u8],
    value: &[u8],
) -> bool {
    let layout = region.layout();
    let node_blocks = layout.header_blocks();

    let mutex = region.mutex();
    mutex.lock();
    let found = bitmap::find_block(region.bitmap_base(), layout.data_count, node_blocks, node_blocks);
    mutex.unlock();
    let Some(block_index) = found else {
        return false;
    };
    let node_arena_offset = block_index * layout.block_size;
    let node_addr = bitmap::data_addr(region.data_base(), layout.block_size, block_index);
    write_tag(node_addr, CHAIN_NODE_TAG);
    let node = node_addr.add(8) as *mut HeaderSlot;

    let owner = HeaderLocation::ChainNode(node_arena_offset);
    match alloc_payload(region, owner, key, value) {
        Some((ko, ks, vo, vs)) => {
            (*node).key_offset = ko;
            (*node).key_size = ks;
            (*node).val_offset = vo;
            (*node).val_size = vs;
            (*node).linked_item = OFFSET_NONE;
            (*parent).linked_item = node_arena_offset;
            true
        }
        None => {
            bitmap::free(region.bitmap_base(), block_index, node_blocks);
            false
        }
    }
}

/// Looks up `key`, returning a copy of its stored value on a hit.
pub unsafe fn get(region: &ShmRegion, key: &[u8]) -> Option<Vec<u8>> {
    let layout = region.layout();
    let bucket = bucket_index(key, layout.key_count);
    let header_byte_offset = bucket * layout.header_size as u32;
    let head = header_slot(region.header_base(), header_byte_offset);

    if (*head).is_empty() {
        return None;
    }
    if key_matches(region.data_base(), (*head).key_offset, (*head).key_size, key) {
        return Some(read_value(region.data_base(), (*head).val_offset, (*head).val_size));
    }

    let mut next = (*head).linked_item;
    while next != OFFSET_NONE {
        let node = header_slot(region.data_base(), next + 8);
        if key_matches(region.data_base(), (*node).key_offset, (*node).key_size, key) {
            return Some(read_value(region.data_base(), (*node).val_offset, (*node).val_size));
        }
        next = (*node).linked_item;
    }

    None
}

/// Promotes the header fields of the chain node at arena offset
/// `next_offset` onto `slot` (which is owned as `slot_owner`), frees the
/// promoted node's now-vacated chain-node-header block, and repoints its
/// payload's owner tag at `slot`'s location.
unsafe fn promote_next_onto_slot(
    region: &ShmRegion,
    slot: *mut HeaderSlot,
    slot_owner: HeaderLocation,
    next_offset: u32,
) {
    let layout = region.layout();
    let next_node = header_slot(region.data_base(), next_offset + 8);
    *slot = *next_node;
    let payload_tag_addr = region.data_base().add((*slot).key_offset as usize - 8);
    write_tag(payload_tag_addr, layout::make_payload_tag(slot_owner));
    let node_blocks = layout.header_blocks();
    bitmap::free(region.bitmap_base(), next_offset / layout.block_size, node_blocks);
}

/// Removes `key`, returning:
/// - `0` if the key was not found.
/// - `1` if the key was the bucket head and a chain continues after it
///   (the next node's fields are promoted onto the head).
/// - `2` if the key was the sole entry in its bucket.
/// - `3` if the key was found via the chain walk and a chain continues
///   after it (the next node's fields are promoted onto the matched slot).
/// - `4` if the key was found via the chain walk and was the last node in
///   its chain (its parent's link is cleared).
pub unsafe fn unset(region: &ShmRegion, key: &[u8]) -> i32 {
    let layout = region.layout();
    let bucket = bucket_index(key, layout.key_count);
    let header_byte_offset = bucket * layout.header_size as u32;
    let head = header_slot(region.header_base(), header_byte_offset);

    if (*head).is_empty() {
        return 0;
    }

    if key_matches(region.data_base(), (*head).key_offset, (*head).key_size, key) {
        let next_offset = (*head).linked_item;
        free_payload(region, (*head).key_offset, (*head).key_size, (*head).val_size);

        if next_offset == OFFSET_NONE {
            *head = HeaderSlot::EMPTY;
            return 2;
        }

        promote_next_onto_slot(region, head, HeaderLocation::Head(header_byte_offset), next_offset);
        return 1;
    }

    let mut parent = head;
    let mut cur_offset = (*head).linked_item;
    while cur_offset != OFFSET_NONE {
        let node = header_slot(region.data_base(), cur_offset + 8);
        if key_matches(region.data_base(), (*node).key_offset, (*node).key_size, key) {
            let next_offset = (*node).linked_item;
            free_payload(region, (*node).key_offset, (*node).key_size, (*node).val_size);

            if next_offset == OFFSET_NONE {
                (*parent).linked_item = OFFSET_NONE;
                let node_blocks = layout.header_blocks();
                bitmap::free(region.bitmap_base(), cur_offset / layout.block_size, node_blocks);
                return 4;
            }

            promote_next_onto_slot(region, node, HeaderLocation::ChainNode(cur_offset), next_offset);
            return 3;
        }
        parent = node;
        cur_offset = (*node).linked_item;
    }

    0
}
