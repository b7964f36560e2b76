/// Compacting defragmenter.
///
/// A single left-to-right sweep over the bitmap that slides every allocated
/// run down into the free space preceding it, eliminating fragmentation in
/// one pass without needing a second bitmap or an auxiliary move log. Each
/// relocated block is disambiguated via its 8-byte tag word and its owning
/// header record(s) are rewritten to point at the new location.
///
/// Unlike the reference implementation, this holds the service mutex for
/// the entire pass rather than leaving it unlocked: a concurrent `set`
/// racing a relocation could otherwise allocate into bytes this pass is
/// mid-copy out of, or read a header mid-rewrite.
use super::bitmap;
use super::layout::{self, HeaderLocation, HeaderSlot, OFFSET_NONE};
use super::region::ShmRegion;

/// Runs one full compaction pass, returning the number of blocks relocated.
pub unsafe fn hard_defragmentation(region: &ShmRegion) -> u32 {
    let mutex = region.mutex();
    mutex.lock();
    let moved = compact(region);
    mutex.unlock();
    moved
}

unsafe fn compact(region: &ShmRegion) -> u32 {
    let layout = region.layout();
    let bitmap_base = region.bitmap_base();
    let data_count = layout.data_count;
    let block_size = layout.block_size;

    let mut moved = 0u32;
    let mut free_run_start: Option<u32> = None;
    let mut i: u32 = 0;

    while i < data_count {
        if *bitmap_base.add(i as usize) == 0 {
            if free_run_start.is_none() {
                free_run_start = Some(i);
            }
            i += 1;
            continue;
        }

        let Some(run_start) = free_run_start else {
            i += 1;
            continue;
        };

        let old_block_index = i;
        let old_addr = bitmap::data_addr(region.data_base(), block_size, old_block_index);
        let tag = std::ptr::read_unaligned(old_addr as *const u64);
        let blocks = if layout::tag_is_payload(tag) {
            let owner = layout::payload_owner(tag);
            let owner_slot = owner_ptr(region, owner);
            layout.payload_blocks((*owner_slot).key_size, (*owner_slot).val_size)
        } else {
            layout.header_blocks()
        };

        let new_addr = bitmap::data_addr(region.data_base(), block_size, run_start);
        let byte_len = blocks as usize * block_size as usize;
        std::ptr::copy(old_addr, new_addr, byte_len);

        let new_end = run_start + blocks;
        let old_end = old_block_index + blocks;
        bitmap::reserve(bitmap_base, run_start, blocks);
        if new_end < old_end {
            bitmap::free(bitmap_base, new_end, old_end - new_end);
        }

        let shift_bytes = (old_block_index - run_start) * block_size;
        if layout::tag_is_payload(tag) {
            let owner = layout::payload_owner(tag);
            let owner_slot = owner_ptr(region, owner);
            (*owner_slot).key_offset -= shift_bytes;
            (*owner_slot).val_offset -= shift_bytes;
        } else {
            let old_node_offset = old_block_index * block_size;
            let new_node_offset = run_start * block_size;
            let node = (new_addr.add(8)) as *mut HeaderSlot;
            relink_parent(region, node, old_node_offset, new_node_offset);
            // The node's own key/value payload carries an owner backpointer
            // to this header record; repoint it now that the record moved.
            let payload_tag_addr = region.data_base().add((*node).key_offset as usize - 8);
            std::ptr::write_unaligned(
                payload_tag_addr as *mut u64,
                layout::make_payload_tag(HeaderLocation::ChainNode(new_node_offset)),
            );
        }

        moved += 1;
        free_run_start = None;
        i = new_end;
    }

    moved
}

unsafe fn owner_ptr(region: &ShmRegion, owner: HeaderLocation) -> *mut HeaderSlot {
    match owner {
        HeaderLocation::Head(off) => region.header_base().add(off as usize) as *mut HeaderSlot,
        HeaderLocation::ChainNode(off) => region.data_base().add(off as usize + 8) as *mut HeaderSlot,
    }
}

/// Finds whichever header record (a bucket head or another chain node)
/// points at `old_offset` via `linked_item`, and repoints it at
/// `new_offset`. The search starts from the bucket the relocated node's own
/// key hashes to, since that's the only chain it can belong to.
unsafe fn relink_parent(region: &ShmRegion, node: *mut HeaderSlot, old_offset: u32, new_offset: u32) {
    let layout = region.layout();
    let key_len = (*node).key_size as usize - 1;
    let key = std::slice::from_raw_parts(
        region.data_base().add((*node).key_offset as usize),
        key_len,
    );
    let bucket = crate::hash::meiyan(key) % layout.key_count;
    let head = region.header_base().add(bucket as usize * layout.header_size) as *mut HeaderSlot;

    if (*head).linked_item == old_offset {
        (*head).linked_item = new_offset;
        return;
    }

    let mut cur = head;
    while (*cur).linked_item != OFFSET_NONE {
        let next_offset = (*cur).linked_item;
        if next_offset == old_offset {
            (*cur).linked_item = new_offset;
            return;
        }
        cur = region.data_base().add(next_offset as usize + 8) as *mut HeaderSlot;
    }
}
