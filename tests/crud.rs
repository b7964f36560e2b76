mod common;

use common::fresh_table;

#[test]
fn set_get_unset_with_byte_accounting() {
    // block_size=8, key_count=10000, data_count=40000, matching spec.md
    // §8's concrete CRUD-with-accounting scenario exactly: every size
    // class below is knowable in advance, so this asserts literal
    // `free_bytes`/`longest_free_block` values rather than inequalities.
    let table = fresh_table(10_000, 40_000, 8);
    let baseline = table.mem_info();
    assert_eq!(baseline.free_bytes, 40_000 * 8);
    assert_eq!(baseline.longest_free_block, baseline.free_bytes);

    // "aaaaaa" -> "bbbbbb": payload = 8 (backpointer) + 7 (key+NUL) + 7
    // (value+NUL) = 22 bytes -> ceil(22/8) = 3 blocks = 24 bytes.
    assert!(table.set(b"aaaaaa", b"bbbbbb"));
    let after_insert = table.mem_info();
    assert_eq!(after_insert.free_bytes, baseline.free_bytes - 24);
    assert_eq!(after_insert.longest_free_block, after_insert.free_bytes);

    assert_eq!(table.get_value(b"aaaaaa"), Some(b"bbbbbb".to_vec()));
    assert_eq!(table.get_value(b"missing-key"), None);

    // Replace with a 15-char value: payload = 8 + 7 + 16 = 31 bytes ->
    // ceil(31/8) = 4 blocks = 32 bytes, 8 more than the 24 above.
    assert!(table.set(b"aaaaaa", b"123456789012345"));
    let after_grow = table.mem_info();
    assert_eq!(after_grow.free_bytes, baseline.free_bytes - 32);
    assert_eq!(after_grow.longest_free_block, after_grow.free_bytes);
    assert_eq!(table.get_value(b"aaaaaa"), Some(b"123456789012345".to_vec()));

    // Replace back to a 6-char value: returns to 3 blocks, 24 below
    // baseline.
    assert!(table.set(b"aaaaaa", b"cccccc"));
    let after_shrink = table.mem_info();
    assert_eq!(after_shrink.free_bytes, baseline.free_bytes - 24);
    assert_eq!(after_shrink.longest_free_block, after_shrink.free_bytes);
    assert_eq!(table.get_value(b"aaaaaa"), Some(b"cccccc".to_vec()));

    assert_eq!(table.unset(b"aaaaaa"), 2);
    let after_remove = table.mem_info();
    assert_eq!(after_remove.free_bytes, baseline.free_bytes);
    assert_eq!(after_remove.longest_free_block, baseline.longest_free_block);
    assert_eq!(table.get_value(b"aaaaaa"), None);
}

#[test]
fn many_independent_keys_round_trip() {
    let table = fresh_table(256, 8192, 8);
    for i in 0..500 {
        let key = format!("key-{i}");
        let value = format!("value-for-{i}");
        assert!(table.set(key.as_bytes(), value.as_bytes()));
    }
    for i in 0..500 {
        let key = format!("key-{i}");
        let value = format!("value-for-{i}");
        assert_eq!(table.get_value(key.as_bytes()), Some(value.into_bytes()));
    }
}

#[test]
fn empty_value_is_stored_and_retrieved() {
    let table = fresh_table(64, 1024, 8);
    assert!(table.set(b"k", b""));
    assert_eq!(table.get_value(b"k"), Some(Vec::new()));
}

#[test]
fn clear_resets_the_table() {
    let table = fresh_table(64, 1024, 8);
    for i in 0..20 {
        table.set(format!("k{i}").as_bytes(), b"v");
    }
    table.clear();
    for i in 0..20 {
        assert_eq!(table.get_value(format!("k{i}").as_bytes()), None);
    }
    assert!(table.set(b"after-clear", b"value"));
    assert_eq!(table.get_value(b"after-clear"), Some(b"value".to_vec()));
}
