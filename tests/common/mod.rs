use rand::Rng;
use shm_hashtable::{hash::meiyan, ShmHashTable};
use std::sync::atomic::{AtomicU32, Ordering};

static COUNTER: AtomicU32 = AtomicU32::new(0);
static LOG_INIT: std::sync::Once = std::sync::Once::new();

/// Creates a freshly-named table for a test, removing any stale backing
/// file a previous crashed run might have left behind.
pub fn fresh_table(key_count: u32, data_count: u32, block_size: u32) -> ShmHashTable {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("smht_it_{}_{id}", std::process::id());
    let _ = ShmHashTable::unlink(&name);
    ShmHashTable::create_or_open(&name, key_count, data_count, block_size).unwrap()
}

pub fn random_bytes(rng: &mut impl Rng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect()
}

/// Generates `count` distinct keys that all fall in the same bucket for a
/// table with `key_count` buckets, by brute-force sampling random keys and
/// keeping ones whose hash matches. Mirrors the reference test suite's way
/// of forcing chain growth deterministically.
pub fn find_collision(key_count: u32, count: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    let mut target_bucket: Option<u32> = None;
    let mut found = Vec::with_capacity(count);

    loop {
        let candidate = random_bytes(&mut rng, 8 + (found.len() % 5));
        let bucket = meiyan(&candidate) % key_count;

        match target_bucket {
            None => {
                target_bucket = Some(bucket);
                found.push(candidate);
            }
            Some(target) if bucket == target && !found.contains(&candidate) => {
                found.push(candidate);
            }
            _ => continue,
        }

        if found.len() == count {
            return found;
        }
    }
}
