//! A sharded, capacity-bounded LRU cache with pinned handles.
//!
//! Capacity is split across 16 shards selected by the top four bits of
//! the key hash, each with its own mutex, so operations on different
//! shards never contend. Values are handed out inside `CacheHandle`
//! guards: while a handle lives, its entry is pinned and cannot be
//! evicted; dropping the handle releases the reference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::lru_cache::LRUCacheShard;
pub use crate::cache::lru_cache::EvictHook;
use crate::util::hash::hash;

mod lru_cache;

const NUM_SHARD_BITS: usize = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

fn shard_index(hash: u32) -> usize {
    (hash >> (32 - NUM_SHARD_BITS)) as usize
}

pub struct ShardedLRUCache<V: Clone> {
    shards: Vec<Arc<LRUCacheShard<V>>>,
    last_id: AtomicU64,
}

impl<V: Clone> ShardedLRUCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self::with_evict_hook(capacity, None)
    }

    /// Like `new`, but invokes `hook` with each entry's key and value
    /// when the entry is finally freed (evicted, erased or replaced, and
    /// released by every handle).
    pub fn with_evict_hook(capacity: usize, hook: Option<EvictHook<V>>) -> Self {
        // Round the per-shard capacity up so the shards never hold less
        // than the requested total.
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        let shards = (0..NUM_SHARDS)
            .map(|_| Arc::new(LRUCacheShard::new(per_shard, hook.clone())))
            .collect();
        ShardedLRUCache {
            shards,
            last_id: AtomicU64::new(0),
        }
    }

    fn shard(&self, h: u32) -> &Arc<LRUCacheShard<V>> {
        &self.shards[shard_index(h)]
    }

    /// Inserts a mapping from `key` to `value` with the given charge
    /// against the cache capacity, and returns a handle pinning it. An
    /// existing entry for the key is displaced and freed once released.
    pub fn insert(&self, key: &[u8], value: V, charge: usize) -> CacheHandle<V> {
        let h = hash(key, 0);
        let shard = self.shard(h).clone();
        match shard.insert(key, h, value.clone(), charge) {
            Some(slot) => CacheHandle {
                shard: Some(shard),
                slot,
                value,
            },
            // A zero-capacity cache stores nothing; the handle simply
            // carries the value.
            None => CacheHandle {
                shard: None,
                slot: 0,
                value,
            },
        }
    }

    /// Returns a handle pinning the cached mapping for `key`, if any.
    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle<V>> {
        let h = hash(key, 0);
        let shard = self.shard(h).clone();
        shard.lookup(key, h).map(|(slot, value)| CacheHandle {
            shard: Some(shard),
            slot,
            value,
        })
    }

    /// Removes the mapping for `key`. The underlying entry persists until
    /// all outstanding handles release it.
    pub fn erase(&self, key: &[u8]) {
        let h = hash(key, 0);
        self.shard(h).erase(key, h);
    }

    /// Evicts everything that no client currently pins.
    pub fn prune(&self) {
        for shard in &self.shards {
            shard.prune();
        }
    }

    /// The sum of the charges of all resident entries.
    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|s| s.total_charge()).sum()
    }

    /// Returns a new numeric id. Clients sharing the cache partition
    /// their key spaces by prefixing keys with an id from here.
    pub fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[cfg(test)]
    fn shard_of_key(&self, key: &[u8]) -> &Arc<LRUCacheShard<V>> {
        self.shard(hash(key, 0))
    }

    #[cfg(test)]
    fn verify_usage_invariant(&self) {
        for shard in &self.shards {
            shard.verify_usage_invariant();
        }
    }
}

/// A pinned reference to a cache entry. The entry cannot be evicted
/// while the handle lives; dropping the handle releases it.
pub struct CacheHandle<V: Clone> {
    shard: Option<Arc<LRUCacheShard<V>>>,
    slot: usize,
    value: V,
}

impl<V: Clone> CacheHandle<V> {
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }
}

impl<V: Clone> Drop for CacheHandle<V> {
    fn drop(&mut self) {
        if let Some(shard) = self.shard.take() {
            shard.release(self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::coding::{decode_fixed_32, put_fixed_32};
    use std::sync::Mutex;
    use std::thread;

    const CACHE_SIZE: usize = 1000;

    struct CacheTest {
        cache: ShardedLRUCache<u32>,
        deleted_kv: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    fn encode_key(k: u32) -> Vec<u8> {
        let mut v = vec![];
        put_fixed_32(&mut v, k);
        v
    }

    impl CacheTest {
        fn new(capacity: usize) -> Self {
            let deleted_kv = Arc::new(Mutex::new(vec![]));
            let cloned = deleted_kv.clone();
            let hook: EvictHook<u32> = Arc::new(move |k: &[u8], v: &u32| {
                cloned.lock().unwrap().push((decode_fixed_32(k), *v));
            });
            Self {
                cache: ShardedLRUCache::with_evict_hook(capacity, Some(hook)),
                deleted_kv,
            }
        }

        fn get(&self, key: u32) -> Option<u32> {
            self.cache.lookup(&encode_key(key)).map(|h| *h.value())
        }

        fn insert(&self, key: u32, value: u32) {
            self.cache.insert(&encode_key(key), value, 1);
        }

        fn insert_with_charge(&self, key: u32, value: u32, charge: usize) {
            self.cache.insert(&encode_key(key), value, charge);
        }

        fn insert_pinned(&self, key: u32, value: u32) -> CacheHandle<u32> {
            self.cache.insert(&encode_key(key), value, 1)
        }

        fn erase(&self, key: u32) {
            self.cache.erase(&encode_key(key));
        }

        fn assert_deleted_kv(&self, index: usize, (key, val): (u32, u32)) {
            assert_eq!((key, val), self.deleted_kv.lock().unwrap()[index]);
        }
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = CacheTest::new(CACHE_SIZE);
        assert_eq!(None, cache.get(100));
        cache.insert(100, 101);
        assert_eq!(Some(101), cache.get(100));
        assert_eq!(None, cache.get(200));
        assert_eq!(None, cache.get(300));

        cache.insert(200, 201);
        assert_eq!(Some(101), cache.get(100));
        assert_eq!(Some(201), cache.get(200));
        assert_eq!(None, cache.get(300));

        cache.insert(100, 102);
        assert_eq!(Some(102), cache.get(100));
        assert_eq!(Some(201), cache.get(200));
        assert_eq!(None, cache.get(300));

        assert_eq!(1, cache.deleted_kv.lock().unwrap().len());
        cache.assert_deleted_kv(0, (100, 101));
        cache.cache.verify_usage_invariant();
    }

    #[test]
    fn test_erase() {
        let cache = CacheTest::new(CACHE_SIZE);
        cache.erase(200);
        assert_eq!(0, cache.deleted_kv.lock().unwrap().len());

        cache.insert(100, 101);
        cache.insert(200, 201);
        cache.erase(100);

        assert_eq!(None, cache.get(100));
        assert_eq!(Some(201), cache.get(200));
        assert_eq!(1, cache.deleted_kv.lock().unwrap().len());
        cache.assert_deleted_kv(0, (100, 101));

        cache.erase(100);
        assert_eq!(None, cache.get(100));
        assert_eq!(Some(201), cache.get(200));
        assert_eq!(1, cache.deleted_kv.lock().unwrap().len());
    }

    #[test]
    fn test_entries_are_pinned() {
        let cache = CacheTest::new(CACHE_SIZE);
        cache.insert(100, 101);
        let h1 = cache.cache.lookup(&encode_key(100)).unwrap();
        assert_eq!(*h1.value(), 101);

        // Replacing the entry does not free it while h1 pins it.
        cache.insert(100, 102);
        let h2 = cache.cache.lookup(&encode_key(100)).unwrap();
        assert_eq!(*h2.value(), 102);
        assert_eq!(0, cache.deleted_kv.lock().unwrap().len());

        drop(h1);
        assert_eq!(1, cache.deleted_kv.lock().unwrap().len());
        cache.assert_deleted_kv(0, (100, 101));

        cache.erase(100);
        assert_eq!(None, cache.get(100));
        assert_eq!(1, cache.deleted_kv.lock().unwrap().len());

        drop(h2);
        assert_eq!(2, cache.deleted_kv.lock().unwrap().len());
        cache.assert_deleted_kv(1, (100, 102));
        cache.cache.verify_usage_invariant();
    }

    #[test]
    fn test_eviction_policy() {
        let cache = CacheTest::new(CACHE_SIZE);
        cache.insert(100, 101);
        cache.insert(200, 201);

        // Frequently used entries must be kept around. Overfill every
        // shard several times over so the untouched entry is certainly
        // evicted.
        for i in 0..(CACHE_SIZE * 3) as u32 {
            cache.insert(1000 + i, 2000 + i);
            assert_eq!(Some(2000 + i), cache.get(1000 + i));
            assert_eq!(Some(101), cache.get(100));
        }
        assert_eq!(Some(101), cache.get(100));
        assert_eq!(None, cache.get(200));
        cache.cache.verify_usage_invariant();
    }

    #[test]
    fn test_pinned_entries_are_never_evicted() {
        // A tiny cache where everything lands in known shards: pin two
        // entries, overflow the cache, and check the pins survive.
        let cache = CacheTest::new(16);
        let h1 = cache.insert_pinned(1, 100);
        let h2 = cache.insert_pinned(2, 200);
        for i in 10..1000u32 {
            cache.insert(i, i);
        }
        assert_eq!(*h1.value(), 100);
        assert_eq!(*h2.value(), 200);
        assert_eq!(Some(100), cache.get(1));
        assert_eq!(Some(200), cache.get(2));
        let deleted: Vec<u32> = cache
            .deleted_kv
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| *k)
            .collect();
        assert!(!deleted.contains(&1));
        assert!(!deleted.contains(&2));
        drop(h1);
        drop(h2);
        cache.cache.verify_usage_invariant();
    }

    #[test]
    fn test_heavy_entries() {
        let cache = CacheTest::new(CACHE_SIZE);
        let light = 1;
        let heavy = 10;
        let mut added = 0;
        let mut index = 0;
        while added < 2 * CACHE_SIZE {
            let weight = if index & 1 == 0 { light } else { heavy };
            cache.insert_with_charge(index as u32, 1000 + index as u32, weight);
            added += weight;
            index += 1;
        }
        let mut cache_weight = 0;
        for i in 0..index {
            let weight = if i & 1 == 0 { light } else { heavy };
            if let Some(val) = cache.get(i as u32) {
                cache_weight += weight;
                assert_eq!(1000 + i as u32, val);
            }
        }
        // The per-shard rounding admits a little slack over the nominal
        // capacity, but the total stays in its neighborhood.
        assert!(cache_weight <= CACHE_SIZE + NUM_SHARDS * heavy);
        cache.cache.verify_usage_invariant();
    }

    #[test]
    fn test_zero_size_cache() {
        let cache = CacheTest::new(0);
        cache.insert(100, 101);
        assert_eq!(None, cache.get(100));
        assert_eq!(0, cache.cache.total_charge());
    }

    #[test]
    fn test_zero_size_handle_still_carries_value() {
        let cache = ShardedLRUCache::<u32>::new(0);
        let h = cache.insert(b"k", 7, 1);
        assert_eq!(*h.value(), 7);
    }

    #[test]
    fn test_prune() {
        let cache = CacheTest::new(CACHE_SIZE);
        cache.insert(1, 100);
        cache.insert(2, 200);
        let pinned = cache.cache.lookup(&encode_key(1)).unwrap();
        cache.cache.prune();
        // Only the unpinned entry was evicted.
        assert_eq!(Some(100), cache.get(1));
        assert_eq!(None, cache.get(2));
        assert_eq!(1, cache.deleted_kv.lock().unwrap().len());
        cache.assert_deleted_kv(0, (2, 200));
        drop(pinned);
        cache.cache.verify_usage_invariant();
    }

    #[test]
    fn test_usage_tracks_eviction_within_one_shard() {
        // Pick keys that land in the same shard so eviction order is
        // deterministic, then overfill that shard.
        let cache = ShardedLRUCache::<u32>::new(NUM_SHARDS * 10);
        let shard0 = cache.shard_of_key(&encode_u32_key(0));
        let mut keys = vec![];
        let mut i = 0u32;
        while keys.len() < 16 {
            let key = encode_u32_key(i);
            if Arc::ptr_eq(cache.shard_of_key(&key), shard0) {
                keys.push(key);
            }
            i += 1;
        }
        for (n, key) in keys.iter().enumerate() {
            cache.insert(key, n as u32, 1);
        }
        assert_eq!(shard0.total_charge(), 10);
        // The first six inserted keys were evicted, oldest first.
        for key in &keys[..6] {
            assert!(cache.lookup(key).is_none());
        }
        for key in &keys[6..] {
            assert!(cache.lookup(key).is_some());
        }
        // The most recently inserted key sits at the MRU end.
        let lru = shard0.lru_keys();
        assert_eq!(lru.last().unwrap(), keys.last().unwrap());
        assert_eq!(&lru[0], &keys[6]);
        cache.verify_usage_invariant();
    }

    fn encode_u32_key(i: u32) -> Vec<u8> {
        let mut v = vec![];
        put_fixed_32(&mut v, i);
        v
    }

    #[test]
    fn test_new_id_is_unique() {
        let cache = ShardedLRUCache::<u32>::new(CACHE_SIZE);
        let a = cache.new_id();
        let b = cache.new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_concurrent_insert() {
        let cache = Arc::new(ShardedLRUCache::<String>::new(1 << 20));
        let n = 4;
        let repeated = 10;
        let mut handles = vec![];
        let kv: Arc<Mutex<Vec<(Vec<u8>, String)>>> = Arc::new(Mutex::new(vec![]));
        let total_size = Arc::new(AtomicU64::new(0));
        for i in 0..n {
            let cache = cache.clone();
            let kv = kv.clone();
            let total_size = total_size.clone();
            let h = thread::spawn(move || {
                for x in 1..=repeated {
                    let k = i.to_string().repeat(x).into_bytes();
                    let v = String::from_utf8(k.clone()).unwrap();
                    {
                        let mut kv = kv.lock().unwrap();
                        kv.push((k.clone(), v.clone()));
                    }
                    total_size.fetch_add(x as u64, Ordering::SeqCst);
                    cache.insert(&k, v, x);
                }
            });
            handles.push(h);
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            total_size.load(Ordering::Relaxed) as usize,
            cache.total_charge()
        );
        for (k, v) in kv.lock().unwrap().clone() {
            let found = cache.lookup(&k).unwrap();
            assert_eq!(found.value(), &v);
        }
        cache.verify_usage_invariant();
    }
}
