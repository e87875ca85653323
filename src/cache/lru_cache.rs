//! A single cache shard: refcounted entries in a slab, an intrusive
//! chained hash table, and two doubly linked lists threaded through the
//! slab by index.
//!
//! Every resident entry is on exactly one list:
//!
//! * in-use: entries handed out to clients (`refs >= 2`), unordered;
//! * lru: entries only the cache references (`refs == 1`), ordered with
//!   the least recently used entry at the head and the most recently
//!   used at the tail.
//!
//! An entry removed from the cache while clients still hold it becomes
//! detached: off both lists and out of the hash table, freed when its
//! last reference is released. Only lru entries are eviction candidates.

use std::sync::{Arc, Mutex};

pub(crate) const NIL: usize = usize::MAX;

pub type EvictHook<V> = Arc<dyn Fn(&[u8], &V) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    InUse,
    Lru,
    Detached,
}

struct Entry<V> {
    key: Vec<u8>,
    hash: u32,
    charge: usize,
    value: V,
    refs: u32,
    state: EntryState,
    // List links.
    prev: usize,
    next: usize,
    // Hash chain link.
    next_hash: usize,
}

enum Slot<V> {
    Occupied(Entry<V>),
    Vacant { next_free: usize },
}

fn entry<V>(slots: &[Slot<V>], i: usize) -> &Entry<V> {
    match &slots[i] {
        Slot::Occupied(e) => e,
        Slot::Vacant { .. } => unreachable!("[cache] vacant slot {} treated as an entry", i),
    }
}

fn entry_mut<V>(slots: &mut [Slot<V>], i: usize) -> &mut Entry<V> {
    match &mut slots[i] {
        Slot::Occupied(e) => e,
        Slot::Vacant { .. } => unreachable!("[cache] vacant slot {} treated as an entry", i),
    }
}

/// Anchors of one index-linked list.
#[derive(Debug, Clone, Copy)]
struct List {
    head: usize,
    tail: usize,
}

impl List {
    fn new() -> Self {
        List {
            head: NIL,
            tail: NIL,
        }
    }
}

/// An open-chained hash table over slab indices. Buckets double from 4
/// as the table grows so the average chain stays at one entry.
struct HandleTable {
    buckets: Vec<usize>,
    elems: usize,
}

impl HandleTable {
    fn new() -> Self {
        HandleTable {
            buckets: vec![NIL; 4],
            elems: 0,
        }
    }

    #[inline]
    fn bucket(&self, hash: u32) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Walks the chain for `key`/`hash`. Returns `(prev, cur)` where
    /// `cur` is the matching entry or `NIL`, and `prev` is the chain node
    /// before it (`NIL` when `cur` heads the chain, or the chain's tail
    /// when nothing matched).
    fn find<V>(&self, slots: &[Slot<V>], key: &[u8], hash: u32) -> (usize, usize) {
        let mut prev = NIL;
        let mut cur = self.buckets[self.bucket(hash)];
        while cur != NIL {
            let e = entry(slots, cur);
            if e.hash == hash && e.key == key {
                return (prev, cur);
            }
            prev = cur;
            cur = e.next_hash;
        }
        (prev, NIL)
    }

    fn lookup<V>(&self, slots: &[Slot<V>], key: &[u8], hash: u32) -> usize {
        self.find(slots, key, hash).1
    }

    /// Inserts `idx`, returning the displaced entry when one with the
    /// same key and hash was already present (the caller unrefs it).
    fn insert<V>(&mut self, slots: &mut [Slot<V>], idx: usize) -> usize {
        let (key, hash) = {
            let e = entry(slots, idx);
            (e.key.clone(), e.hash)
        };
        let (prev, old) = self.find(slots, &key, hash);
        let chain_next = if old != NIL {
            entry(slots, old).next_hash
        } else {
            NIL
        };
        entry_mut(slots, idx).next_hash = chain_next;
        if prev == NIL {
            let b = self.bucket(hash);
            self.buckets[b] = idx;
        } else {
            entry_mut(slots, prev).next_hash = idx;
        }
        if old == NIL {
            self.elems += 1;
            if self.elems > self.buckets.len() {
                // Since entries are fairly large, we aim for a small
                // average chain length (<= 1).
                self.resize(slots);
            }
        }
        old
    }

    /// Unlinks `idx` from its chain by identity.
    fn remove_slot<V>(&mut self, slots: &mut [Slot<V>], idx: usize) {
        let hash = entry(slots, idx).hash;
        let b = self.bucket(hash);
        let mut prev = NIL;
        let mut cur = self.buckets[b];
        while cur != NIL {
            if cur == idx {
                let next = entry(slots, cur).next_hash;
                if prev == NIL {
                    self.buckets[b] = next;
                } else {
                    entry_mut(slots, prev).next_hash = next;
                }
                self.elems -= 1;
                return;
            }
            prev = cur;
            cur = entry(slots, cur).next_hash;
        }
        unreachable!("[cache] slot {} missing from its hash chain", idx);
    }

    fn resize<V>(&mut self, slots: &mut [Slot<V>]) {
        let mut new_len = 4;
        while new_len < self.elems {
            new_len *= 2;
        }
        let mut new_buckets = vec![NIL; new_len];
        let mut count = 0;
        for b in 0..self.buckets.len() {
            let mut cur = self.buckets[b];
            while cur != NIL {
                let (next, hash) = {
                    let e = entry(slots, cur);
                    (e.next_hash, e.hash)
                };
                let nb = (hash as usize) & (new_len - 1);
                entry_mut(slots, cur).next_hash = new_buckets[nb];
                new_buckets[nb] = cur;
                cur = next;
                count += 1;
            }
        }
        assert_eq!(count, self.elems);
        self.buckets = new_buckets;
    }
}

struct ShardInner<V> {
    slots: Vec<Slot<V>>,
    free_head: usize,
    usage: usize,
    in_use: List,
    lru: List,
    table: HandleTable,
    evict_hook: Option<EvictHook<V>>,
}

impl<V> ShardInner<V> {
    fn alloc_slot(&mut self, e: Entry<V>) -> usize {
        if self.free_head != NIL {
            let i = self.free_head;
            match std::mem::replace(&mut self.slots[i], Slot::Occupied(e)) {
                Slot::Vacant { next_free } => self.free_head = next_free,
                Slot::Occupied(_) => unreachable!("[cache] free list pointed at an occupied slot"),
            }
            i
        } else {
            self.slots.push(Slot::Occupied(e));
            self.slots.len() - 1
        }
    }

    fn free_slot(&mut self, i: usize) {
        let slot = std::mem::replace(
            &mut self.slots[i],
            Slot::Vacant {
                next_free: self.free_head,
            },
        );
        self.free_head = i;
        match slot {
            Slot::Occupied(e) => {
                if let Some(hook) = &self.evict_hook {
                    hook(&e.key, &e.value);
                }
            }
            Slot::Vacant { .. } => unreachable!("[cache] double free of slot {}", i),
        }
    }

    fn list(&self, state: EntryState) -> List {
        match state {
            EntryState::InUse => self.in_use,
            EntryState::Lru => self.lru,
            EntryState::Detached => unreachable!("[cache] a detached entry is on no list"),
        }
    }

    fn store_list(&mut self, state: EntryState, list: List) {
        match state {
            EntryState::InUse => self.in_use = list,
            EntryState::Lru => self.lru = list,
            EntryState::Detached => unreachable!("[cache] a detached entry is on no list"),
        }
    }

    /// Appends `i` at the tail (the MRU end) of the chosen list.
    fn push_back(&mut self, state: EntryState, i: usize) {
        let mut list = self.list(state);
        {
            let e = entry_mut(&mut self.slots, i);
            e.prev = list.tail;
            e.next = NIL;
            e.state = state;
        }
        if list.tail != NIL {
            entry_mut(&mut self.slots, list.tail).next = i;
        } else {
            list.head = i;
        }
        list.tail = i;
        self.store_list(state, list);
    }

    /// Detaches `i` from whichever list it is on.
    fn unlink(&mut self, i: usize) {
        let (prev, next, state) = {
            let e = entry(&self.slots, i);
            (e.prev, e.next, e.state)
        };
        let mut list = self.list(state);
        if prev != NIL {
            entry_mut(&mut self.slots, prev).next = next;
        } else {
            list.head = next;
        }
        if next != NIL {
            entry_mut(&mut self.slots, next).prev = prev;
        } else {
            list.tail = prev;
        }
        self.store_list(state, list);
        entry_mut(&mut self.slots, i).state = EntryState::Detached;
    }

    fn unref(&mut self, i: usize) {
        let (refs, state) = {
            let e = entry_mut(&mut self.slots, i);
            debug_assert!(e.refs > 0);
            e.refs -= 1;
            (e.refs, e.state)
        };
        if refs == 0 {
            debug_assert_eq!(state, EntryState::Detached);
            self.free_slot(i);
        } else if state == EntryState::InUse && refs == 1 {
            // No longer in use by clients; becomes an eviction candidate
            // at the MRU end of the lru list.
            self.unlink(i);
            self.push_back(EntryState::Lru, i);
        }
    }

    /// Finishes removing an entry that has already left the hash table:
    /// off its list, out of the usage sum, gone once unreferenced.
    fn finish_erase(&mut self, i: usize) {
        self.unlink(i);
        self.usage -= entry(&self.slots, i).charge;
        self.unref(i);
    }
}

/// One shard of the sharded cache. All state sits behind a single mutex;
/// operations on distinct shards run in parallel.
pub(crate) struct LRUCacheShard<V> {
    capacity: usize,
    inner: Mutex<ShardInner<V>>,
}

impl<V: Clone> LRUCacheShard<V> {
    pub(crate) fn new(capacity: usize, evict_hook: Option<EvictHook<V>>) -> Self {
        LRUCacheShard {
            capacity,
            inner: Mutex::new(ShardInner {
                slots: vec![],
                free_head: NIL,
                usage: 0,
                in_use: List::new(),
                lru: List::new(),
                table: HandleTable::new(),
                evict_hook,
            }),
        }
    }

    /// Inserts the entry with two references (the cache's and the
    /// returned handle's) and evicts from the lru list while over
    /// capacity. Returns the slot backing the handle, or `None` for a
    /// zero-capacity cache, which stores nothing.
    pub(crate) fn insert(&self, key: &[u8], hash: u32, value: V, charge: usize) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let e = Entry {
            key: key.to_vec(),
            hash,
            charge,
            value,
            refs: 2,
            state: EntryState::Detached,
            prev: NIL,
            next: NIL,
            next_hash: NIL,
        };
        let i = inner.alloc_slot(e);
        inner.push_back(EntryState::InUse, i);
        inner.usage += charge;
        let old = {
            let ShardInner { slots, table, .. } = &mut *inner;
            table.insert(slots, i)
        };
        if old != NIL {
            inner.finish_erase(old);
        }
        while inner.usage > self.capacity && inner.lru.head != NIL {
            let oldest = inner.lru.head;
            debug_assert_eq!(entry(&inner.slots, oldest).refs, 1);
            {
                let ShardInner { slots, table, .. } = &mut *inner;
                table.remove_slot(slots, oldest);
            }
            inner.finish_erase(oldest);
        }
        Some(i)
    }

    /// Finds the entry, pins it with an extra reference, and returns its
    /// slot and a clone of the value.
    pub(crate) fn lookup(&self, key: &[u8], hash: u32) -> Option<(usize, V)> {
        let mut inner = self.inner.lock().unwrap();
        let i = inner.table.lookup(&inner.slots, key, hash);
        if i == NIL {
            return None;
        }
        let (value, state) = {
            let e = entry_mut(&mut inner.slots, i);
            e.refs += 1;
            (e.value.clone(), e.state)
        };
        if state == EntryState::Lru {
            inner.unlink(i);
            inner.push_back(EntryState::InUse, i);
        }
        Some((i, value))
    }

    /// Releases one reference on the entry at `slot`.
    pub(crate) fn release(&self, slot: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.unref(slot);
    }

    /// Removes the keyed entry from the cache. The entry itself persists
    /// until every outstanding handle is released.
    pub(crate) fn erase(&self, key: &[u8], hash: u32) {
        let mut inner = self.inner.lock().unwrap();
        let i = inner.table.lookup(&inner.slots, key, hash);
        if i == NIL {
            return;
        }
        {
            let ShardInner { slots, table, .. } = &mut *inner;
            table.remove_slot(slots, i);
        }
        inner.finish_erase(i);
    }

    /// Evicts every entry on the lru list.
    pub(crate) fn prune(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.lru.head != NIL {
            let oldest = inner.lru.head;
            {
                let ShardInner { slots, table, .. } = &mut *inner;
                table.remove_slot(slots, oldest);
            }
            inner.finish_erase(oldest);
        }
    }

    pub(crate) fn total_charge(&self) -> usize {
        self.inner.lock().unwrap().usage
    }

    /// The keys on the lru list, least recently used first.
    #[cfg(test)]
    pub(crate) fn lru_keys(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let mut keys = vec![];
        let mut i = inner.lru.head;
        while i != NIL {
            let e = entry(&inner.slots, i);
            keys.push(e.key.clone());
            i = e.next;
        }
        keys
    }

    /// Checks the usage bookkeeping: the charges of the entries on both
    /// lists must sum to `usage`, every listed entry must be referenced,
    /// and no entry may sit on both lists.
    #[cfg(test)]
    pub(crate) fn verify_usage_invariant(&self) {
        let inner = self.inner.lock().unwrap();
        let mut sum = 0;
        let mut seen = std::collections::HashSet::new();
        for (list, min_refs) in [(inner.in_use, 2u32), (inner.lru, 1u32)] {
            let mut i = list.head;
            while i != NIL {
                let e = entry(&inner.slots, i);
                assert!(seen.insert(i), "entry {} appears on both lists", i);
                assert!(e.refs >= min_refs);
                sum += e.charge;
                i = e.next;
            }
        }
        assert_eq!(sum, inner.usage);
    }
}
