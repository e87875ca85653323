use std::cmp::Ordering;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering};

use rand::Rng;

use crate::memtable::arena::Arena;
use crate::util::comparator::Comparator;

const MAX_HEIGHT: usize = 12;
const BRANCHING: u32 = 4;

/// A skiplist node. Nodes are carved out of the arena with their pointer
/// tower truncated to the sampled height, so a height-1 node pays for one
/// link, not `MAX_HEIGHT`.
#[repr(C)]
struct Node {
    key: *const u8,
    key_len: usize,
    height: usize,
    // Only the first `height` links are allocated and may be touched.
    tower: [AtomicPtr<Node>; MAX_HEIGHT],
}

impl Node {
    fn alloc(arena: &Arena, key: &[u8], height: usize) -> *mut Node {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));
        // Copy the key into arena memory so the node's lifetime covers it.
        let key_ptr = if key.is_empty() {
            ptr::null()
        } else {
            let dst = arena.allocate(key.len());
            unsafe { ptr::copy_nonoverlapping(key.as_ptr(), dst, key.len()) };
            dst as *const u8
        };

        let unused_links = (MAX_HEIGHT - height) * size_of::<AtomicPtr<Node>>();
        let size = size_of::<Node>() - unused_links;
        let node_ptr = arena.allocate_aligned(size) as *mut Node;
        unsafe {
            let node = &mut *node_ptr;
            ptr::write(&mut node.key, key_ptr);
            ptr::write(&mut node.key_len, key.len());
            ptr::write(&mut node.height, height);
            for level in 0..height {
                ptr::write(&mut node.tower[level], AtomicPtr::new(ptr::null_mut()));
            }
        }
        node_ptr
    }

    #[inline]
    fn key(&self) -> &[u8] {
        if self.key.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.key, self.key_len) }
        }
    }

    #[inline]
    fn next(&self, level: usize) -> *mut Node {
        debug_assert!(level < self.height);
        self.tower[level].load(AtomicOrdering::Acquire)
    }

    #[inline]
    fn set_next(&self, level: usize, node: *mut Node) {
        debug_assert!(level < self.height);
        self.tower[level].store(node, AtomicOrdering::Release);
    }
}

/// An ordered map of byte-string keys over an arena. Supports insertion
/// and ordered scans; entries are never deleted (the whole table is
/// dropped at once when the memtable retires).
///
/// One writer at a time; the engine provides any synchronization needed
/// to share a skiplist between threads.
pub struct Skiplist<C: Comparator> {
    c: C,
    arena: Arena,
    head: *mut Node,
    max_height: AtomicUsize,
}

// Sound with the single-writer contract above: all node memory is owned
// by the arena, which moves with the list.
unsafe impl<C: Comparator> Send for Skiplist<C> {}

impl<C: Comparator> Skiplist<C> {
    pub fn new(c: C) -> Self {
        let arena = Arena::new();
        let head = Node::alloc(&arena, &[], MAX_HEIGHT);
        Skiplist {
            c,
            arena,
            head,
            max_height: AtomicUsize::new(1),
        }
    }

    #[inline]
    fn current_max_height(&self) -> usize {
        self.max_height.load(AtomicOrdering::Acquire)
    }

    pub fn memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    fn random_height(&self) -> usize {
        // Increase height with probability 1 in BRANCHING.
        let mut height = 1;
        let mut rng = rand::thread_rng();
        while height < MAX_HEIGHT && rng.gen_ratio(1, BRANCHING) {
            height += 1;
        }
        height
    }

    /// True when `key` sorts after the key at `node`.
    fn key_is_after_node(&self, key: &[u8], node: *mut Node) -> bool {
        if node.is_null() {
            return false;
        }
        self.c.compare(unsafe { (*node).key() }, key) == Ordering::Less
    }

    /// Returns the earliest node at or after `key`, filling `prev` with
    /// the rightmost node before `key` on every level when provided.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut x = self.head;
        let mut level = self.current_max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if self.key_is_after_node(key, next) {
                // Keep searching in this list.
                x = next;
            } else {
                if let Some(prev) = prev.as_mut() {
                    prev[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Returns the latest node strictly before `key`, or the head node.
    fn find_less_than(&self, key: &[u8]) -> *mut Node {
        let mut x = self.head;
        let mut level = self.current_max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if next.is_null() || self.c.compare(unsafe { (*next).key() }, key) != Ordering::Less {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Returns the last node in the list, or the head node when empty.
    fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.current_max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if next.is_null() {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Inserts `key`, copying it into the arena.
    ///
    /// # Panics
    ///
    /// An equal key is already present.
    pub fn insert(&self, key: &[u8]) {
        let mut prev: [*mut Node; MAX_HEIGHT] = [ptr::null_mut(); MAX_HEIGHT];
        let x = self.find_greater_or_equal(key, Some(&mut prev));
        assert!(
            x.is_null() || self.c.compare(unsafe { (*x).key() }, key) != Ordering::Equal,
            "[skiplist] duplicate insertion"
        );

        let height = self.random_height();
        if height > self.current_max_height() {
            for p in prev
                .iter_mut()
                .take(height)
                .skip(self.current_max_height())
            {
                *p = self.head;
            }
            self.max_height.store(height, AtomicOrdering::Release);
        }

        let node = Node::alloc(&self.arena, key, height);
        for (level, p) in prev.iter().enumerate().take(height) {
            unsafe {
                (*node).set_next(level, (**p).next(level));
                (**p).set_next(level, node);
            }
        }
    }

    pub fn iter(&self) -> SkiplistIterator<'_, C> {
        SkiplistIterator {
            list: self,
            node: ptr::null(),
        }
    }
}

/// A cursor over the skiplist. Positions on nodes; the head sentinel is
/// never exposed.
pub struct SkiplistIterator<'a, C: Comparator> {
    list: &'a Skiplist<C>,
    node: *const Node,
}

impl<'a, C: Comparator> SkiplistIterator<'a, C> {
    #[inline]
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    pub fn seek_to_last(&mut self) {
        let last = self.list.find_last();
        self.node = if last == self.list.head {
            ptr::null()
        } else {
            last
        };
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    pub fn prev(&mut self) {
        // Instead of a back-link per node, search for the last node that
        // falls before the current key.
        debug_assert!(self.valid());
        let before = self.list.find_less_than(unsafe { (*self.node).key() });
        self.node = if before == self.list.head {
            ptr::null()
        } else {
            before
        };
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe { (*self.node).key() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;

    fn populated(keys: &[&[u8]]) -> Skiplist<BytewiseComparator> {
        let list = Skiplist::new(BytewiseComparator::default());
        for key in keys {
            list.insert(key);
        }
        list
    }

    #[test]
    fn test_empty() {
        let list = populated(&[]);
        let mut iter = list.iter();
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
    }

    #[test]
    fn test_insert_and_scan() {
        // Insert in scrambled order; iterate in sorted order.
        let mut keys: Vec<Vec<u8>> = (0..1000u32)
            .map(|i| format!("key{:06}", (i * 389) % 1000).into_bytes())
            .collect();
        let list = Skiplist::new(BytewiseComparator::default());
        for key in &keys {
            list.insert(key);
        }
        keys.sort();

        let mut iter = list.iter();
        iter.seek_to_first();
        for expected in &keys {
            assert!(iter.valid());
            assert_eq!(iter.key(), expected.as_slice());
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek() {
        let list = populated(&[b"b" as &[u8], b"d", b"f"]);
        let mut iter = list.iter();

        iter.seek(b"a");
        assert_eq!(iter.key(), b"b");
        iter.seek(b"b");
        assert_eq!(iter.key(), b"b");
        iter.seek(b"c");
        assert_eq!(iter.key(), b"d");
        iter.seek(b"f");
        assert_eq!(iter.key(), b"f");
        iter.seek(b"g");
        assert!(!iter.valid());
    }

    #[test]
    fn test_prev_and_last() {
        let list = populated(&[b"b" as &[u8], b"d", b"f"]);
        let mut iter = list.iter();

        iter.seek_to_last();
        assert_eq!(iter.key(), b"f");
        iter.prev();
        assert_eq!(iter.key(), b"d");
        iter.prev();
        assert_eq!(iter.key(), b"b");
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    #[should_panic]
    fn test_duplicate_insert_panics() {
        let list = populated(&[b"same" as &[u8]]);
        list.insert(b"same");
    }

    #[test]
    fn test_memory_usage_grows() {
        let list = Skiplist::new(BytewiseComparator::default());
        let before = list.memory_usage();
        for i in 0..100u32 {
            list.insert(format!("key{:04}", i).as_bytes());
        }
        assert!(list.memory_usage() > before);
    }
}
