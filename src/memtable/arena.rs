use std::alloc::{alloc, dealloc, Layout};
use std::cell::RefCell;
use std::mem::size_of;

const BLOCK_SIZE: usize = 4096;

/// A bump allocator backing one memtable. Memory is carved out of
/// 4 KiB blocks; oversized requests get a dedicated block so the tail of
/// the current block is not wasted on them. All blocks are freed together
/// when the arena drops, and no allocation ever moves.
///
/// Single-owner: one memtable writes through one arena. The arena is not
/// `Sync`; concurrent access must be arranged by the surrounding engine.
pub struct Arena {
    inner: RefCell<ArenaInner>,
}

struct ArenaInner {
    blocks: Vec<ArenaBlock>,
    // Bump state within the current block.
    alloc_ptr: *mut u8,
    alloc_bytes_remaining: usize,
    // Total footprint including one pointer of bookkeeping per block.
    memory_usage: usize,
}

struct ArenaBlock {
    ptr: *mut u8,
    size: usize,
}

fn block_layout(size: usize) -> Layout {
    // Blocks are 8-aligned so aligned allocations can rely on block
    // starts being aligned.
    Layout::from_size_align(size, 8).expect("[arena] invalid block layout")
}

impl Default for Arena {
    fn default() -> Self {
        Arena {
            inner: RefCell::new(ArenaInner {
                blocks: vec![],
                alloc_ptr: std::ptr::null_mut(),
                alloc_bytes_remaining: 0,
                memory_usage: 0,
            }),
        }
    }
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a pointer to `bytes` fresh bytes. The memory lives as long
    /// as the arena.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        // The semantics of what to return are a bit messy if we allow
        // 0-byte allocations, so we disallow them here.
        assert!(bytes > 0, "[arena] zero-sized allocation");
        let mut inner = self.inner.borrow_mut();
        if bytes <= inner.alloc_bytes_remaining {
            let result = inner.alloc_ptr;
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(bytes) };
            inner.alloc_bytes_remaining -= bytes;
            return result;
        }
        inner.allocate_fallback(bytes)
    }

    /// Like `allocate`, but the result is aligned for any node layout:
    /// to a pointer width, or 8 bytes if pointers are smaller.
    pub fn allocate_aligned(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0, "[arena] zero-sized allocation");
        let align = if size_of::<usize>() > 8 {
            size_of::<usize>()
        } else {
            8
        };
        debug_assert!(align & (align - 1) == 0, "alignment must be a power of two");

        let mut inner = self.inner.borrow_mut();
        let current_mod = inner.alloc_ptr as usize & (align - 1);
        let slop = if current_mod == 0 {
            0
        } else {
            align - current_mod
        };
        let needed = bytes + slop;
        let result = if needed <= inner.alloc_bytes_remaining {
            let result = unsafe { inner.alloc_ptr.add(slop) };
            inner.alloc_ptr = unsafe { inner.alloc_ptr.add(needed) };
            inner.alloc_bytes_remaining -= needed;
            result
        } else {
            // Fallback blocks are always sufficiently aligned.
            inner.allocate_fallback(bytes)
        };
        debug_assert_eq!(result as usize & (align - 1), 0);
        result
    }

    /// An estimate of the total memory footprint of data allocated by the
    /// arena.
    pub fn memory_usage(&self) -> usize {
        self.inner.borrow().memory_usage
    }
}

impl ArenaInner {
    fn allocate_fallback(&mut self, bytes: usize) -> *mut u8 {
        if bytes > BLOCK_SIZE / 4 {
            // Object is more than a quarter of our block size. Allocate it
            // separately to avoid wasting too much space in leftover bytes.
            return self.allocate_new_block(bytes);
        }

        // We waste the remaining space in the current block.
        let ptr = self.allocate_new_block(BLOCK_SIZE);
        self.alloc_ptr = unsafe { ptr.add(bytes) };
        self.alloc_bytes_remaining = BLOCK_SIZE - bytes;
        ptr
    }

    fn allocate_new_block(&mut self, block_bytes: usize) -> *mut u8 {
        let ptr = unsafe { alloc(block_layout(block_bytes)) };
        assert!(!ptr.is_null(), "[arena] out of memory");
        self.blocks.push(ArenaBlock {
            ptr,
            size: block_bytes,
        });
        self.memory_usage += block_bytes + size_of::<*mut u8>();
        ptr
    }
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        for block in &self.blocks {
            unsafe { dealloc(block.ptr, block_layout(block.size)) };
        }
    }
}

// Sound: the arena exclusively owns every block it hands out pointers
// into, so moving it across threads moves the whole allocation graph.
unsafe impl Send for Arena {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_empty() {
        let arena = Arena::new();
        assert_eq!(arena.memory_usage(), 0);
    }

    #[test]
    fn test_simple_allocations_do_not_overlap() {
        // Allocate many randomly sized chunks, stamp each with its own
        // pattern, and verify nothing was trampled.
        let arena = Arena::new();
        let mut rng = rand::thread_rng();
        let mut allocated: Vec<(*mut u8, usize)> = vec![];
        let mut total = 0usize;
        for i in 0..2000 {
            let size = if i % 33 == 0 {
                // Occasional oversized allocation taking the dedicated
                // block path.
                rng.gen_range(1..=BLOCK_SIZE * 2)
            } else {
                rng.gen_range(1..=64)
            };
            let ptr = if i % 2 == 0 {
                arena.allocate(size)
            } else {
                arena.allocate_aligned(size)
            };
            unsafe {
                for j in 0..size {
                    *ptr.add(j) = (i % 256) as u8;
                }
            }
            allocated.push((ptr, size));
            total += size;
            assert!(arena.memory_usage() >= total);
        }
        for (i, (ptr, size)) in allocated.iter().enumerate() {
            unsafe {
                for j in 0..*size {
                    assert_eq!(*ptr.add(j), (i % 256) as u8);
                }
            }
        }
        // Bookkeeping overhead stays modest.
        assert!(arena.memory_usage() <= total * 2 + BLOCK_SIZE * 2);
    }

    #[test]
    fn test_aligned_allocations() {
        let arena = Arena::new();
        // Misalign the bump pointer on purpose.
        let _ = arena.allocate(1);
        for size in [1, 3, 8, 61, 4096] {
            let ptr = arena.allocate_aligned(size);
            assert_eq!(ptr as usize % 8, 0, "size {}", size);
            let _ = arena.allocate(3);
        }
    }

    #[test]
    fn test_oversized_allocation_keeps_current_block() {
        let arena = Arena::new();
        let small_a = arena.allocate(16);
        // Bigger than a quarter block: served from a dedicated block.
        let _big = arena.allocate(BLOCK_SIZE);
        let small_b = arena.allocate(16);
        // The bump block kept serving; the two small chunks are adjacent.
        assert_eq!(unsafe { small_a.add(16) }, small_b);
    }

    #[test]
    fn test_memory_usage_counts_block_bookkeeping() {
        let arena = Arena::new();
        let _ = arena.allocate(1);
        assert_eq!(
            arena.memory_usage(),
            BLOCK_SIZE + std::mem::size_of::<*mut u8>()
        );
    }
}
