//! Size-class slab allocator over a contiguous heap window.
//!
//! Requests are rounded up to one of eight size classes. Each class keeps a
//! free list threaded through the freed blocks themselves; fresh blocks are
//! cut from a bump pointer. Nothing is ever returned to the bump region and
//! classes never share blocks, trading memory efficiency for predictable
//! latency.

use core::ptr;

pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Index of the smallest class that fits `size`, if any.
pub fn class_for(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|c| *c >= size)
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub class: usize,
    pub free_blocks: usize,
    pub allocations: u64,
    pub frees: u64,
}

struct Cache {
    /// Head of the free list; the first `usize` of each free block stores the
    /// address of the next one.
    free_head: *mut u8,
    free_blocks: usize,
    allocations: u64,
    frees: u64,
}

impl Cache {
    const fn new() -> Self {
        Self {
            free_head: ptr::null_mut(),
            free_blocks: 0,
            allocations: 0,
            frees: 0,
        }
    }
}

pub struct SlabAllocator {
    caches: [Cache; SIZE_CLASSES.len()],
    heap_base: usize,
    heap_ptr: usize,
    heap_end: usize,
}

impl SlabAllocator {
    pub const fn empty() -> Self {
        Self {
            caches: [
                Cache::new(),
                Cache::new(),
                Cache::new(),
                Cache::new(),
                Cache::new(),
                Cache::new(),
                Cache::new(),
                Cache::new(),
            ],
            heap_base: 0,
            heap_ptr: 0,
            heap_end: 0,
        }
    }

    /// Adopt `[heap_base, heap_end)` as the bump window.
    ///
    /// # Safety
    /// The window must be writable, unused by anything else, and outlive the
    /// allocator.
    pub unsafe fn new(heap_base: usize, heap_end: usize) -> Self {
        debug_assert!(heap_base <= heap_end);
        let mut slab = Self::empty();
        slab.heap_base = heap_base;
        slab.heap_ptr = heap_base;
        slab.heap_end = heap_end;
        slab
    }

    pub fn heap_used(&self) -> usize {
        self.heap_ptr - self.heap_base
    }

    /// Serve `size` bytes, reusing a freed block of the right class when one
    /// exists. Returns null when `size` exceeds the largest class or the bump
    /// window is exhausted.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let index = match class_for(size) {
            Some(index) => index,
            None => return ptr::null_mut(),
        };
        let class = SIZE_CLASSES[index];
        let cache = &mut self.caches[index];

        if !cache.free_head.is_null() {
            let block = cache.free_head;
            cache.free_head = unsafe { (block as *const usize).read() as *mut u8 };
            cache.free_blocks -= 1;
            cache.allocations += 1;
            return block;
        }

        // Fresh cut. Blocks are naturally aligned to their class so the
        // global-allocator adapter can honour any layout whose align fits
        // the class.
        let aligned = (self.heap_ptr + class - 1) & !(class - 1);
        if aligned + class > self.heap_end {
            return ptr::null_mut();
        }
        self.heap_ptr = aligned + class;
        cache.allocations += 1;
        aligned as *mut u8
    }

    /// Return a block to its class. `size` must be the size the block was
    /// requested with; freeing into a different class is undefined.
    ///
    /// # Safety
    /// `block` must come from `alloc(size)` on this allocator and must not be
    /// used again until re-allocated.
    pub unsafe fn free(&mut self, block: *mut u8, size: usize) {
        let index = match class_for(size) {
            Some(index) => index,
            None => return,
        };
        let cache = &mut self.caches[index];
        (block as *mut usize).write(cache.free_head as usize);
        cache.free_head = block;
        cache.free_blocks += 1;
        cache.frees += 1;
    }

    pub fn stats(&self) -> [CacheStats; SIZE_CLASSES.len()] {
        core::array::from_fn(|i| CacheStats {
            class: SIZE_CLASSES[i],
            free_blocks: self.caches[i].free_blocks,
            allocations: self.caches[i].allocations,
            frees: self.caches[i].frees,
        })
    }
}

mod global {
    use super::SlabAllocator;
    use spin::Mutex;

    pub struct KernelAllocator {
        slab: Mutex<SlabAllocator>,
    }

    impl KernelAllocator {
        pub const fn new() -> Self {
            Self {
                slab: Mutex::new(SlabAllocator::empty()),
            }
        }

        pub fn slab(&self) -> &Mutex<SlabAllocator> {
            &self.slab
        }
    }

    unsafe impl alloc::alloc::GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: alloc::alloc::Layout) -> *mut u8 {
            let size = layout.size().max(layout.align());
            self.slab.lock().alloc(size)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: alloc::alloc::Layout) {
            let size = layout.size().max(layout.align());
            self.slab.lock().free(ptr, size)
        }
    }
}

pub use global::KernelAllocator;

#[cfg(target_arch = "x86")]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator::new();

/// Point the global allocator at the loader-provided heap window.
#[cfg(target_arch = "x86")]
pub fn initialize(heap_base: usize, heap_end: usize) {
    *ALLOCATOR.slab().lock() = unsafe { SlabAllocator::new(heap_base, heap_end) };
    log::info!("heap: {} KiB", (heap_end - heap_base) / 1024);
}

#[cfg(not(target_arch = "x86"))]
pub fn initialize(_heap_base: usize, _heap_end: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(bytes: usize) -> (SlabAllocator, Vec<u8>) {
        let mut backing = vec![0u8; bytes + 2048];
        let base = backing.as_mut_ptr() as usize;
        // Start class-aligned so exhaustion tests are exact.
        let base = (base + 2047) & !2047;
        let slab = unsafe { SlabAllocator::new(base, base + bytes) };
        (slab, backing)
    }

    #[test]
    fn rounds_up_to_the_smallest_class() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(16), Some(0));
        assert_eq!(class_for(17), Some(1));
        assert_eq!(class_for(2048), Some(7));
        assert_eq!(class_for(2049), None);
    }

    #[test]
    fn fresh_blocks_come_from_the_bump_region() {
        let (mut slab, _backing) = window(4096);
        let a = slab.alloc(16);
        let b = slab.alloc(16);
        assert!(!a.is_null() && !b.is_null());
        assert_eq!(b as usize - a as usize, 16);
        assert_eq!(slab.heap_used(), 32);
    }

    #[test]
    fn freed_blocks_are_reused_lifo() {
        let (mut slab, _backing) = window(4096);
        let a = slab.alloc(64);
        let b = slab.alloc(64);
        unsafe {
            slab.free(a, 64);
            slab.free(b, 64);
        }
        // b was freed last, so it comes back first; the bump pointer is
        // untouched.
        let used = slab.heap_used();
        assert_eq!(slab.alloc(64), b);
        assert_eq!(slab.alloc(64), a);
        assert_eq!(slab.heap_used(), used);
    }

    #[test]
    fn classes_do_not_share_free_lists() {
        let (mut slab, _backing) = window(4096);
        let a = slab.alloc(16);
        unsafe { slab.free(a, 16) };
        let b = slab.alloc(32);
        assert_ne!(a, b);
        assert_eq!(slab.alloc(16), a);
    }

    #[test]
    fn oversized_requests_fail() {
        let (mut slab, _backing) = window(4096);
        assert!(slab.alloc(4096).is_null());
        assert!(slab.alloc(2049).is_null());
        assert!(!slab.alloc(2048).is_null());
    }

    #[test]
    fn exhaustion_returns_null_but_reuse_still_works() {
        let (mut slab, _backing) = window(2048);
        let a = slab.alloc(2048);
        assert!(!a.is_null());
        assert!(slab.alloc(16).is_null());
        unsafe { slab.free(a, 2048) };
        assert_eq!(slab.alloc(2048), a);
    }

    #[test]
    fn counters_track_traffic() {
        let (mut slab, _backing) = window(4096);
        let a = slab.alloc(100); // class 128
        unsafe { slab.free(a, 100) };
        let _ = slab.alloc(128);
        let stats = slab.stats();
        let c128 = stats.iter().find(|s| s.class == 128).unwrap();
        assert_eq!(c128.allocations, 2);
        assert_eq!(c128.frees, 1);
        assert_eq!(c128.free_blocks, 0);
    }

    #[test]
    fn alignment_follows_the_class() {
        let (mut slab, _backing) = window(8192);
        let _ = slab.alloc(16);
        let big = slab.alloc(2048);
        assert_eq!(big as usize % 2048, 0);
    }
}
