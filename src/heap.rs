//! Early boot heap.
//!
//! The `alloc` collections behind the registry and the ready queue need
//! a global allocator before anything else can come up. On bare metal
//! the boot path hands one contiguous region to [`init`] and allocation
//! advances a cursor through it; nothing is ever handed back, since the
//! kernel's collections live for the whole boot. The region must not
//! overlap the page pool arena. Host tests run on the std allocator and
//! never touch the static.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use spin::Mutex;

struct Region {
    next: usize,
    end: usize,
}

/// One-way allocator over a single boot-time memory region
pub struct EarlyHeap {
    region: Mutex<Region>,
}

impl EarlyHeap {
    /// A heap with no region; every grant fails until [`EarlyHeap::adopt`]
    pub const fn empty() -> EarlyHeap {
        EarlyHeap {
            region: Mutex::new(Region { next: 0, end: 0 }),
        }
    }

    /// Adopt `[start, start + size)` as the heap region.
    ///
    /// # Safety
    /// The region must be unused memory owned by the caller, disjoint
    /// from the page pool arena, and adopted at most once.
    pub unsafe fn adopt(&self, start: usize, size: usize) {
        let mut region = self.region.lock();
        region.next = start;
        region.end = start + size;
    }

    /// Bytes not yet granted
    pub fn remaining(&self) -> usize {
        let region = self.region.lock();
        region.end - region.next
    }

    fn grant(&self, layout: Layout) -> *mut u8 {
        let mut region = self.region.lock();
        // Layout alignment is always a power of two
        let base = match region.next.checked_add(layout.align() - 1) {
            Some(padded) => padded & !(layout.align() - 1),
            None => return ptr::null_mut(),
        };
        let top = match base.checked_add(layout.size()) {
            Some(top) => top,
            None => return ptr::null_mut(),
        };
        if top > region.end {
            return ptr::null_mut();
        }
        region.next = top;
        base as *mut u8
    }
}

unsafe impl GlobalAlloc for EarlyHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.grant(layout)
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
        // One-way heap; freed blocks are simply abandoned
    }
}

#[cfg(not(test))]
#[global_allocator]
static HEAP: EarlyHeap = EarlyHeap::empty();

/// Install the boot heap region.
///
/// `heap_start` and `heap_size` come from the boot loader's memory map
/// in a bare-metal build; call before [`crate::kernel::Kernel::new`].
/// No-op in tests, where the host allocator is already in place.
pub fn init(heap_start: usize, heap_size: usize) {
    #[cfg(not(test))]
    // SAFETY: the boot path owns the region it reports.
    unsafe {
        HEAP.adopt(heap_start, heap_size);
    }
    #[cfg(test)]
    let _ = (heap_start, heap_size);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_over(backing: &mut [u8]) -> EarlyHeap {
        let heap = EarlyHeap::empty();
        unsafe {
            heap.adopt(backing.as_mut_ptr() as usize, backing.len());
        }
        heap
    }

    #[test]
    fn test_empty_heap_grants_nothing() {
        let heap = EarlyHeap::empty();
        assert_eq!(heap.remaining(), 0);
        let layout = Layout::from_size_align(1, 1).unwrap();
        assert!(heap.grant(layout).is_null());
    }

    #[test]
    fn test_grants_are_aligned_and_disjoint() {
        let mut backing = [0u8; 256];
        let heap = heap_over(&mut backing);

        let a = heap.grant(Layout::from_size_align(5, 1).unwrap());
        let b = heap.grant(Layout::from_size_align(16, 16).unwrap());
        let c = heap.grant(Layout::from_size_align(8, 8).unwrap());
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert_eq!(b as usize % 16, 0);
        assert_eq!(c as usize % 8, 0);
        // The cursor only moves forward: 5 bytes, pad to 16, 16, 8
        assert!((a as usize) + 5 <= b as usize);
        assert!((b as usize) + 16 <= c as usize);
        assert_eq!(heap.remaining(), 256 - (c as usize + 8 - a as usize));
    }

    #[test]
    fn test_padding_is_consumed() {
        let mut backing = [0u8; 64];
        let heap = heap_over(&mut backing);

        heap.grant(Layout::from_size_align(1, 1).unwrap());
        let before = heap.remaining();
        let p = heap.grant(Layout::from_size_align(8, 32).unwrap());
        assert!(!p.is_null());
        // The alignment pad counts against the region too
        assert!(before - heap.remaining() >= 8);
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let mut backing = [0u8; 32];
        let heap = heap_over(&mut backing);
        let layout = Layout::from_size_align(16, 8).unwrap();

        assert!(!heap.grant(layout).is_null());
        assert!(!heap.grant(layout).is_null());
        let left = heap.remaining();
        assert!(heap.grant(layout).is_null());
        // A failed grant consumes nothing
        assert_eq!(heap.remaining(), left);
    }
}
