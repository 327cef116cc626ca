//! Physical page allocator.
//!
//! Physical memory is modeled as one page-aligned arena of 4 KiB
//! frames; a [`crate::addr::PhysAddr`] is a byte offset into that
//! arena. Thread stacks, page directories and page tables all come
//! from here a frame at a time. Frames are zeroed on allocation.

use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr;
use spin::Mutex;

use crate::addr::{PhysAddr, PGSIZE};

/// Page allocation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PallocError {
    /// No free frames remain
    OutOfPages,
}

struct FrameMap {
    /// Free frame indices, lowest on top
    free: Vec<usize>,
    /// Per-frame allocated flag, for double-free detection
    used: Vec<bool>,
}

/// Pool of physical page frames
pub struct PagePool {
    base: *mut u8,
    pages: usize,
    frames: Mutex<FrameMap>,
}

// The arena pointer is only dereferenced through frame handles the pool
// itself validates; the frame map is behind a lock.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Create a pool of `pages` zeroed frames.
    ///
    /// Panics if the backing arena cannot be allocated; there is no
    /// kernel without physical memory.
    pub fn new(pages: usize) -> Self {
        let base = if pages == 0 {
            ptr::null_mut()
        } else {
            let layout = match Layout::from_size_align(pages * PGSIZE, PGSIZE) {
                Ok(layout) => layout,
                Err(_) => panic!("page pool size overflow: {pages} pages"),
            };
            // SAFETY: layout is non-zero and page-aligned.
            let p = unsafe { alloc::alloc::alloc_zeroed(layout) };
            assert!(!p.is_null(), "cannot allocate {pages}-page pool");
            p
        };

        PagePool {
            base,
            pages,
            frames: Mutex::new(FrameMap {
                free: (0..pages).rev().collect(),
                used: vec![false; pages],
            }),
        }
    }

    /// Number of frames in the pool
    pub fn page_count(&self) -> usize {
        self.pages
    }

    /// Number of currently free frames
    pub fn free_count(&self) -> usize {
        self.frames.lock().free.len()
    }

    /// Allocate one zeroed frame
    pub fn get_page(&self) -> Result<PhysAddr, PallocError> {
        let idx = {
            let mut map = self.frames.lock();
            let idx = map.free.pop().ok_or(PallocError::OutOfPages)?;
            map.used[idx] = true;
            idx
        };
        let pa = PhysAddr(idx * PGSIZE);
        // SAFETY: idx came from the free list, so the frame is in the
        // arena and owned by this caller.
        unsafe {
            ptr::write_bytes(self.frame_ptr(pa), 0, PGSIZE);
        }
        Ok(pa)
    }

    /// Allocate one zeroed frame, panicking on exhaustion.
    ///
    /// For boot-time allocations, where failure means the machine
    /// cannot come up at all.
    pub fn get_page_assert(&self) -> PhysAddr {
        match self.get_page() {
            Ok(pa) => pa,
            Err(PallocError::OutOfPages) => panic!("out of physical pages during boot"),
        }
    }

    /// Return a frame to the pool.
    ///
    /// Panics on a misaligned, out-of-range or already-free frame.
    pub fn free_page(&self, pa: PhysAddr) {
        assert!(pa.is_frame_aligned(), "freeing misaligned frame {pa:?}");
        let idx = pa.0 / PGSIZE;
        let mut map = self.frames.lock();
        assert!(idx < self.pages, "freeing frame outside pool: {pa:?}");
        assert!(map.used[idx], "double free of frame {pa:?}");
        map.used[idx] = false;
        map.free.push(idx);
    }

    /// Host pointer to a byte of the arena.
    ///
    /// Panics if `pa` lies outside the pool.
    pub fn frame_ptr(&self, pa: PhysAddr) -> *mut u8 {
        assert!(pa.0 < self.pages * PGSIZE, "physical address {pa:?} outside pool");
        // SAFETY: offset just checked against the arena bounds.
        unsafe { self.base.add(pa.0) }
    }

    /// True if a host address falls inside the arena
    pub fn contains_ptr(&self, addr: usize) -> bool {
        self.pages != 0
            && addr >= self.base as usize
            && addr < self.base as usize + self.pages * PGSIZE
    }

    /// Physical address of a host pointer into the arena.
    ///
    /// Panics if the pointer is not inside the pool.
    pub fn phys_of_ptr(&self, p: *const u8) -> PhysAddr {
        assert!(self.contains_ptr(p as usize), "pointer {p:p} outside pool");
        PhysAddr(p as usize - self.base as usize)
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        if self.pages != 0 {
            // SAFETY: same layout as in new().
            unsafe {
                let layout = Layout::from_size_align_unchecked(self.pages * PGSIZE, PGSIZE);
                alloc::alloc::dealloc(self.base, layout);
            }
        }
    }
}
