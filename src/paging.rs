//! Kernel page table bootstrap.
//!
//! Builds the two-level page structure that maps physical memory at
//! [`crate::addr::KERNEL_BASE`]: a 1024-entry page directory whose
//! entries each point at a 1024-entry page table, tables allocated
//! lazily as the identity-plus-offset sweep first touches them. Kernel
//! text is mapped read-only, everything else read-write. Built once at
//! boot and never modified afterwards.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::addr::{pd_no, pg_ofs, pt_no, ptov, PhysAddr, KERNEL_BASE, PGSIZE};
use crate::palloc::PagePool;

/// Flags in the low bits of a directory or table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags(u32);

impl EntryFlags {
    /// Entry refers to a frame
    pub const PRESENT: EntryFlags = EntryFlags(1 << 0);
    /// Mapped page may be written
    pub const WRITABLE: EntryFlags = EntryFlags(1 << 1);

    /// Check if these flags contain the given flags
    pub fn contains(&self, other: EntryFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl core::ops::BitOr for EntryFlags {
    type Output = EntryFlags;
    fn bitor(self, other: EntryFlags) -> EntryFlags {
        EntryFlags(self.0 | other.0)
    }
}

/// Frame address bits of an entry
const ENTRY_ADDR_MASK: u32 = 0xFFFF_F000;

/// Build a directory entry pointing at a page table
fn pde_create(pt: PhysAddr) -> u32 {
    entry_create(pt, EntryFlags::PRESENT | EntryFlags::WRITABLE)
}

/// Build a table entry mapping a kernel frame
fn pte_create_kernel(frame: PhysAddr, writable: bool) -> u32 {
    let flags = if writable {
        EntryFlags::PRESENT | EntryFlags::WRITABLE
    } else {
        EntryFlags::PRESENT
    };
    entry_create(frame, flags)
}

fn entry_create(frame: PhysAddr, flags: EntryFlags) -> u32 {
    assert!(frame.is_frame_aligned(), "entry frame not aligned: {frame:?}");
    assert!(frame.0 < (1 << 32), "frame beyond 32-bit entry: {frame:?}");
    frame.0 as u32 | flags.bits()
}

/// Extent of the kernel's code in virtual memory.
///
/// Stands in for the linker-provided start/end-of-text symbols; pages
/// inside the range are mapped read-only.
#[derive(Debug, Clone, Copy)]
pub struct KernelLayout {
    /// First virtual address of kernel text
    pub text_start: usize,
    /// One past the last virtual address of kernel text
    pub text_end: usize,
}

impl KernelLayout {
    /// True if `va` falls inside kernel text
    pub fn in_text(&self, va: usize) -> bool {
        va >= self.text_start && va < self.text_end
    }
}

impl Default for KernelLayout {
    fn default() -> Self {
        // Empty range: no read-only pages
        KernelLayout {
            text_start: KERNEL_BASE,
            text_end: KERNEL_BASE,
        }
    }
}

/// The processor's page-directory base register.
///
/// On a real CPU this is CR3; loading it is what makes a directory the
/// active translation root. Modeled as a plain register cell so tests
/// can observe activation.
pub struct PdbRegister(AtomicUsize);

const PDB_UNSET: usize = usize::MAX;

impl PdbRegister {
    /// Register with no directory loaded
    pub const fn new() -> Self {
        PdbRegister(AtomicUsize::new(PDB_UNSET))
    }

    /// Physical base of the active directory, if any
    pub fn load(&self) -> Option<PhysAddr> {
        match self.0.load(Ordering::Acquire) {
            PDB_UNSET => None,
            base => Some(PhysAddr(base)),
        }
    }

    fn store(&self, base: PhysAddr) {
        self.0.store(base.0, Ordering::Release);
    }
}

impl Default for PdbRegister {
    fn default() -> Self {
        Self::new()
    }
}

/// A two-level page directory living in pool frames
pub struct PageDirectory<'p> {
    pool: &'p PagePool,
    base: PhysAddr,
}

impl<'p> PageDirectory<'p> {
    /// View an existing directory rooted at `base`
    pub fn from_base(pool: &'p PagePool, base: PhysAddr) -> Self {
        assert!(base.is_frame_aligned(), "directory base not aligned: {base:?}");
        PageDirectory { pool, base }
    }

    /// Physical base of the directory page
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Load this directory into the page-directory base register
    pub fn activate(&self, reg: &PdbRegister) {
        reg.store(self.base);
        log::debug!("page directory {:#x} activated", self.base.0);
    }

    fn read_entry(&self, table: PhysAddr, index: usize) -> u32 {
        // Frames are page-aligned, so u32 slots are aligned too.
        unsafe { *(self.pool.frame_ptr(table) as *const u32).add(index) }
    }

    fn write_entry(&self, table: PhysAddr, index: usize, entry: u32) {
        unsafe {
            *(self.pool.frame_ptr(table) as *mut u32).add(index) = entry;
        }
    }

    fn lookup_pte(&self, va: usize) -> Option<u32> {
        let pde = self.read_entry(self.base, pd_no(va));
        if pde & EntryFlags::PRESENT.bits() == 0 {
            return None;
        }
        let table = PhysAddr((pde & ENTRY_ADDR_MASK) as usize);
        let pte = self.read_entry(table, pt_no(va));
        if pte & EntryFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(pte)
    }

    /// Translate a virtual address by walking the installed structure
    pub fn translate(&self, va: usize) -> Option<PhysAddr> {
        let pte = self.lookup_pte(va)?;
        Some(PhysAddr((pte & ENTRY_ADDR_MASK) as usize + pg_ofs(va)))
    }

    /// Whether the page mapping `va` may be written, if mapped at all
    pub fn is_writable(&self, va: usize) -> Option<bool> {
        let pte = self.lookup_pte(va)?;
        Some(pte & EntryFlags::WRITABLE.bits() != 0)
    }
}

/// Build the kernel page directory mapping all of physical memory.
///
/// Sweeps frames `0..total_ram_pages`, installing a mapping for each at
/// its kernel virtual alias and allocating page tables on first touch.
/// Runs once at boot; allocation failure here is fatal.
pub fn build_kernel_page_directory<'p>(
    pool: &'p PagePool,
    total_ram_pages: usize,
    layout: &KernelLayout,
) -> PageDirectory<'p> {
    assert!(
        total_ram_pages <= pool.page_count(),
        "asked to map {total_ram_pages} pages but pool holds {}",
        pool.page_count()
    );

    let dir = PageDirectory::from_base(pool, pool.get_page_assert());

    for page in 0..total_ram_pages {
        let pa = PhysAddr(page * PGSIZE);
        let va = ptov(pa);

        let pde = dir.read_entry(dir.base, pd_no(va));
        let table = if pde & EntryFlags::PRESENT.bits() == 0 {
            let table = pool.get_page_assert();
            dir.write_entry(dir.base, pd_no(va), pde_create(table));
            table
        } else {
            PhysAddr((pde & ENTRY_ADDR_MASK) as usize)
        };

        let writable = !layout.in_text(va);
        dir.write_entry(table, pt_no(va), pte_create_kernel(pa, writable));
    }

    log::info!(
        "kernel page directory at {:#x}: {} pages mapped",
        dir.base.0,
        total_ram_pages
    );
    dir
}
