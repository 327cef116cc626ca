//! Address arithmetic for the kernel's virtual/physical split.
//!
//! Kernel virtual memory is a fixed-offset alias of physical memory:
//! virtual = physical + [`KERNEL_BASE`]. The mapping is bijective over
//! installed RAM and never changes after boot, so translation in either
//! direction is plain arithmetic. Virtual addresses split into a
//! 10-bit page-directory index, a 10-bit page-table index and a 12-bit
//! page offset.

/// Bits of a page offset
pub const PGBITS: usize = 12;
/// Page size in bytes
pub const PGSIZE: usize = 1 << PGBITS;
/// Mask covering the offset within a page
pub const PGMASK: usize = PGSIZE - 1;

/// Index bits per paging level
pub const PTBITS: usize = 10;
/// Entries in a page directory or page table
pub const PT_ENTRIES: usize = 1 << PTBITS;
/// Bytes of virtual space covered by one directory entry (4 MiB)
pub const PT_SPAN: usize = 1 << (PTBITS + PGBITS);

/// Base of the kernel virtual mapping of physical memory
pub const KERNEL_BASE: usize = 0xC000_0000;

/// Physical address newtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    /// Round down to the containing page frame
    pub const fn frame_base(self) -> PhysAddr {
        PhysAddr(self.0 & !PGMASK)
    }

    /// Offset within the page frame
    pub const fn frame_offset(self) -> usize {
        self.0 & PGMASK
    }

    /// True if this address is page-aligned
    pub const fn is_frame_aligned(self) -> bool {
        self.0 & PGMASK == 0
    }
}

/// Kernel virtual address for a physical address
pub const fn ptov(pa: PhysAddr) -> usize {
    pa.0 + KERNEL_BASE
}

/// Physical address for a kernel virtual address.
///
/// Panics if `va` is below the kernel mapping; only kernel virtual
/// addresses have a physical alias.
pub fn vtop(va: usize) -> PhysAddr {
    assert!(va >= KERNEL_BASE, "vtop on non-kernel address {va:#x}");
    PhysAddr(va - KERNEL_BASE)
}

/// Page-directory index of a virtual address
pub const fn pd_no(va: usize) -> usize {
    (va >> (PGBITS + PTBITS)) & (PT_ENTRIES - 1)
}

/// Page-table index of a virtual address
pub const fn pt_no(va: usize) -> usize {
    (va >> PGBITS) & (PT_ENTRIES - 1)
}

/// Offset of a virtual address within its page
pub const fn pg_ofs(va: usize) -> usize {
    va & PGMASK
}

/// Round a virtual address down to a page boundary
pub const fn pg_round_down(va: usize) -> usize {
    va & !PGMASK
}

/// Round a virtual address up to a page boundary
pub const fn pg_round_up(va: usize) -> usize {
    (va + PGSIZE - 1) & !PGMASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptov_vtop_roundtrip() {
        let pa = PhysAddr(0x1234 * PGSIZE + 0x10);
        assert_eq!(vtop(ptov(pa)), pa);
        assert_eq!(ptov(PhysAddr(0)), KERNEL_BASE);
    }

    #[test]
    #[should_panic]
    fn test_vtop_below_kernel_base() {
        vtop(KERNEL_BASE - 1);
    }

    #[test]
    fn test_index_split() {
        // KERNEL_BASE = 0xC0000000: directory index 0x300, table index 0
        assert_eq!(pd_no(KERNEL_BASE), 0x300);
        assert_eq!(pt_no(KERNEL_BASE), 0);
        assert_eq!(pg_ofs(KERNEL_BASE), 0);

        let va = KERNEL_BASE + 5 * PT_SPAN + 7 * PGSIZE + 9;
        assert_eq!(pd_no(va), 0x300 + 5);
        assert_eq!(pt_no(va), 7);
        assert_eq!(pg_ofs(va), 9);
    }

    #[test]
    fn test_rounding() {
        assert_eq!(pg_round_down(0x1fff), 0x1000);
        assert_eq!(pg_round_up(0x1001), 0x2000);
        assert_eq!(pg_round_up(0x1000), 0x1000);
    }

    #[test]
    fn test_frame_alignment() {
        let pa = PhysAddr(3 * PGSIZE + 5);
        assert_eq!(pa.frame_base(), PhysAddr(3 * PGSIZE));
        assert_eq!(pa.frame_offset(), 5);
        assert!(!pa.is_frame_aligned());
        assert!(pa.frame_base().is_frame_aligned());
    }
}
