//! Context switch engine.
//!
//! [`switch_threads`] is the only place execution moves between
//! threads. It saves the callee-saved register set on the outgoing
//! thread's own stack, parks the stack pointer in its TCB, adopts the
//! incoming thread's stack, and returns *on the incoming stack* with
//! the outgoing thread as its value. A brand-new thread's stack is
//! prepared so that its first switch-in "returns" into a startup
//! trampoline, which completes the hand-off and then runs the thread
//! function.
//!
//! Callers must have interrupts disabled and must not hold any
//! scheduler lock across the switch.

use core::ffi::c_void;
use core::mem::offset_of;

use crate::addr::PGSIZE;
use crate::thread::Tcb;

/// Entry point of a kernel thread
pub type ThreadFunc = extern "C" fn(*mut c_void);

/// Byte offset of the saved stack pointer slot inside the TCB
const SP_OFFSET: usize = offset_of!(Tcb, sp);

// ============================================================================
// Switch Primitive
// ============================================================================

/// Switch from `cur` to `next`, returning (in `next`'s context) the
/// thread the processor switched away from.
///
/// # Safety
/// Both TCBs must be live, `cur` must be the thread executing this
/// call, `next`'s saved stack pointer must be valid, and interrupts
/// must be disabled.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_threads(cur: *mut Tcb, next: *mut Tcb) -> *mut Tcb {
    // System V x86_64: rdi = cur, rsi = next, return value in rax.
    core::arch::naked_asm!(
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi + {sp_off}], rsp",
        "mov rsp, [rsi + {sp_off}]",
        "mov rax, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
        sp_off = const SP_OFFSET,
    )
}

/// Switch from `cur` to `next` - aarch64 variant.
///
/// # Safety
/// Same contract as the x86_64 variant.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch_threads(cur: *mut Tcb, next: *mut Tcb) -> *mut Tcb {
    // AAPCS64: x0 = cur, x1 = next, return value in x0. x0 carries cur
    // untouched across the restore, so it is already the return value.
    core::arch::naked_asm!(
        "sub sp, sp, #96",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "mov x9, sp",
        "str x9, [x0, #{sp_off}]",
        "ldr x9, [x1, #{sp_off}]",
        "mov sp, x9",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "add sp, sp, #96",
        "ret",
        sp_off = const SP_OFFSET,
    )
}

/// Stub for architectures without a switch implementation
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) unsafe extern "C" fn switch_threads(_cur: *mut Tcb, _next: *mut Tcb) -> *mut Tcb {
    unimplemented!("context switch not implemented for this architecture")
}

// ============================================================================
// Startup Trampoline
// ============================================================================

/// First code a new thread runs.
///
/// The initial frame parks the entry function and its argument in
/// callee-saved slots and points the return address here. The hand-off
/// from the previous thread is completed first, then the thread body
/// runs; a thread function that returns falls through into thread exit.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn thread_startup() -> ! {
    core::arch::naked_asm!(
        "mov rdi, rax",
        "call {handoff}",
        "mov rdi, r13",
        "call r12",
        "call {exit}",
        "ud2",
        handoff = sym crate::kernel::startup_handoff,
        exit = sym crate::kernel::startup_exit,
    )
}

/// First code a new thread runs - aarch64 variant
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn thread_startup() -> ! {
    // x0 already holds the previous thread on arrival
    core::arch::naked_asm!(
        "bl {handoff}",
        "mov x0, x20",
        "blr x19",
        "bl {exit}",
        "brk #0",
        handoff = sym crate::kernel::startup_handoff,
        exit = sym crate::kernel::startup_exit,
    )
}

// ============================================================================
// Initial Frames
// ============================================================================

/// Lay out the initial switch frame on a fresh thread page.
///
/// Returns the stack pointer value to record in the TCB: a frame that
/// the restore half of [`switch_threads`] consumes, leaving execution
/// at [`thread_startup`] with `entry` and `aux` in the registers the
/// trampoline expects.
///
/// # Safety
/// `page` must be the base of the thread's zeroed, page-aligned frame.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn prepare_initial_stack(
    page: *mut u8,
    entry: ThreadFunc,
    aux: *mut c_void,
) -> usize {
    let top = page.add(PGSIZE);
    // Frame, ascending: r15 r14 r13 r12 rbp rbx return-address
    let frame = top.sub(7 * 8) as *mut usize;
    frame.add(2).write(aux as usize); // restored into r13
    frame.add(3).write(entry as usize); // restored into r12
    frame.add(6).write(thread_startup as usize);
    frame as usize
}

/// Lay out the initial switch frame - aarch64 variant.
///
/// # Safety
/// Same contract as the x86_64 variant.
#[cfg(target_arch = "aarch64")]
pub(crate) unsafe fn prepare_initial_stack(
    page: *mut u8,
    entry: ThreadFunc,
    aux: *mut c_void,
) -> usize {
    let top = page.add(PGSIZE);
    // Frame, ascending: x19 x20 x21..x28 x29 x30
    let frame = top.sub(12 * 8) as *mut usize;
    frame.add(0).write(entry as usize); // restored into x19
    frame.add(1).write(aux as usize); // restored into x20
    frame.add(11).write(thread_startup as usize); // restored into x30
    frame as usize
}

/// Stub for architectures without a switch implementation
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) unsafe fn prepare_initial_stack(
    _page: *mut u8,
    _entry: ThreadFunc,
    _aux: *mut c_void,
) -> usize {
    unimplemented!("context switch not implemented for this architecture")
}

// ============================================================================
// Stack Pointer Access
// ============================================================================

/// The live stack pointer of the calling context
#[inline(always)]
pub(crate) fn current_stack_pointer() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        let sp: usize;
        unsafe {
            core::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
        }
        sp
    }
    #[cfg(target_arch = "aarch64")]
    {
        let sp: usize;
        unsafe {
            core::arch::asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
        }
        sp
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sp_slot_is_pointer_sized_and_reachable() {
        // The asm addresses the slot with a small immediate offset
        assert_eq!(SP_OFFSET % core::mem::size_of::<usize>(), 0);
        assert!(SP_OFFSET < 256);
        assert!(SP_OFFSET + core::mem::size_of::<usize>() <= core::mem::size_of::<Tcb>());
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_initial_frame_alignment() {
        use crate::palloc::PagePool;

        extern "C" fn nop(_aux: *mut c_void) {}

        let pool = PagePool::new(1);
        let pa = pool.get_page().unwrap();
        let base = pool.frame_ptr(pa);
        let sp = unsafe { prepare_initial_stack(base, nop, core::ptr::null_mut()) };

        // Frame sits at the top of the page, below the page end
        assert!(sp > base as usize);
        assert!(sp < base as usize + PGSIZE);
        // A saved frame always leaves sp with the ABI's resume alignment
        #[cfg(target_arch = "x86_64")]
        assert_eq!(sp % 16, 8);
        #[cfg(target_arch = "aarch64")]
        assert_eq!(sp % 16, 0);
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_current_stack_pointer_tracks_locals() {
        let marker = 0u8;
        let sp = current_stack_pointer();
        let local = &marker as *const u8 as usize;
        // The live sp and a stack local sit within one page of each other
        assert!(local.abs_diff(sp) < PGSIZE);
    }
}
