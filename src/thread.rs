//! Thread control blocks.
//!
//! Each thread owns exactly one 4 KiB page: the TCB sits at the low end
//! and the thread's kernel stack grows down from the top of the page
//! toward it. A guard magic word at the end of the TCB is the first
//! thing a stack overflow destroys, so every TCB access verifies it.
//! Masking any stack address to its page base therefore recovers the
//! running thread's TCB without any per-CPU state.

use alloc::collections::BTreeMap;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::addr::{PGMASK, PGSIZE};
use crate::fixed_point::Fixed;
use crate::kernel::Kernel;

// ============================================================================
// Priority and Niceness Ranges
// ============================================================================

/// Thread priority levels (higher is better)
pub mod priority {
    /// Minimum priority
    pub const MIN: i32 = 0;
    /// Default priority
    pub const DEFAULT: i32 = 31;
    /// Maximum priority
    pub const MAX: i32 = 63;
}

/// Niceness range for the multilevel-feedback policy
pub mod nice {
    /// Most generous
    pub const MIN: i32 = -20;
    /// Default niceness
    pub const DEFAULT: i32 = 0;
    /// Most selfish
    pub const MAX: i32 = 20;
}

/// Guard word written at the end of every TCB
pub const THREAD_MAGIC: u32 = 0x5443_4221;

/// Maximum thread name length in bytes
pub const NAME_MAX: usize = 16;

// ============================================================================
// Thread Identity and State
// ============================================================================

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Thread lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadStatus {
    /// Executing on the processor
    Running = 0,
    /// Runnable, sitting in the ready queue
    Ready = 1,
    /// Off the processor until explicitly woken
    Blocked = 2,
    /// Exited; page reclaimed by the next thread to run
    Dying = 3,
}

impl ThreadStatus {
    fn from_raw(raw: u32) -> ThreadStatus {
        match raw {
            0 => ThreadStatus::Running,
            1 => ThreadStatus::Ready,
            2 => ThreadStatus::Blocked,
            3 => ThreadStatus::Dying,
            other => panic!("corrupt thread status {other}"),
        }
    }
}

/// Which queue, if any, currently links a thread.
///
/// A thread is on the ready queue or on one wait list, never both; the
/// discriminant makes the exclusion checkable at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Linkage {
    /// On no queue
    Unlinked = 0,
    /// Linked into the scheduler's ready queue
    ReadyQueue = 1,
    /// Linked into some wait list
    WaitList = 2,
}

impl Linkage {
    fn from_raw(raw: u32) -> Linkage {
        match raw {
            0 => Linkage::Unlinked,
            1 => Linkage::ReadyQueue,
            2 => Linkage::WaitList,
            other => panic!("corrupt thread linkage {other}"),
        }
    }
}

// ============================================================================
// Thread Control Block
// ============================================================================

/// A thread control block, embedded at the base of its own stack page.
#[repr(C)]
pub struct Tcb {
    /// Thread identifier
    pub id: ThreadId,
    status: AtomicU32,
    /// Saved stack pointer; meaningful only while not running.
    /// The context switch stores through this slot directly.
    pub(crate) sp: AtomicUsize,
    priority: AtomicI32,
    nice: AtomicI32,
    recent_cpu: AtomicI32,
    linkage: AtomicU32,
    kernel: *const Kernel,
    name: heapless::String<NAME_MAX>,
    /// Guard word; must stay the last field so stack growth hits it first
    magic: u32,
}

impl Tcb {
    /// Stack bytes available in a thread page above the TCB
    pub const fn stack_capacity() -> usize {
        PGSIZE - core::mem::size_of::<Tcb>()
    }

    /// Write a fresh TCB at the base of a thread page.
    ///
    /// # Safety
    /// `page` must point at the base of a zeroed, page-aligned frame
    /// owned by the caller.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn init_at(
        page: *mut u8,
        id: ThreadId,
        name: &str,
        pri: i32,
        nice: i32,
        recent_cpu: Fixed,
        kernel: *const Kernel,
        status: ThreadStatus,
    ) -> TcbRef {
        assert_eq!(page as usize & PGMASK, 0, "thread page not aligned");
        let tcb = page as *mut Tcb;
        tcb.write(Tcb {
            id,
            status: AtomicU32::new(status as u32),
            sp: AtomicUsize::new(0),
            priority: AtomicI32::new(pri.clamp(priority::MIN, priority::MAX)),
            nice: AtomicI32::new(nice.clamp(self::nice::MIN, self::nice::MAX)),
            recent_cpu: AtomicI32::new(recent_cpu.raw()),
            linkage: AtomicU32::new(Linkage::Unlinked as u32),
            kernel,
            name: bounded_name(name),
            magic: THREAD_MAGIC,
        });
        TcbRef::new(NonNull::new_unchecked(tcb))
    }

    /// Recover the TCB owning a stack address.
    ///
    /// Masks the address to its page base and verifies the guard word
    /// before handing the reference out.
    ///
    /// # Safety
    /// `sp` must point into a live thread's stack page.
    pub(crate) unsafe fn from_stack_pointer<'a>(sp: usize) -> &'a Tcb {
        let tcb = &*((sp & !PGMASK) as *const Tcb);
        tcb.check_guard();
        tcb
    }

    /// Panic if the stack has grown into the TCB
    pub fn check_guard(&self) {
        if self.magic != THREAD_MAGIC {
            panic!("thread {:?}: stack overflow corrupted its control block", self.id);
        }
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning kernel context
    pub(crate) fn kernel(&self) -> *const Kernel {
        self.kernel
    }

    /// Current lifecycle state
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    /// Current priority
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, pri: i32) {
        self.priority
            .store(pri.clamp(priority::MIN, priority::MAX), Ordering::Release);
    }

    /// Current niceness
    pub fn nice(&self) -> i32 {
        self.nice.load(Ordering::Acquire)
    }

    pub(crate) fn set_nice(&self, nice: i32) {
        self.nice
            .store(nice.clamp(self::nice::MIN, self::nice::MAX), Ordering::Release);
    }

    /// Decayed CPU usage
    pub(crate) fn recent_cpu(&self) -> Fixed {
        Fixed::from_raw(self.recent_cpu.load(Ordering::Acquire))
    }

    pub(crate) fn set_recent_cpu(&self, value: Fixed) {
        self.recent_cpu.store(value.raw(), Ordering::Release);
    }

    /// Current queue membership
    pub fn linkage(&self) -> Linkage {
        Linkage::from_raw(self.linkage.load(Ordering::Acquire))
    }

    /// Move between queue memberships, verifying the expected source.
    ///
    /// Panics if the thread is not where the caller believes it is;
    /// that means two queues think they own it.
    pub(crate) fn relink(&self, from: Linkage, to: Linkage) {
        if let Err(actual) = self.linkage.compare_exchange(
            from as u32,
            to as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "thread {:?}: linked {:?} but expected {:?}",
                self.id,
                Linkage::from_raw(actual),
                from
            );
        }
    }
}

fn bounded_name(name: &str) -> heapless::String<NAME_MAX> {
    let mut bounded = heapless::String::new();
    for c in name.chars() {
        if bounded.push(c).is_err() {
            break;
        }
    }
    bounded
}

// ============================================================================
// TCB Handles
// ============================================================================

/// Shared handle to a TCB living in a pool frame.
///
/// All TCB fields mutated after creation are atomics, so shared access
/// is sound; exclusive access never exists after `init_at`.
#[derive(Clone, Copy)]
pub(crate) struct TcbRef(NonNull<Tcb>);

// Handles cross the scheduler lock; the single-processor discipline
// (interrupts off around queue mutation) serializes all access.
unsafe impl Send for TcbRef {}
unsafe impl Sync for TcbRef {}

impl TcbRef {
    pub(crate) fn new(ptr: NonNull<Tcb>) -> TcbRef {
        TcbRef(ptr)
    }

    pub(crate) fn get(&self) -> &Tcb {
        // SAFETY: the handle is only created over an initialized TCB
        // and dropped from the registry before its page is freed.
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn as_ptr(&self) -> *mut Tcb {
        self.0.as_ptr()
    }
}

impl PartialEq for TcbRef {
    fn eq(&self, other: &TcbRef) -> bool {
        self.0 == other.0
    }
}

impl Eq for TcbRef {}

// ============================================================================
// Registry
// ============================================================================

/// All live threads, by identifier
pub(crate) struct Registry {
    threads: BTreeMap<ThreadId, TcbRef>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            threads: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, tcb: TcbRef) {
        let prev = self.threads.insert(tcb.get().id, tcb);
        assert!(prev.is_none(), "duplicate thread id {:?}", tcb.get().id);
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<TcbRef> {
        self.threads.remove(&id)
    }

    pub(crate) fn get(&self, id: ThreadId) -> Option<TcbRef> {
        self.threads.get(&id).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = TcbRef> + '_ {
        self.threads.values().copied()
    }
}

// ============================================================================
// Thread Info (for debugging/inspection)
// ============================================================================

/// Snapshot of one thread for diagnostics
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    /// Thread identifier
    pub id: ThreadId,
    /// Thread name
    pub name: heapless::String<NAME_MAX>,
    /// Lifecycle state at snapshot time
    pub status: ThreadStatus,
    /// Priority at snapshot time
    pub priority: i32,
}

impl From<&Tcb> for ThreadInfo {
    fn from(tcb: &Tcb) -> Self {
        tcb.check_guard();
        ThreadInfo {
            id: tcb.id,
            name: tcb.name.clone(),
            status: tcb.status(),
            priority: tcb.priority(),
        }
    }
}
