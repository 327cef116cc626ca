//! Blocking synchronization primitives.
//!
//! The base primitive is the [`WaitList`]: an ordered list of blocked
//! threads that some other thread wakes through the kernel's wait/wake
//! operations. [`Semaphore`] and [`Lock`] are built directly on it.
//! The blocking discipline (disable interrupts, link onto the list,
//! block, reschedule) lives in [`crate::kernel::Kernel::wait_on`] and
//! its wake counterparts; these types only carry the state.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::kernel::Kernel;
use crate::thread::ThreadId;

// ============================================================================
// Wait List
// ============================================================================

/// An ordered list of threads blocked on one condition
pub struct WaitList {
    pub(crate) waiters: Mutex<VecDeque<ThreadId>>,
}

impl WaitList {
    /// Create an empty wait list
    pub const fn new() -> WaitList {
        WaitList {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of threads currently blocked here
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// True if no thread is blocked here
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Semaphore
// ============================================================================

/// A counting semaphore
pub struct Semaphore {
    value: AtomicU32,
    waiters: WaitList,
}

impl Semaphore {
    /// Create a semaphore with an initial count
    pub const fn new(value: u32) -> Semaphore {
        Semaphore {
            value: AtomicU32::new(value),
            waiters: WaitList::new(),
        }
    }

    /// Current count
    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Decrement the count, blocking until it is positive.
    ///
    /// Must be called from thread context.
    pub fn down(&self, kernel: &Kernel) {
        let old = kernel.intr().disable();
        while self.value.load(Ordering::Acquire) == 0 {
            kernel.wait_on(&self.waiters);
        }
        self.value.fetch_sub(1, Ordering::AcqRel);
        kernel.intr().set_level(old);
    }

    /// Decrement the count if positive, without blocking
    pub fn try_down(&self, kernel: &Kernel) -> bool {
        let old = kernel.intr().disable();
        let taken = if self.value.load(Ordering::Acquire) > 0 {
            self.value.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        };
        kernel.intr().set_level(old);
        taken
    }

    /// Increment the count and wake one waiter, if any
    pub fn up(&self, kernel: &Kernel) {
        let old = kernel.intr().disable();
        self.value.fetch_add(1, Ordering::AcqRel);
        kernel.wake_one(&self.waiters);
        kernel.intr().set_level(old);
    }
}

// ============================================================================
// Lock
// ============================================================================

/// A non-recursive mutual-exclusion lock with owner tracking.
///
/// Thin wrapper over a one-count semaphore; the recorded holder makes
/// release-by-non-owner and recursive acquisition into hard errors.
pub struct Lock {
    /// Raw id of the holding thread, 0 when free
    holder: AtomicU64,
    sema: Semaphore,
}

impl Lock {
    /// Create an unheld lock
    pub const fn new() -> Lock {
        Lock {
            holder: AtomicU64::new(0),
            sema: Semaphore::new(1),
        }
    }

    /// Acquire the lock, blocking until it is free.
    ///
    /// Panics if the caller already holds it.
    pub fn acquire(&self, kernel: &Kernel) {
        let me = kernel.current_thread_id();
        assert!(
            self.holder.load(Ordering::Acquire) != me.0,
            "thread {me:?} re-acquiring a lock it holds"
        );
        self.sema.down(kernel);
        self.holder.store(me.0, Ordering::Release);
    }

    /// Release the lock and wake one contender.
    ///
    /// Panics unless the caller is the holder.
    pub fn release(&self, kernel: &Kernel) {
        let me = kernel.current_thread_id();
        assert!(
            self.holder.load(Ordering::Acquire) == me.0,
            "thread {me:?} releasing a lock it does not hold"
        );
        self.holder.store(0, Ordering::Release);
        self.sema.up(kernel);
    }

    /// True if the calling thread holds the lock
    pub fn held_by_current(&self, kernel: &Kernel) -> bool {
        self.holder.load(Ordering::Acquire) == kernel.current_thread_id().0
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}
