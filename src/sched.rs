//! Scheduler core.
//!
//! Holds the ready queue and thread registry behind one lock, and the
//! pure policy math: FIFO round-robin selection, or multilevel-feedback
//! selection driven by the decayed-usage formulas. The state machine
//! itself (who blocks, who switches, who reclaims a dying thread's
//! page) lives in [`crate::kernel`]; this module only decides who runs
//! next and how priorities evolve.

use alloc::collections::VecDeque;
use core::sync::atomic::AtomicU64;

use crate::fixed_point::Fixed;
use crate::thread::{priority, Linkage, Registry, TcbRef, ThreadId, ThreadStatus};

/// Timer ticks per second
pub const TIMER_FREQ: u64 = 100;
/// Scheduling quantum in ticks
pub const TIME_SLICE: u64 = 4;
/// Ticks between priority recomputations in multilevel-feedback mode
pub const PRIORITY_RECALC_TICKS: u64 = 4;

/// Scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// FIFO round-robin; priorities are bookkeeping only
    RoundRobin,
    /// Multilevel feedback: effective priority derived from usage
    Mlfqs,
}

/// Scheduler statistics
#[derive(Debug, Default)]
pub struct SchedStats {
    /// Total context switches
    pub context_switches: AtomicU64,
    /// Total ticks
    pub ticks: AtomicU64,
    /// Ticks spent in the idle thread
    pub idle_ticks: AtomicU64,
    /// Ticks spent in ordinary kernel threads
    pub kernel_ticks: AtomicU64,
}

// ============================================================================
// Ready Queue and Registry
// ============================================================================

/// Mutable scheduler state, guarded by one lock in the kernel context
pub(crate) struct SchedCore {
    /// Runnable threads in arrival order
    ready: VecDeque<ThreadId>,
    /// All live threads
    pub(crate) registry: Registry,
}

impl SchedCore {
    pub(crate) fn new() -> SchedCore {
        SchedCore {
            ready: VecDeque::new(),
            registry: Registry::new(),
        }
    }

    /// Number of threads waiting in the ready queue
    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Make a thread READY and put it at the tail of the queue.
    ///
    /// `from` is the queue the caller just took the thread off of;
    /// the linkage check catches a thread owned by two queues at once.
    pub(crate) fn enqueue(&mut self, tcb: TcbRef, from: Linkage) {
        let t = tcb.get();
        t.check_guard();
        t.relink(from, Linkage::ReadyQueue);
        t.set_status(ThreadStatus::Ready);
        self.ready.push_back(t.id);
    }

    /// Take the next thread to run off the queue, or None if empty.
    ///
    /// Round-robin takes the head; multilevel-feedback takes the
    /// highest effective priority, earliest-queued on ties.
    pub(crate) fn pick_next(&mut self, policy: SchedPolicy) -> Option<TcbRef> {
        let index = match policy {
            SchedPolicy::RoundRobin => {
                if self.ready.is_empty() {
                    return None;
                }
                0
            }
            SchedPolicy::Mlfqs => self.best_ready_index()?,
        };

        let id = self.ready.remove(index)?;
        let tcb = match self.registry.get(id) {
            Some(tcb) => tcb,
            None => panic!("ready queue holds unknown thread {id:?}"),
        };
        tcb.get().relink(Linkage::ReadyQueue, Linkage::Unlinked);
        Some(tcb)
    }

    /// Highest priority among queued threads, if any
    pub(crate) fn highest_ready_priority(&self) -> Option<i32> {
        self.ready
            .iter()
            .filter_map(|id| self.registry.get(*id))
            .map(|t| t.get().priority())
            .max()
    }

    fn best_ready_index(&self) -> Option<usize> {
        let mut best: Option<(usize, i32)> = None;
        for (index, id) in self.ready.iter().enumerate() {
            let pri = match self.registry.get(*id) {
                Some(tcb) => tcb.get().priority(),
                None => panic!("ready queue holds unknown thread {id:?}"),
            };
            // Strictly greater keeps the earliest thread on ties
            if best.map(|(_, b)| pri > b).unwrap_or(true) {
                best = Some((index, pri));
            }
        }
        best.map(|(index, _)| index)
    }
}

// ============================================================================
// Decayed-Usage Formulas
// ============================================================================

/// Effective priority from usage and niceness, clamped to the range
pub(crate) fn mlfqs_priority(recent_cpu: Fixed, nice: i32) -> i32 {
    let pri = priority::MAX - recent_cpu.div_int(4).to_int_round() - 2 * nice;
    pri.clamp(priority::MIN, priority::MAX)
}

/// Once-a-second decay: recent_cpu = (2*load)/(2*load + 1) * recent_cpu + nice
pub(crate) fn mlfqs_recent_cpu(recent_cpu: Fixed, load_avg: Fixed, nice: i32) -> Fixed {
    let twice_load = load_avg.mul_int(2);
    let coefficient = twice_load.div(twice_load.add_int(1));
    coefficient.mul(recent_cpu).add_int(nice)
}

/// Once-a-second load average: load = (59/60)*load + (1/60)*ready
pub(crate) fn mlfqs_load_avg(load_avg: Fixed, ready_threads: i32) -> Fixed {
    Fixed::ratio(59, 60).mul(load_avg) + Fixed::ratio(1, 60).mul_int(ready_threads)
}
