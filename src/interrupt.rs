//! Interrupt enable state for a single processor.
//!
//! The kernel's only mutual-exclusion tool on one CPU is turning
//! interrupts off. Scheduler entry points disable interrupts, touch the
//! shared queues, and restore the caller's previous level on the way
//! out. This module models that flag; on real hardware the same
//! operations would execute `cli`/`sti` and read EFLAGS.IF.

use core::sync::atomic::{AtomicBool, Ordering};

/// Interrupt enable level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    /// Interrupts enabled
    On,
    /// Interrupts disabled
    Off,
}

/// Per-processor interrupt flag.
///
/// Starts disabled; the scheduler turns interrupts on once the first
/// switch can safely happen, matching the hardware boot state.
#[derive(Debug)]
pub struct IntrState {
    enabled: AtomicBool,
}

impl IntrState {
    /// Create the boot-time state, interrupts off
    pub const fn new() -> Self {
        IntrState {
            enabled: AtomicBool::new(false),
        }
    }

    /// Current interrupt level
    pub fn level(&self) -> IntrLevel {
        if self.enabled.load(Ordering::Acquire) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    /// Set the interrupt level, returning the previous one
    pub fn set_level(&self, level: IntrLevel) -> IntrLevel {
        let was = self.enabled.swap(level == IntrLevel::On, Ordering::AcqRel);
        if was {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    /// Disable interrupts, returning the previous level
    pub fn disable(&self) -> IntrLevel {
        self.set_level(IntrLevel::Off)
    }

    /// Enable interrupts, returning the previous level
    pub fn enable(&self) -> IntrLevel {
        self.set_level(IntrLevel::On)
    }

    /// Panic unless interrupts are disabled.
    ///
    /// Scheduler internals call this on entry; running them with
    /// interrupts on would let the tick handler race the queues.
    pub fn assert_disabled(&self) {
        assert!(
            self.level() == IntrLevel::Off,
            "interrupts enabled inside scheduler critical section"
        );
    }
}

impl Default for IntrState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disabled() {
        let intr = IntrState::new();
        assert_eq!(intr.level(), IntrLevel::Off);
        intr.assert_disabled();
    }

    #[test]
    fn test_disable_restore_nesting() {
        let intr = IntrState::new();
        intr.enable();

        let outer = intr.disable();
        assert_eq!(outer, IntrLevel::On);
        let inner = intr.disable();
        assert_eq!(inner, IntrLevel::Off);

        intr.set_level(inner);
        assert_eq!(intr.level(), IntrLevel::Off);
        intr.set_level(outer);
        assert_eq!(intr.level(), IntrLevel::On);
    }

    #[test]
    #[should_panic]
    fn test_assert_disabled_fires() {
        let intr = IntrState::new();
        intr.enable();
        intr.assert_disabled();
    }
}
