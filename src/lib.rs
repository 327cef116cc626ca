//! SimpleOS - the threading and memory-bootstrap core of a small
//! teaching kernel, in Rust.
//!
//! This crate provides the pieces a timesharing kernel needs before it
//! can do anything else: a two-level kernel page table bootstrap,
//! stack-embedded thread control blocks, a context switch engine, a
//! round-robin scheduler with an optional multilevel-feedback mode, and
//! blocking synchronization primitives.
//!
//! All mutable kernel state lives in an explicitly-owned
//! [`kernel::Kernel`] value rather than in globals, so the whole system
//! can be exercised by the ordinary host test harness.

#![cfg_attr(not(test), no_std)]

// Standard library replacement for no_std
extern crate alloc;

pub mod addr;
pub mod fixed_point;
pub mod heap;
pub mod interrupt;
pub mod kernel;
pub mod palloc;
pub mod paging;
pub mod sched;
pub mod switch;
pub mod sync;
pub mod thread;

pub use kernel::{BootOptions, Kernel};
pub use thread::{ThreadId, ThreadStatus};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "SimpleOS";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "SimpleOS");
        assert!(!VERSION.is_empty());
    }
}
