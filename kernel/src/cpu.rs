//! CPU identity.
//!
//! The allocator keeps per-CPU state, and the only hardware coupling it
//! needs is "which CPU am I on, and don't move me while I look". That scope
//! is [`pinned`]: it disables interrupts, exposes the CPU index, and
//! restores the interrupt state on drop.

use crate::{interrupt, param::NCPU};

/// An owner token meaning "no CPU".
pub const INVALID_CPUID: usize = usize::MAX;

/// Returns the current CPU's ID.
///
/// Must be called with interrupts disabled, to prevent a race with the
/// process being moved to a different CPU.
#[cfg(target_arch = "riscv64")]
#[track_caller]
pub fn id() -> usize {
    assert!(!interrupt::is_enabled());

    let id: usize;
    unsafe {
        core::arch::asm!("mv {}, tp", out(reg) id);
    }
    id
}

/// Returns the current CPU's ID.
///
/// Off `riscv64` every thread acts as its own CPU and gets a fresh id at
/// first use; shard indices are derived from it modulo [`NCPU`].
#[cfg(not(target_arch = "riscv64"))]
#[track_caller]
pub fn id() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

    thread_local! {
        static ID: usize = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }

    assert!(!interrupt::is_enabled());
    ID.with(|id| *id)
}

/// Pins execution to the current CPU for the guard's lifetime.
pub fn pinned() -> PinnedCpu {
    let guard = interrupt::push_disabled();
    let id = id() % NCPU;
    PinnedCpu { id, _guard: guard }
}

/// Proof of staying on one CPU: interrupts are disabled until drop.
pub struct PinnedCpu {
    id: usize,
    _guard: interrupt::Guard,
}

impl PinnedCpu {
    /// The pinned CPU's index, in `0..NCPU`.
    pub fn id(&self) -> usize {
        self.id
    }
}
