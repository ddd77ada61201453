//! Control of the local interrupt enable state.
//!
//! Spinlocks disable interrupts for their whole critical section;
//! [`push_disabled`]/[`pop_disabled`] nest like xv6's `push_off`/`pop_off`,
//! restoring the original enable state only when the outermost level is
//! popped.
//!
//! On `riscv64` this drives the `sstatus.SIE` bit; elsewhere a thread-local
//! stand-in keeps the same bookkeeping so the core can run under test.

use core::marker::PhantomData;

/// Restores the saved interrupt enable state when dropped.
pub struct Guard {
    // Interrupt state is per-CPU; the guard must not migrate.
    _not_send: PhantomData<*mut ()>,
}

/// Saves the current interrupt enable state and disables interrupts.
pub fn push_disabled() -> Guard {
    imp::push_disabled();
    Guard {
        _not_send: PhantomData,
    }
}

/// Restores the interrupt enable state saved by [`push_disabled`].
///
/// # Safety
///
/// Must pair with a [`push_disabled`] whose guard was forgotten.
pub unsafe fn pop_disabled() {
    drop(Guard {
        _not_send: PhantomData,
    });
}

/// Returns `true` if interrupts are enabled on this CPU.
pub fn is_enabled() -> bool {
    imp::is_enabled()
}

impl Guard {
    /// Leaks the guard, leaving interrupts disabled.
    ///
    /// The matching [`pop_disabled`] call re-arms the drop bookkeeping.
    pub fn forget(self) {
        core::mem::forget(self);
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        imp::pop_disabled();
    }
}

#[cfg(target_arch = "riscv64")]
mod imp {
    use core::cell::UnsafeCell;

    use riscv::register::sstatus;

    use crate::{cpu, param::NCPU};

    /// Per-CPU disable depth and the enable state saved at depth zero.
    ///
    /// Only touched by its own CPU with interrupts off, so plain cells are
    /// enough.
    struct OffState {
        noff: UnsafeCell<usize>,
        intena: UnsafeCell<bool>,
    }

    unsafe impl Sync for OffState {}

    static STATES: [OffState; NCPU] = [const {
        OffState {
            noff: UnsafeCell::new(0),
            intena: UnsafeCell::new(false),
        }
    }; NCPU];

    pub(super) fn is_enabled() -> bool {
        sstatus::read().sie()
    }

    pub(super) fn push_disabled() {
        let was_enabled = is_enabled();
        unsafe {
            sstatus::clear_sie();
        }

        let state = &STATES[cpu::id()];
        unsafe {
            if *state.noff.get() == 0 {
                *state.intena.get() = was_enabled;
            }
            *state.noff.get() += 1;
        }
    }

    pub(super) fn pop_disabled() {
        assert!(!is_enabled());

        let state = &STATES[cpu::id()];
        unsafe {
            assert!(*state.noff.get() > 0);
            *state.noff.get() -= 1;
            if *state.noff.get() == 0 && *state.intena.get() {
                sstatus::set_sie();
            }
        }
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod imp {
    use std::cell::Cell;

    #[derive(Clone, Copy)]
    struct OffState {
        enabled: bool,
        noff: usize,
        intena: bool,
    }

    thread_local! {
        static STATE: Cell<OffState> = const {
            Cell::new(OffState {
                enabled: true,
                noff: 0,
                intena: false,
            })
        };
    }

    pub(super) fn is_enabled() -> bool {
        STATE.with(|state| state.get().enabled)
    }

    pub(super) fn push_disabled() {
        STATE.with(|state| {
            let mut s = state.get();
            if s.noff == 0 {
                s.intena = s.enabled;
            }
            s.enabled = false;
            s.noff += 1;
            state.set(s);
        });
    }

    pub(super) fn pop_disabled() {
        STATE.with(|state| {
            let mut s = state.get();
            assert!(!s.enabled);
            assert!(s.noff > 0);
            s.noff -= 1;
            if s.noff == 0 && s.intena {
                s.enabled = true;
            }
            state.set(s);
        });
    }
}
