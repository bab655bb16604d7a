//! Thin layer over the pieces of the machine the allocator and VFS care
//! about: which CPU we are on, and scoped interrupt masking.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::param::NCPU;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "riscv64", not(test)))] {
        /// Reads the hart id that `start` stashed in `tp`.
        ///
        /// Must be called with interrupts disabled, to prevent a race with
        /// process migration to a different CPU.
        pub fn cpu_id() -> usize {
            let id: usize;
            unsafe { core::arch::asm!("mv {}, tp", out(reg) id) };
            id
        }

        fn intr_get() -> bool {
            const SSTATUS_SIE: usize = 1 << 1;
            let x: usize;
            unsafe { core::arch::asm!("csrr {}, sstatus", out(reg) x) };
            x & SSTATUS_SIE != 0
        }

        fn intr_off() {
            const SSTATUS_SIE: usize = 1 << 1;
            unsafe { core::arch::asm!("csrc sstatus, {}", in(reg) SSTATUS_SIE) };
        }

        fn intr_on() {
            const SSTATUS_SIE: usize = 1 << 1;
            unsafe { core::arch::asm!("csrs sstatus, {}", in(reg) SSTATUS_SIE) };
        }
    } else {
        /// Single-CPU stand-in for builds without hart-local state.
        pub fn cpu_id() -> usize {
            0
        }

        fn intr_get() -> bool {
            false
        }

        fn intr_off() {}

        fn intr_on() {}
    }
}

struct IntrState {
    /// Depth of nested `push_off` calls on this CPU.
    noff: AtomicUsize,
    /// Whether interrupts were enabled before the outermost `push_off`.
    enabled_before: AtomicBool,
}

// One slot per CPU; a slot is only ever touched from its own CPU with
// interrupts off, so the relaxed atomics are a formality.
const INTR_STATE_INIT: IntrState = IntrState {
    noff: AtomicUsize::new(0),
    enabled_before: AtomicBool::new(false),
};
static INTR_STATE: [IntrState; NCPU] = [INTR_STATE_INIT; NCPU];

/// Interrupts held off on the local CPU until the guard drops.
///
/// Like `intr_off`/`intr_on` except that the guards are matched: it takes
/// the drop of two guards to undo two `push_off`s, and if interrupts were
/// off to begin with they stay off.
pub struct IntrGuard {
    cpu: usize,
}

/// Disables local interrupts and returns the guard that restores them.
pub fn push_off() -> IntrGuard {
    let old = intr_get();
    intr_off();
    let cpu = cpu_id();
    let state = &INTR_STATE[cpu];
    if state.noff.load(Ordering::Relaxed) == 0 {
        state.enabled_before.store(old, Ordering::Relaxed);
    }
    let _ = state.noff.fetch_add(1, Ordering::Relaxed);
    IntrGuard { cpu }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        let state = &INTR_STATE[self.cpu];
        let prev = state.noff.fetch_sub(1, Ordering::Relaxed);
        assert!(prev >= 1, "pop_off");
        if prev == 1 && state.enabled_before.load(Ordering::Relaxed) {
            intr_on();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_guards_balance() {
        // Other tests push and pop concurrently on the host (every thread
        // reports CPU 0), so only the nesting protocol itself is checked.
        let a = push_off();
        {
            let b = push_off();
            assert!(INTR_STATE[b.cpu].noff.load(Ordering::Relaxed) >= 2);
        }
        assert!(INTR_STATE[a.cpu].noff.load(Ordering::Relaxed) >= 1);
    }
}
