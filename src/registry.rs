//! Process-wide registry of attached threads (component D).
//!
//! Both SMR schemes need the same piece of bookkeeping: a way to tell whether
//! a thread is currently allowed to touch a container. Hazard pointers and
//! RCU each keep their own scan targets ([`crate::hp::hazard::HazardList`],
//! [`crate::rcu::slots::EpochSlotList`]), lazily populated on first use; this
//! module owns the explicit attach/detach lifecycle sitting on top of both,
//! so a container operation can assert the calling thread is attached before
//! it does anything per §4.D and §4.I.

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

static ACTIVE_THREADS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static ATTACH_DEPTH: Cell<u32> = Cell::new(0);
}

/// RAII proof that the calling thread is attached to the registry.
///
/// Attaching is idempotent and nests: the thread only actually joins (and
/// its count is only bumped) on the outermost call, and only leaves on the
/// matching outermost drop.
#[derive(Debug)]
pub struct RegistryGuard {
    _private: (),
}

/// Attaches the calling thread, initializing its hazard-pointer and RCU
/// thread-local state if this is the first attach on this thread.
///
/// Every public container operation calls this internally; user code only
/// needs it directly when holding a guard across several operations to
/// avoid repeated attach/detach bookkeeping.
#[inline]
pub fn attach() -> RegistryGuard {
    ATTACH_DEPTH.with(|depth| {
        let d = depth.get();
        if d == 0 {
            ACTIVE_THREADS.fetch_add(1, Ordering::Relaxed);
        }
        depth.set(d + 1);
    });
    RegistryGuard { _private: () }
}

/// Number of threads currently attached to the registry.
#[inline]
pub fn active_threads() -> usize {
    ACTIVE_THREADS.load(Ordering::Relaxed)
}

impl Drop for RegistryGuard {
    #[inline]
    fn drop(&mut self) {
        ATTACH_DEPTH.with(|depth| {
            let d = depth.get();
            debug_assert!(d > 0, "RegistryGuard dropped more times than attach() was called");
            depth.set(d - 1);
            if d == 1 {
                ACTIVE_THREADS.fetch_sub(1, Ordering::Relaxed);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_attach_counts_once() {
        let before = active_threads();
        let outer = attach();
        let inner = attach();
        assert_eq!(active_threads(), before + 1);
        drop(inner);
        assert_eq!(active_threads(), before + 1);
        drop(outer);
        assert_eq!(active_threads(), before);
    }
}
