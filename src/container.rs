//! The container call shell (component I, §4.I).
//!
//! There is no single generic function threading through "check deadlock
//! policy, acquire protection, run the algorithm, update counters, release
//! protection" — hazard-pointer containers and the RCU-backed ones acquire
//! and release fundamentally different things, so each container's
//! `insert`/`erase`/`contains`/... methods follow that sequence inline,
//! the same way the hazard-pointer list and the split-ordered set already
//! do. What *is* shared across every container that hands ownership of an
//! extracted node back to the caller is [`Extracted`]: a smart pointer that
//! defers the node's actual reclamation to the owning SMR scheme's retire
//! queue instead of freeing it the instant the caller drops it, which is
//! what step (6) of the shell asks for.

use core::ops::Deref;

use crate::hp::Hp;

/// Ownership of a node extracted out of a hazard-pointer-protected
/// container (e.g. via `extract`/`extract_min`/`extract_max`). The node was
/// already physically unlinked by the time this is constructed; dropping it
/// hands it to the hazard-pointer retire queue rather than freeing it
/// immediately, since another thread may still hold a hazard pointer to its
/// address.
pub struct Extracted<T: 'static> {
    ptr: *mut T,
}

impl<T: 'static> Extracted<T> {
    /// Takes ownership of an already-unlinked node.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live, heap-allocated `T` that has already been
    /// unlinked from every structure reachable by other threads, and no
    /// other `Extracted` (or retire call) may be constructed over the same
    /// pointer.
    pub(crate) unsafe fn new(ptr: *mut T) -> Self {
        Self { ptr }
    }
}

impl<T: 'static> Deref for Extracted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: `ptr` is valid for as long as this `Extracted` is alive;
        // nothing else retires or frees it before `drop` runs.
        unsafe { &*self.ptr }
    }
}

impl<T: 'static> Drop for Extracted<T> {
    fn drop(&mut self) {
        // SAFETY: constructed only from an already-unlinked node (see `new`).
        unsafe { Hp::retire(Box::from_raw(self.ptr)) };
    }
}

// SAFETY: `Extracted` only exposes shared access to `T` and defers freeing
// to the global retire queue, which is itself thread-safe.
unsafe impl<T: 'static + Send> Send for Extracted<T> {}
unsafe impl<T: 'static + Sync> Sync for Extracted<T> {}
