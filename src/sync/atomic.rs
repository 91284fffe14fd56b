//! Typed atomic cells built on top of [`MarkedPtr`].
//!
//! This is the thin layer every container in this crate programs against
//! instead of reaching for `AtomicPtr` directly: it keeps the tag-bit
//! bookkeeping in one place and gives every CAS site an explicit pair of
//! memory orders (one for success, one for failure), mirroring how the
//! teacher crate threads `Ordering` through every hazard/retired-record
//! operation.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::sync::marked_ptr::MarkedPtr;

/// An atomic cell holding a [`MarkedPtr<T, N>`].
pub struct Atomic<T, const N: u32> {
    inner: AtomicPtr<T>,
}

impl<T, const N: u32> Atomic<T, N> {
    /// Creates a new atomic cell with a null, untagged value.
    pub const fn null() -> Self {
        Self { inner: AtomicPtr::new(core::ptr::null_mut()) }
    }

    /// Creates a new atomic cell initialized to `ptr`.
    pub fn new(ptr: MarkedPtr<T, N>) -> Self {
        Self { inner: AtomicPtr::new(ptr.into_raw()) }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> MarkedPtr<T, N> {
        MarkedPtr::from_raw(self.inner.load(order))
    }

    #[inline]
    pub fn store(&self, new: MarkedPtr<T, N>, order: Ordering) {
        self.inner.store(new.into_raw(), order);
    }

    #[inline]
    pub fn swap(&self, new: MarkedPtr<T, N>, order: Ordering) -> MarkedPtr<T, N> {
        MarkedPtr::from_raw(self.inner.swap(new.into_raw(), order))
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: MarkedPtr<T, N>,
        new: MarkedPtr<T, N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<MarkedPtr<T, N>, MarkedPtr<T, N>> {
        self.inner
            .compare_exchange(current.into_raw(), new.into_raw(), success, failure)
            .map(MarkedPtr::from_raw)
            .map_err(MarkedPtr::from_raw)
    }

    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: MarkedPtr<T, N>,
        new: MarkedPtr<T, N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<MarkedPtr<T, N>, MarkedPtr<T, N>> {
        self.inner
            .compare_exchange_weak(current.into_raw(), new.into_raw(), success, failure)
            .map(MarkedPtr::from_raw)
            .map_err(MarkedPtr::from_raw)
    }
}

impl<T, const N: u32> Default for Atomic<T, N> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, const N: u32> fmt::Debug for Atomic<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atomic").field("ptr", &self.load(Ordering::Relaxed)).finish()
    }
}

// SAFETY: `Atomic` only ever moves `*mut T` values between threads, never
// dereferences them itself; reachability and lifetime is the container's
// (and the SMR scheme's) responsibility.
unsafe impl<T, const N: u32> Send for Atomic<T, N> {}
unsafe impl<T, const N: u32> Sync for Atomic<T, N> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_roundtrip() {
        let mut a = 1i32;
        let mut b = 2i32;
        let atomic: Atomic<i32, 0> = Atomic::new(MarkedPtr::compose(&mut a as *mut _, 0));
        let current = atomic.load(Ordering::Acquire);
        assert_eq!(current.decompose_ptr(), &mut a as *mut _);

        let new = MarkedPtr::compose(&mut b as *mut _, 0);
        atomic
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Relaxed)
            .expect("cas should succeed on an unmodified cell");
        assert_eq!(atomic.load(Ordering::Acquire).decompose_ptr(), &mut b as *mut _);
    }
}
