//! The RAII guard used to protect a single pointer snapshot read from shared
//! memory for the duration it is held (the hazard-pointer acquire/release
//! protocol of §4.B).

use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::hp::default;
use crate::hp::hazard::HazardPtr;
use crate::sync::{Atomic, MarkedNonNull, MarkedPtr};

/// Returned by [`Guard::acquire_if_equal`] when the atomic no longer held the
/// expected value by the time the hazard pointer had been set.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NotEqual;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Guard
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A guarded pointer that can be used to acquire hazard pointers protecting
/// values read out of an [`Atomic<T, N>`].
#[derive(Debug)]
pub struct Guard<T, const N: u32> {
    state: State<T, N>,
}

// SAFETY: a `Guard` only ever stores a hazard reference (globally shared,
// never moved) and a tagged pointer it protects; it carries no thread
// affinity of its own.
unsafe impl<T, const N: u32> Send for Guard<T, N> {}

impl<T, const N: u32> Default for Guard<T, N> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: u32> Clone for Guard<T, N> {
    #[inline]
    fn clone(&self) -> Self {
        if let State::Protected(hazard, ptr) = &self.state {
            // (GUA:1) this `Acquire` load synchronizes-with any `Release` or `SeqCst` store to the
            // `protected` field of the same hazard (without total global ordering).
            let protect = hazard.protected(Ordering::Acquire).unwrap();
            let fresh = default::get_hazard(Some(protect.into_non_null()));
            Self { state: State::Protected(HazardPtr::from(fresh), *ptr) }
        } else {
            Self::new()
        }
    }
}

impl<T, const N: u32> Guard<T, N> {
    /// Creates a new, unprotected guard.
    #[inline]
    pub fn new() -> Self {
        Self { state: State::None }
    }

    /// Returns the currently protected pointer, if any.
    #[inline]
    pub fn shared(&self) -> Option<MarkedNonNull<T, N>> {
        match self.state {
            State::Protected(_, ptr) => Some(ptr),
            _ => None,
        }
    }

    /// Loads `atomic`'s current value, protecting it with a hazard pointer
    /// before returning it, retrying for as long as the loaded value keeps
    /// changing underneath the hazard store (§4.B's acquire loop).
    #[inline]
    pub fn acquire(&mut self, atomic: &Atomic<T, N>, order: Ordering) -> Option<MarkedNonNull<T, N>> {
        match atomic.load(Ordering::Relaxed).into_non_null() {
            None => {
                self.release();
                None
            }
            Some(ptr) => {
                let mut protect = ptr.decompose_ptr();
                let hazard = self
                    .take_hazard_and_protect(protect.cast())
                    .unwrap_or_else(|| HazardPtr::from(default::get_hazard(Some(protect.cast()))));

                // the initially taken snapshot is now stored in the hazard pointer, but the value
                // stored in `atomic` may have changed already; this load has to synchronize-with
                // any potential store to `atomic`
                loop {
                    match atomic.load(order).into_non_null() {
                        None => {
                            drop(hazard);
                            self.state = State::None;
                            return None;
                        }
                        Some(current) => {
                            let unmarked = current.decompose_ptr();
                            if protect == unmarked {
                                self.state = State::Protected(hazard, current);
                                return Some(current);
                            }

                            // (GUA:2) this `SeqCst` store synchronizes-with the `SeqCst` fence a
                            // scan performs before reading hazard slots
                            hazard.set_protected(unmarked.cast(), Ordering::SeqCst);
                            protect = unmarked;
                        }
                    }
                }
            }
        }
    }

    /// Like [`Guard::acquire`] but only protects the pointer if `atomic`
    /// currently holds exactly `expected`, failing with [`NotEqual`]
    /// otherwise.
    #[inline]
    pub fn acquire_if_equal(
        &mut self,
        atomic: &Atomic<T, N>,
        expected: MarkedPtr<T, N>,
        order: Ordering,
    ) -> Result<Option<MarkedNonNull<T, N>>, NotEqual> {
        match atomic.load(Ordering::Relaxed).into_non_null() {
            Some(ptr) if ptr.into_marked_ptr() == expected => {
                let unmarked = ptr.decompose_ptr();
                let hazard = self
                    .take_hazard_and_protect(unmarked.cast())
                    .unwrap_or_else(|| HazardPtr::from(default::get_hazard(Some(unmarked.cast()))));

                // this load has to synchronize-with any potential store to `atomic`
                if atomic.load(order) != expected {
                    return Err(NotEqual);
                }

                self.state = State::Protected(hazard, ptr);
                Ok(Some(ptr))
            }
            None if expected.is_null() => {
                self.release();
                Ok(None)
            }
            _ => Err(NotEqual),
        }
    }

    /// Releases the currently protected pointer (if any), keeping the hazard
    /// itself cached for quick reuse.
    #[inline]
    pub fn release(&mut self) {
        if let State::Protected(hazard, _) | State::Scoped(hazard) = self.state.take() {
            if cfg!(feature = "count-release") {
                default::increase_ops_count();
            }

            // (GUA:3) this `Release` store synchronizes-with any `Acquire` load on the `protected`
            // field of the same hazard pointer
            hazard.set_reserved(Ordering::Release);
            self.state = State::Scoped(hazard);
        }
    }

    /// Takes the internally stored hazard pointer (if any) and sets it to
    /// protect `protect`.
    #[inline]
    fn take_hazard_and_protect(&mut self, protect: NonNull<()>) -> Option<HazardPtr> {
        match self.state.take() {
            State::Protected(hazard, _) | State::Scoped(hazard) => {
                // (GUA:4) this `SeqCst` store synchronizes-with the `SeqCst` fence a scan performs
                // before reading hazard slots
                hazard.set_protected(protect, Ordering::SeqCst);
                Some(hazard)
            }
            _ => None,
        }
    }
}

impl<T, const N: u32> Drop for Guard<T, N> {
    #[inline]
    fn drop(&mut self) {
        if cfg!(feature = "count-release") {
            default::increase_ops_count();
        }
    }
}

#[derive(Debug)]
enum State<T, const N: u32> {
    Protected(HazardPtr, MarkedNonNull<T, N>),
    Scoped(HazardPtr),
    None,
}

impl<T, const N: u32> State<T, N> {
    #[inline]
    fn take(&mut self) -> Self {
        mem::replace(self, State::None)
    }
}

#[cfg(test)]
mod tests {
    use super::{Guard, State};
    use crate::sync::{Atomic, MarkedPtr};

    #[test]
    fn empty() {
        let mut guard: Guard<i32, 0> = Guard::new();
        assert!(matches!(guard.state, State::None));
        assert!(guard.shared().is_none());
    }

    #[test]
    fn acquire_protects_current_value() {
        let mut val = 1;
        let atomic: Atomic<i32, 0> = Atomic::new(MarkedPtr::compose(&mut val as *mut _, 0));
        let mut guard: Guard<i32, 0> = Guard::new();

        let shared = guard.acquire(&atomic, std::sync::atomic::Ordering::Acquire).unwrap();
        assert_eq!(unsafe { shared.as_ref() }, &1);
    }

    #[test]
    fn acquire_on_null_releases() {
        let atomic: Atomic<i32, 0> = Atomic::null();
        let mut guard: Guard<i32, 0> = Guard::new();
        assert!(guard.acquire(&atomic, std::sync::atomic::Ordering::Acquire).is_none());
        assert!(guard.shared().is_none());
    }
}
