//! Memory order overrides for the `sanitize-threads` feature.
//!
//! ThreadSanitizer does not understand that a hazard slot's `Relaxed` load is
//! made safe by the `SeqCst` fence a scan performs separately; under tsan
//! those loads/stores are promoted to `SeqCst` so the happens-before edges are
//! visible to the race detector. Call sites that use these constants are
//! exactly the ones already paired with a scan fence.

use core::sync::atomic::Ordering;

#[cfg(not(feature = "sanitize-threads"))]
pub(crate) const RELAXED_LOAD: Ordering = Ordering::Relaxed;
#[cfg(feature = "sanitize-threads")]
pub(crate) const RELAXED_LOAD: Ordering = Ordering::SeqCst;

#[cfg(not(feature = "sanitize-threads"))]
pub(crate) const RELAXED_STORE: Ordering = Ordering::Relaxed;
#[cfg(feature = "sanitize-threads")]
pub(crate) const RELAXED_STORE: Ordering = Ordering::SeqCst;
