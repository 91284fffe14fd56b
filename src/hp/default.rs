//! The thread-local [`Local`] instance every hazard-pointer operation in this
//! crate goes through, exposed as a small set of free functions.
//!
//! The upstream crate made this pluggable through a `LocalAccess` trait so
//! that callers could supply their own thread-local storage (e.g. for
//! embedding multiple independent reclamation domains in one process). This
//! crate has exactly one hazard-pointer domain, so that indirection is
//! dropped in favor of calling straight into the one `thread_local!` below.

use core::ptr::NonNull;

use crate::hp::hazard::Hazard;
use crate::hp::local::{Local, RecycleError};
use crate::reclaim::Retired;

thread_local!(static LOCAL: Local = Local::new());

/// Acquires a hazard, either from the calling thread's cache or from the
/// global list, optionally setting it to protect `protect` immediately.
#[inline]
pub(crate) fn get_hazard(protect: Option<NonNull<()>>) -> &'static Hazard {
    LOCAL.with(|local| local.get_hazard(protect))
}

/// Attempts to cache `hazard` in the calling thread's local storage.
#[inline]
pub(crate) fn try_recycle_hazard(hazard: &'static Hazard) -> Result<(), RecycleError> {
    LOCAL.try_with(|local| local.try_recycle_hazard(hazard)).unwrap_or(Err(RecycleError::Access))
}

/// Increases the calling thread's operation count, possibly triggering a scan.
#[inline]
pub(crate) fn increase_ops_count() {
    let _ = LOCAL.try_with(|local| local.increase_ops_count());
}

/// Hands a retired record to the calling thread's retired bag.
#[inline]
pub(crate) fn retire_record(record: Retired) {
    let _ = LOCAL.try_with(|local| local.retire_record(record));
}
