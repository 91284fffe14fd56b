//! Thread local state and caches for reserving hazard pointers and storing
//! retired records.

#[cfg(feature = "std")]
use std::error;

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{
    self,
    Ordering::{Release, SeqCst},
};

use arrayvec::{ArrayVec, CapacityError};

use crate::hp::global;
use crate::hp::hazard::{Hazard, Protected};
use crate::hp::retired::{ReclaimOnDrop, RetiredBag};
use crate::reclaim::Retired;
use crate::sanitize;

////////////////////////////////////////////////////////////////////////////////////////////////////
// constants
////////////////////////////////////////////////////////////////////////////////////////////////////

// baseline threshold, tunable at build time via the `CONC_CONTAINERS_HP_SCAN_THRESHOLD`
// environment variable; see build.rs.
#[cfg(all(not(feature = "maximum-reclamation-freq"), not(feature = "reduced-reclamation-freq")))]
include!(concat!(env!("OUT_DIR"), "/build_constants.rs"));

#[cfg(feature = "reduced-reclamation-freq")]
const SCAN_THRESHOLD: u32 = 200;
#[cfg(feature = "maximum-reclamation-freq")]
const SCAN_THRESHOLD: u32 = 1;

const HAZARD_CACHE: usize = 16;
const SCAN_CACHE: usize = 128;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Local
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Container for all thread local data required for reclamation with hazard
/// pointers.
///
/// There is exactly one `Local` per thread, stored in the thread local
/// declared in [`crate::hp::default`]; unlike the upstream crate this is
/// reached through free functions below instead of a pluggable
/// `LocalAccess` trait, since every caller in this crate goes through the
/// same thread-local instance.
#[derive(Debug)]
pub(crate) struct Local(UnsafeCell<LocalInner>);

impl Default for Local {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Local {
    /// Creates a new container for the thread local state.
    #[inline]
    pub fn new() -> Self {
        Self(UnsafeCell::new(LocalInner {
            ops_count: 0,
            hazard_cache: ArrayVec::new(),
            scan_cache: Vec::with_capacity(SCAN_CACHE),
            retired_bag: match global::GLOBAL.try_adopt_abandoned_records() {
                Some(boxed) => ManuallyDrop::new(boxed),
                None => ManuallyDrop::new(Box::new(RetiredBag::new())),
            },
        }))
    }

    /// Attempts to take a reserved hazard from the thread local cache, falling
    /// back to the global list.
    #[inline]
    pub(crate) fn get_hazard(&self, protect: Option<NonNull<()>>) -> &'static Hazard {
        let local = unsafe { &mut *self.0.get() };
        match local.hazard_cache.pop() {
            Some(hazard) => {
                if let Some(protect) = protect {
                    // (LOC:0) matches the `SeqCst` protocol a fresh global hazard is acquired with
                    hazard.set_protected(protect, SeqCst);
                }
                hazard
            }
            None => match protect {
                Some(protect) => global::GLOBAL.get_hazard_for(protect).into_raw(),
                None => global::GLOBAL.get_reserved_hazard().into_raw(),
            },
        }
    }

    /// Attempts to cache `hazard` in the thread local storage.
    ///
    /// # Errors
    ///
    /// The operation can fail if the thread local hazard cache is at maximum
    /// capacity.
    #[inline]
    pub(crate) fn try_recycle_hazard(&self, hazard: &'static Hazard) -> Result<(), RecycleError> {
        let local = unsafe { &mut *self.0.get() };
        local.hazard_cache.try_push(hazard)?;

        // (LOC:1) this `Release` store synchronizes-with any `Acquire` load on the
        // `protected` field of the same hazard pointer
        hazard.set_reserved(Release);
        Ok(())
    }

    /// Increases the thread local operations count and triggers a scan if the
    /// threshold is reached.
    #[inline]
    pub(crate) fn increase_ops_count(&self) {
        unsafe { &mut *self.0.get() }.increase_ops_count();
    }

    /// Retires a record and increases the operations count.
    ///
    /// If the operations count reaches a threshold, a scan is triggered which
    /// reclaims all records that can be safely reclaimed and resets the
    /// operations count.
    /// Previously, an attempt is made to adopt all globally abandoned records.
    #[inline]
    pub(crate) fn retire_record(&self, record: Retired) {
        let local = unsafe { &mut *self.0.get() };
        local.retired_bag.inner.push(ReclaimOnDrop::from(record));
        #[cfg(not(feature = "count-release"))]
        local.increase_ops_count();
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &LocalInner {
        unsafe { &*self.0.get() }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// LocalInner
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub(crate) struct LocalInner {
    ops_count: u32,
    hazard_cache: ArrayVec<[&'static Hazard; HAZARD_CACHE]>,
    scan_cache: Vec<Protected>,
    retired_bag: ManuallyDrop<Box<RetiredBag>>,
}

impl LocalInner {
    /// Increases the operations count and triggers a scan if the threshold is
    /// reached.
    #[inline]
    fn increase_ops_count(&mut self) {
        self.ops_count += 1;

        if self.ops_count == SCAN_THRESHOLD {
            // try to adopt and merge any (global) abandoned retired bags
            if let Some(abandoned_bag) = global::GLOBAL.try_adopt_abandoned_records() {
                self.retired_bag.merge(abandoned_bag.inner);
            }

            let _ = self.scan_hazards();
            self.ops_count = 0;
        }
    }

    /// Reclaims all locally retired records that are unprotected and returns
    /// the number of reclaimed records.
    #[inline]
    fn scan_hazards(&mut self) -> usize {
        let len = self.retired_bag.inner.len();
        if len == 0 {
            return 0;
        }

        // (LOC:2) this `SeqCst` fence synchronizes-with every `SeqCst` hazard store and with the
        // `SeqCst` CAS a list traversal uses to physically unlink a node. This establishes a total
        // order between all these operations, which is required in order to ensure that all stores
        // protecting pointers have become fully visible before the hazard pointers are scanned and
        // unprotected retired records are reclaimed.
        global::GLOBAL.collect_protected_hazards(&mut self.scan_cache, SeqCst);

        self.scan_cache.sort_unstable();
        unsafe { self.reclaim_unprotected_records() };

        len - self.retired_bag.inner.len()
    }

    // this is declared unsafe because in this function the retired records are actually dropped.
    #[allow(unused_unsafe)]
    unsafe fn reclaim_unprotected_records(&mut self) {
        let scan_cache = &self.scan_cache;
        self.retired_bag.inner.retain(|retired| {
            // retain (DON'T drop) all records found within the scan cache of protected hazards
            scan_cache.binary_search_by(|protected| retired.compare_with(*protected)).is_ok()
        });
    }
}

impl Drop for LocalInner {
    #[inline]
    fn drop(&mut self) {
        for hazard in &self.hazard_cache {
            hazard.set_free(sanitize::RELAXED_STORE);
        }

        // (LOC:3) this `Release` fence synchronizes-with the `SeqCst` fence of a concurrent scan
        atomic::fence(Release);

        let _ = self.scan_hazards();
        // this is safe because the `retired_bag` field is neither accessed afterwards nor dropped
        let bag = unsafe { ptr::read(&*self.retired_bag) };

        if !bag.inner.is_empty() {
            global::GLOBAL.abandon_retired_bag(bag);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RecycleError
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Error type for thread local recycle operations.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum RecycleError {
    Access,
    Capacity,
}

impl From<CapacityError<&'static Hazard>> for RecycleError {
    #[inline]
    fn from(_: CapacityError<&'static Hazard>) -> Self {
        RecycleError::Capacity
    }
}

impl fmt::Display for RecycleError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RecycleError::Access => {
                write!(f, "failed to access already destroyed thread local storage")
            }
            RecycleError::Capacity => {
                write!(f, "thread local cache for hazard pointer already full")
            }
        }
    }
}

#[cfg(feature = "std")]
impl error::Error for RecycleError {}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::reclaim::Retired;

    use super::{Local, HAZARD_CACHE, SCAN_CACHE, SCAN_THRESHOLD};

    struct DropCount<'a>(&'a AtomicUsize);
    impl Drop for DropCount<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn acquire_local() {
        let local = Local::new();
        let mut val = 1;
        let ptr = NonNull::from(&mut val).cast::<()>();

        let acquired: Vec<_> = (0..HAZARD_CACHE).map(|_| local.get_hazard(Some(ptr))).collect();
        for hazard in &acquired {
            local.try_recycle_hazard(hazard).unwrap();
        }

        {
            // local hazard cache is full
            let inner = local.inner();
            assert_eq!(0, inner.ops_count);
            assert_eq!(HAZARD_CACHE, inner.hazard_cache.len());
            assert_eq!(SCAN_CACHE, inner.scan_cache.capacity());
            assert_eq!(0, inner.scan_cache.len());
        }

        // takes all hazards out of local cache and then allocates a new one.
        let hazards: Vec<_> = (0..HAZARD_CACHE).map(|_| local.get_hazard(Some(ptr))).collect();
        let extra = local.get_hazard(Some(ptr));

        {
            // local hazard cache is empty
            let inner = local.inner();
            assert_eq!(0, inner.ops_count);
            assert_eq!(0, inner.hazard_cache.len());
            assert_eq!(SCAN_CACHE, inner.scan_cache.capacity());
            assert_eq!(0, inner.scan_cache.len());
        }

        for hazard in &hazards {
            local.try_recycle_hazard(hazard).unwrap();
        }

        local.try_recycle_hazard(extra).unwrap_err();
    }

    #[test]
    #[cfg_attr(feature = "count-release", ignore)]
    fn retire() {
        const THRESHOLD: usize = SCAN_THRESHOLD as usize;

        let count = AtomicUsize::new(0);
        let local = Local::new();

        // allocate & retire (THRESHOLD - 1) records
        (0..THRESHOLD - 1)
            .map(|_| Box::new(DropCount(&count)))
            .map(|record| unsafe { Retired::new(record) })
            .for_each(|retired| local.retire_record(retired));

        {
            let inner = local.inner();
            assert_eq!(THRESHOLD - 1, inner.ops_count as usize);
            assert_eq!(THRESHOLD - 1, inner.retired_bag.inner.len());
        }

        // nothing has been dropped so far
        assert_eq!(0, count.load(Ordering::Relaxed));

        // retire another record, triggering a scan which deallocates all records
        local.retire_record(unsafe { Retired::new(Box::new(DropCount(&count))) });

        {
            let inner = local.inner();
            assert_eq!(0, inner.ops_count as usize);
            assert_eq!(0, inner.retired_bag.inner.len());
        }

        assert_eq!(THRESHOLD, count.load(Ordering::Relaxed));
    }

    #[test]
    #[cfg_attr(feature = "maximum-reclamation-freq", ignore)]
    fn drop_reclaims_remaining_records() {
        const BELOW_THRESHOLD: usize = SCAN_THRESHOLD as usize / 2;

        let count = AtomicUsize::new(0);
        let local = Local::new();

        (0..BELOW_THRESHOLD)
            .map(|_| Box::new(DropCount(&count)))
            .map(|record| unsafe { Retired::new(record) })
            .for_each(|retired| local.retire_record(retired));

        // all retired records are reclaimed when local is dropped
        mem::drop(local);
        assert_eq!(BELOW_THRESHOLD, count.load(Ordering::Relaxed));
    }
}
