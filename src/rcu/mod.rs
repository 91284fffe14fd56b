//! Epoch-based reclamation (component C, §4.C): quiescence-detection
//! reclamation offered in three flavors selectable at container
//! instantiation, plus a configurable deadlock check for mutating calls made
//! from inside a read-side critical section.
//!
//! Unlike hazard pointers (one process-wide domain, see [`crate::hp`]), each
//! container gets its own RCU domain, so [`Rcu`] is a cheap, `Arc`-backed
//! handle rather than a singleton: cloning it shares the same epoch counter,
//! reader registry and retire backend.

mod slots;

use core::sync::atomic::{AtomicU64, Ordering};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::backoff::Backoff;
use crate::error::DeadlockError;
use crate::reclaim::Retired;
use crate::rcu::slots::{EpochSlot, EpochSlotList};

////////////////////////////////////////////////////////////////////////////////////////////////////
// DeadlockPolicy
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What to do when a mutating operation is attempted while the calling
/// thread already holds a read-side critical section on the same domain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeadlockPolicy {
    /// Proceed anyway. Correct only if the operation cannot itself call
    /// `synchronize`; otherwise the thread waits on its own quiescence
    /// forever.
    NoCheck,
    /// Return a [`DeadlockError`] to the caller instead of proceeding.
    Throw,
    /// Abort the process (`std::process::abort`).
    Fatal,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Flavor
////////////////////////////////////////////////////////////////////////////////////////////////////

/// How retired records are drained back to their disposer once every reader
/// has quiesced.
pub enum Flavor {
    /// `synchronize` blocks the caller until every registered reader has
    /// passed a quiescent point; retired memory is freed synchronously on
    /// the caller's stack.
    Instant,
    /// Retired items accumulate in a bounded ring; `synchronize` runs
    /// implicitly once the ring is full, or explicitly on request.
    Buffered {
        /// Ring capacity before an implicit `synchronize` is triggered.
        capacity: usize,
    },
    /// A dedicated reclaimer thread drains the retire queue in the
    /// background, waking on new arrivals.
    Threaded,
}

enum Backend {
    Instant,
    Buffered { ring: Mutex<Vec<Retired>>, capacity: usize },
    Threaded(ThreadedBackend),
}

struct ThreadedBackend {
    queue: Mutex<VecDeque<Retired>>,
    cond: Condvar,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Rcu
////////////////////////////////////////////////////////////////////////////////////////////////////

struct Inner {
    epoch: AtomicU64,
    slots: EpochSlotList,
    deadlock_policy: DeadlockPolicy,
    backend: Backend,
}

/// A single RCU domain: one epoch counter, one reader registry, one retire
/// backend. Cheap to clone; every clone refers to the same domain.
#[derive(Clone)]
pub struct Rcu {
    inner: Arc<Inner>,
}

impl Rcu {
    /// Creates a new domain with the given flavor and deadlock policy.
    pub fn new(flavor: Flavor, deadlock_policy: DeadlockPolicy) -> Self {
        let backend = match flavor {
            Flavor::Instant => Backend::Instant,
            Flavor::Buffered { capacity } => {
                Backend::Buffered { ring: Mutex::new(Vec::with_capacity(capacity)), capacity }
            }
            Flavor::Threaded => Backend::Threaded(ThreadedBackend {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                shutdown: Arc::new(AtomicBool::new(false)),
                handle: Mutex::new(None),
            }),
        };
        let rcu = Self { inner: Arc::new(Inner { epoch: AtomicU64::new(0), slots: EpochSlotList::new(), deadlock_policy, backend }) };
        if let Backend::Threaded(threaded) = &rcu.inner.backend {
            let worker_domain = rcu.clone();
            let shutdown = Arc::clone(&threaded.shutdown);
            let handle = std::thread::Builder::new()
                .name("rcu-reclaimer".into())
                .spawn(move || reclaimer_loop(worker_domain, shutdown))
                .expect("failed to spawn RCU reclaimer thread");
            *threaded.handle.lock().unwrap() = Some(handle);
        }
        rcu
    }

    /// Enters a read-side critical section. Nested entry on the same thread
    /// is permitted and counted; the underlying epoch publication only
    /// happens on the outermost entry.
    #[inline]
    pub fn read(&self) -> ReadGuard {
        let epoch = self.inner.epoch.load(Ordering::Acquire);
        with_cache_entry(&self.inner, |slot, depth| {
            let d = depth.get();
            if d == 0 {
                slot.enter(epoch, Ordering::SeqCst);
            }
            depth.set(d + 1);
        });
        ReadGuard { domain: self.clone() }
    }

    /// `true` if the calling thread currently holds a read-side critical
    /// section on this domain.
    #[inline]
    pub fn is_read_locked(&self) -> bool {
        self.read_depth() > 0
    }

    fn read_depth(&self) -> u32 {
        let addr = Arc::as_ptr(&self.inner) as usize;
        CACHE.with(|cache| {
            cache
                .borrow()
                .iter()
                .find(|entry| entry.addr == addr)
                .map(|entry| entry.depth.get())
                .unwrap_or(0)
        })
    }

    /// Checks this domain's deadlock policy against the calling thread's
    /// current read-lock nesting depth, as every mutating operation must
    /// before proceeding (§7).
    pub fn check_deadlock(&self) -> Result<(), DeadlockError> {
        if !self.is_read_locked() {
            return Ok(());
        }
        match self.inner.deadlock_policy {
            DeadlockPolicy::NoCheck => Ok(()),
            DeadlockPolicy::Throw => Err(DeadlockError { depth: self.read_depth() }),
            DeadlockPolicy::Fatal => std::process::abort(),
        }
    }

    /// Retires a boxed record, handing it to this domain's backend according
    /// to its flavor.
    ///
    /// # Safety
    ///
    /// The caller must have already unlinked `boxed` from every structure
    /// reachable by other threads.
    pub unsafe fn retire<T: 'static>(&self, boxed: Box<T>) {
        let retired = Retired::new(boxed);
        match &self.inner.backend {
            Backend::Instant => {
                self.synchronize();
                retired.reclaim();
            }
            Backend::Buffered { ring, capacity } => {
                let full = {
                    let mut ring = ring.lock().unwrap();
                    ring.push(retired);
                    ring.len() >= *capacity
                };
                if full {
                    self.synchronize();
                }
            }
            Backend::Threaded(threaded) => {
                threaded.queue.lock().unwrap().push_back(retired);
                threaded.cond.notify_one();
            }
        }
    }

    /// Blocks the caller until every currently registered reader has passed
    /// a quiescent point at or after the epoch observed when this call
    /// began, then drains and reclaims whatever the active backend has
    /// accumulated (for [`Flavor::Threaded`], this only bumps the epoch;
    /// the reclaimer thread drains the queue independently).
    pub fn synchronize(&self) {
        let target = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let mut backoff = Backoff::new();
        while !self.inner.slots.all_advanced_past(target, Ordering::SeqCst) {
            backoff.spin();
        }

        if let Backend::Buffered { ring, .. } = &self.inner.backend {
            let drained = core::mem::take(&mut *ring.lock().unwrap());
            for retired in drained {
                unsafe { retired.reclaim() };
            }
        }
    }
}

fn reclaimer_loop(domain: Rcu, shutdown: Arc<AtomicBool>) {
    let threaded = match &domain.inner.backend {
        Backend::Threaded(threaded) => threaded,
        _ => return,
    };
    loop {
        let mut batch = {
            let mut queue = threaded.queue.lock().unwrap();
            while queue.is_empty() && !shutdown.load(Ordering::Acquire) {
                queue = threaded.cond.wait(queue).unwrap();
            }
            if queue.is_empty() && shutdown.load(Ordering::Acquire) {
                return;
            }
            core::mem::take(&mut *queue)
        };
        domain.synchronize();
        for retired in batch.drain(..) {
            unsafe { retired.reclaim() };
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Backend::Threaded(threaded) = &self.backend {
            threaded.shutdown.store(true, Ordering::Release);
            threaded.cond.notify_all();
            if let Some(handle) = threaded.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
            let mut remaining = threaded.queue.lock().unwrap();
            for retired in remaining.drain(..) {
                unsafe { retired.reclaim() };
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ReadGuard
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A scoped read-side critical section (§9's "RCU as a lifetime scope"):
/// construction publishes (or re-counts) this thread's entry into the
/// domain, destruction un-publishes (or decrements) it.
pub struct ReadGuard {
    domain: Rcu,
}

impl Drop for ReadGuard {
    #[inline]
    fn drop(&mut self) {
        with_cache_entry(&self.domain.inner, |slot, depth| {
            let d = depth.get();
            debug_assert!(d > 0);
            depth.set(d - 1);
            if d == 1 {
                slot.exit(Ordering::SeqCst);
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// per-thread slot cache
////////////////////////////////////////////////////////////////////////////////////////////////////

struct CacheEntry {
    addr: usize,
    // keeps `inner` (and therefore the storage behind `slot`) alive for as
    // long as this cache entry exists, which is what makes the `'static`
    // lifetime below sound despite `Inner` not actually being a static.
    _keep_alive: Arc<Inner>,
    slot: &'static EpochSlot,
    depth: Cell<u32>,
}

thread_local! {
    static CACHE: RefCell<Vec<CacheEntry>> = RefCell::new(Vec::new());
}

#[inline]
fn with_cache_entry<R>(inner: &Arc<Inner>, f: impl FnOnce(&EpochSlot, &Cell<u32>) -> R) -> R {
    let addr = Arc::as_ptr(inner) as usize;
    CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if let Some(entry) = cache.iter().find(|entry| entry.addr == addr) {
            return f(entry.slot, &entry.depth);
        }
        // SAFETY: `slot` only outlives `inner`'s storage for as long as
        // `_keep_alive` (an `Arc` clone of the same `Inner`) is also kept in
        // this cache entry; both are dropped together when the entry is
        // removed (thread exit, since this map never evicts early).
        let slot: &'static EpochSlot = unsafe { core::mem::transmute(inner.slots.acquire()) };
        cache.push(CacheEntry { addr, _keep_alive: Arc::clone(inner), slot, depth: Cell::new(0) });
        f(slot, &cache.last().unwrap().depth)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn nested_read_guards_count() {
        let rcu = Rcu::new(Flavor::Instant, DeadlockPolicy::NoCheck);
        assert!(!rcu.is_read_locked());
        let outer = rcu.read();
        assert!(rcu.is_read_locked());
        let inner = rcu.read();
        drop(inner);
        assert!(rcu.is_read_locked());
        drop(outer);
        assert!(!rcu.is_read_locked());
    }

    #[test]
    fn deadlock_policy_throw_detects_nested_mutation() {
        let rcu = Rcu::new(Flavor::Instant, DeadlockPolicy::Throw);
        assert!(rcu.check_deadlock().is_ok());
        let _guard = rcu.read();
        assert!(rcu.check_deadlock().is_err());
    }

    #[test]
    fn instant_retire_invokes_disposer_after_synchronize() {
        static DROPPED: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::Relaxed);
            }
        }

        let rcu = Rcu::new(Flavor::Instant, DeadlockPolicy::NoCheck);
        unsafe { rcu.retire(Box::new(Counted)) };
        assert_eq!(DROPPED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn buffered_retire_defers_until_capacity() {
        static DROPPED: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Ordering::Relaxed);
            }
        }

        let rcu = Rcu::new(Flavor::Buffered { capacity: 2 }, DeadlockPolicy::NoCheck);
        unsafe { rcu.retire(Box::new(Counted)) };
        assert_eq!(DROPPED.load(Ordering::Relaxed), 0);
        unsafe { rcu.retire(Box::new(Counted)) };
        assert_eq!(DROPPED.load(Ordering::Relaxed), 2);
    }
}
