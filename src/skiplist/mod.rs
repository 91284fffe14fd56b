//! Lock-free skip-list set (component G, §4.G), grounded on the tower
//! layout and help-unlink traversal of the retrieved `skip_list_rcu.h`,
//! adapted from its RCU-protected reads onto this crate's hazard pointers.
//!
//! Simplification versus the original: rather than maintaining a per-node
//! `unlink_counter` and draining a thread-local deletion chain at scope
//! exit, a node is retired exactly once, inline, by whichever traversal's
//! help-unlink CAS physically detaches it at level 0 — hazard-pointer
//! retirement is already O(1) per node, so the batching the original used
//! to amortize its RCU grace periods has nothing to amortize here.

pub mod generator;

use core::sync::atomic::Ordering;

use crate::backoff::Backoff;
use crate::container::Extracted as RawExtracted;
use crate::counter::ItemCounter;
use crate::hp::{Guard, Hp};
use crate::stat::{Event, Stat};
use crate::sync::{Atomic, MarkedNonNull, MarkedPtr};

pub use self::generator::{LevelGenerator, Turbo16, Turbo24, Turbo32, Xorshift16, Xorshift24, Xorshift32};
use self::generator::MAX_HEIGHT;

const MARK_BITS: u32 = 2;

/// Logically deleted: ordinary `erase`, physically unlinked and retired by
/// whichever traversal's help-unlink CAS detaches it.
const DELETED: usize = 0b01;
/// Logically deleted *and* already owned by a live [`Extracted`] handle;
/// the help-unlink path must detach it without retiring it a second time.
const EXTRACTED: usize = 0b10;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Node<K> {
    pub(crate) key: K,
    height: u32,
    next: Box<[Atomic<Node<K>, MARK_BITS>]>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Extracted
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Ownership of a key removed via [`SkipListSet::extract_min`] or
/// [`SkipListSet::extract_max`]; retires the underlying node on drop.
pub struct Extracted<K: 'static> {
    inner: RawExtracted<Node<K>>,
}

impl<K: 'static> core::ops::Deref for Extracted<K> {
    type Target = K;
    fn deref(&self) -> &K {
        &self.inner.key
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// SkipListSet
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent sorted set backed by a lock-free skip list.
pub struct SkipListSet<K, G: LevelGenerator = Xorshift32, C: ItemCounter = (), S: Stat = ()> {
    head: Box<[Atomic<Node<K>, MARK_BITS>]>,
    generator: G,
    counter: C,
    stat: S,
}

impl<K, G: LevelGenerator, C: ItemCounter, S: Stat> Default for SkipListSet<K, G, C, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, G: LevelGenerator, C: ItemCounter, S: Stat> SkipListSet<K, G, C, S> {
    /// Creates a new, empty skip list.
    pub fn new() -> Self {
        let head = (0..MAX_HEIGHT).map(|_| Atomic::null()).collect();
        Self { head, generator: G::default(), counter: C::default(), stat: S::default() }
    }

    /// Current element count, subject to the configured counter policy.
    pub fn size(&self) -> usize {
        self.counter.get()
    }

    /// `true` if the set currently holds no elements.
    pub fn empty(&self) -> bool {
        self.size() == 0
    }
}

/// The per-level predecessor/successor snapshot [`SkipListSet::find_position`]
/// builds while descending the tower.
struct Position<K> {
    preds: Vec<*const Atomic<Node<K>, MARK_BITS>>,
    #[allow(dead_code)]
    pred_guards: Vec<Guard<Node<K>, MARK_BITS>>,
    succs: Vec<Option<MarkedNonNull<Node<K>, MARK_BITS>>>,
    #[allow(dead_code)]
    succ_guards: Vec<Guard<Node<K>, MARK_BITS>>,
    found: bool,
}

impl<K: Ord + 'static, G: LevelGenerator, C: ItemCounter, S: Stat> SkipListSet<K, G, C, S> {
    /// Descends every level from [`MAX_HEIGHT`] to `1`, recording
    /// `(pred, succ)` at each and helping physically unlink any node found
    /// logically deleted at the level it is visited, per §4.G.
    fn find_position(&self, key: &K) -> Position<K> {
        let _guard = crate::registry::attach();
        let mut backoff = Backoff::new();
        'retry: loop {
            let levels = MAX_HEIGHT as usize;
            let mut preds: Vec<*const Atomic<Node<K>, MARK_BITS>> = vec![core::ptr::null(); levels];
            let mut pred_guards: Vec<Guard<Node<K>, MARK_BITS>> = (0..levels).map(|_| Guard::new()).collect();
            let mut succs: Vec<Option<MarkedNonNull<Node<K>, MARK_BITS>>> = vec![None; levels];
            let mut succ_guards: Vec<Guard<Node<K>, MARK_BITS>> = (0..levels).map(|_| Guard::new()).collect();
            let mut found = false;

            let mut pred_slot: *const Atomic<Node<K>, MARK_BITS> = &self.head[levels - 1];
            let mut pred_guard: Guard<Node<K>, MARK_BITS> = Guard::new();

            for level in (1..=levels).rev() {
                let idx = level - 1;
                let mut curr_guard: Guard<Node<K>, MARK_BITS> = Guard::new();
                let mut curr = curr_guard.acquire(unsafe { &*pred_slot }, Ordering::Acquire);

                loop {
                    let curr_ptr = match curr {
                        None => break,
                        Some(ptr) => ptr,
                    };
                    let node = unsafe { curr_ptr.as_ref() };
                    if idx >= node.next.len() {
                        // this node's tower doesn't reach this level; treat as absent here.
                        break;
                    }
                    let next = node.next[idx].load(Ordering::Acquire);
                    let (next_raw, mark) = next.decompose();

                    if mark != 0 {
                        let expected = MarkedPtr::compose(curr_ptr.decompose_ptr().as_ptr(), 0);
                        let unmarked_next = MarkedPtr::compose(next_raw, 0);
                        let unlinked = unsafe {
                            (*pred_slot).compare_exchange(expected, unmarked_next, Ordering::Release, Ordering::Acquire)
                        };
                        match unlinked {
                            Ok(_) => {
                                self.stat.record(Event::PhysicalUnlink);
                                if idx == 0 && mark & EXTRACTED == 0 {
                                    // the thread that unlinks at level 0 is the unique retirer,
                                    // unless the node was already claimed by an `Extracted`
                                    // handle, which retires it itself on drop.
                                    unsafe { Hp::retire(Box::from_raw(curr_ptr.decompose_ptr().as_ptr())) };
                                }
                                curr_guard.release();
                                curr = curr_guard.acquire(unsafe { &*pred_slot }, Ordering::Acquire);
                                continue;
                            }
                            Err(_) => {
                                self.stat.record(Event::CasRetry);
                                backoff.spin();
                                continue 'retry;
                            }
                        }
                    }

                    if &node.key < key {
                        core::mem::swap(&mut pred_guard, &mut curr_guard);
                        pred_slot = &node.next[idx];
                        curr = curr_guard.acquire(unsafe { &*pred_slot }, Ordering::Acquire);
                    } else {
                        found = &node.key == key;
                        break;
                    }
                }

                preds[idx] = pred_slot;
                pred_guards[idx] = pred_guard.clone();
                succs[idx] = curr;
                succ_guards[idx] = curr_guard;
            }

            return Position { preds, pred_guards, succs, succ_guards, found };
        }
    }

    /// Inserts `key` with a freshly drawn random tower height. Returns
    /// `false` (without mutating) if it is already present.
    pub fn insert(&self, key: K) -> bool {
        self.insert_with(key, |_| {})
    }

    /// Like [`SkipListSet::insert`] but calls `on_insert` with the newly
    /// linked key immediately after its level-0 link becomes visible.
    pub fn insert_with<F: FnOnce(&K)>(&self, key: K, on_insert: F) -> bool {
        let height = self.generator.next_level().min(MAX_HEIGHT);
        let node = Box::into_raw(Box::new(Node {
            key,
            height,
            next: (0..height).map(|_| Atomic::null()).collect(),
        }));
        let mut backoff = Backoff::new();

        loop {
            let key_ref = unsafe { &(*node).key };
            let pos = self.find_position(key_ref);
            if pos.found {
                // SAFETY: never published.
                unsafe { drop(Box::from_raw(node)) };
                return false;
            }

            let succ0 = pos.succs[0].map(MarkedNonNull::into_marked_ptr).unwrap_or_else(MarkedPtr::null);
            unsafe { (*node).next[0].store(succ0, Ordering::Relaxed) };
            let desired0 = MarkedPtr::compose(node, 0);
            let linked = unsafe { (*pos.preds[0]).compare_exchange(succ0, desired0, Ordering::Release, Ordering::Acquire) };
            if linked.is_err() {
                self.stat.record(Event::CasRetry);
                backoff.spin();
                continue;
            }
            self.counter.inc();
            on_insert(unsafe { &(*node).key });
            break;
        }

        // Best-effort: link the remaining levels, abandoning if a concurrent
        // deleter marks the node at level 0 before a higher level links.
        let height = unsafe { (*node).height } as usize;
        for idx in 1..height {
            loop {
                if unsafe { (*node).next[0].load(Ordering::Acquire) }.decompose_tag() != 0 {
                    return true;
                }
                let key_ref = unsafe { &(*node).key };
                let pos = self.find_position(key_ref);
                let succ = pos.succs[idx].map(MarkedNonNull::into_marked_ptr).unwrap_or_else(MarkedPtr::null);
                unsafe { (*node).next[idx].store(succ, Ordering::Relaxed) };
                let desired = MarkedPtr::compose(node, 0);
                let linked =
                    unsafe { (*pos.preds[idx]).compare_exchange(succ, desired, Ordering::Release, Ordering::Acquire) };
                match linked {
                    Ok(_) => break,
                    Err(_) => {
                        self.stat.record(Event::CasRetry);
                        backoff.spin();
                    }
                }
            }
        }
        true
    }

    /// Marks `node`'s tower for deletion top-down, then attempts the unique
    /// level-0 mark. Returns `true` iff this call performed that final mark
    /// (i.e. this call is the logical deleter). When `extracted` is `true`
    /// the level-0 mark also carries [`EXTRACTED`], telling every
    /// [`Self::find_position`] helper that physically unlinks this node not
    /// to retire it — the caller (an `extract_min`/`extract_max` handle)
    /// owns that retirement instead.
    fn mark_for_deletion(&self, node: &Node<K>, extracted: bool) -> bool {
        let tag = if extracted { DELETED | EXTRACTED } else { DELETED };
        let mut backoff = Backoff::new();
        for idx in (1..node.next.len()).rev() {
            loop {
                let next = node.next[idx].load(Ordering::Acquire);
                if next.decompose_tag() != 0 {
                    break;
                }
                match node.next[idx].compare_exchange(next, next.with_tag(tag), Ordering::Release, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(_) => backoff.spin(),
                }
            }
        }
        loop {
            let next0 = node.next[0].load(Ordering::Acquire);
            if next0.decompose_tag() != 0 {
                return false;
            }
            match node.next[0].compare_exchange(next0, next0.with_tag(tag), Ordering::Release, Ordering::Acquire) {
                Ok(_) => {
                    self.counter.dec();
                    self.stat.record(Event::MarkedNodeEncountered);
                    return true;
                }
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Removes `key`. Returns `false` if it was not present.
    pub fn erase(&self, key: &K) -> bool {
        self.erase_with(key, |_| {})
    }

    /// Removes `key`, invoking `on_erase` with the removed key immediately
    /// before it is retired. Returns `false` if it was not present.
    pub fn erase_with(&self, key: &K, on_erase: impl FnOnce(&K)) -> bool {
        let pos = self.find_position(key);
        let node_ptr = match (pos.found, pos.succs[0]) {
            (true, Some(ptr)) => ptr.decompose_ptr().as_ptr(),
            _ => return false,
        };
        let deleted = self.mark_for_deletion(unsafe { &*node_ptr }, false);
        if deleted {
            on_erase(unsafe { &(*node_ptr).key });
            // help finish the physical unlink (and retirement) immediately.
            let _ = self.find_position(key);
        }
        deleted
    }

    /// Removes `key` and returns ownership of it, or `None` if absent.
    pub fn extract(&self, key: &K) -> Option<Extracted<K>> {
        loop {
            let pos = self.find_position(key);
            let node_ptr = match (pos.found, pos.succs[0]) {
                (true, Some(ptr)) => ptr.decompose_ptr().as_ptr(),
                _ => return None,
            };
            if self.mark_for_deletion(unsafe { &*node_ptr }, true) {
                let _ = self.find_position(key);
                return Some(Extracted { inner: unsafe { RawExtracted::new(node_ptr) } });
            }
        }
    }

    /// Reports whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.find_position(key).found
    }

    /// Finds `key` and calls `f` with it if present. Returns `true` iff found.
    pub fn find(&self, key: &K, f: impl FnOnce(&K)) -> bool {
        let pos = self.find_position(key);
        match (pos.found, pos.succs[0]) {
            (true, Some(ptr)) => {
                f(&unsafe { ptr.as_ref() }.key);
                true
            }
            _ => false,
        }
    }

    /// Combines lookup, optional insertion and a user callback in one
    /// traversal: `f` is called with `(is_new, existing, input)` (§6's
    /// `update` entry).
    pub fn update(&self, key: K, allow_insert: bool, f: impl FnOnce(bool, Option<&K>, &K)) -> bool {
        let pos = self.find_position(&key);
        if pos.found {
            let node = unsafe { pos.succs[0].expect("found implies a successor").as_ref() };
            f(false, Some(&node.key), &key);
            true
        } else if allow_insert {
            f(true, None, &key);
            drop(pos);
            self.insert(key)
        } else {
            false
        }
    }

    /// Removes and returns the smallest key, or `None` if the set is empty.
    pub fn extract_min(&self) -> Option<Extracted<K>> {
        let _registry = crate::registry::attach();
        loop {
            let mut guard: Guard<Node<K>, MARK_BITS> = Guard::new();
            let mut curr = guard.acquire(&self.head[0], Ordering::Acquire);
            let node_ptr = loop {
                match curr {
                    None => return None,
                    Some(ptr) => {
                        let node = unsafe { ptr.as_ref() };
                        if node.next[0].load(Ordering::Acquire).decompose_tag() != 0 {
                            curr = guard.acquire(&node.next[0], Ordering::Acquire);
                            continue;
                        }
                        break ptr.decompose_ptr().as_ptr();
                    }
                }
            };

            if self.mark_for_deletion(unsafe { &*node_ptr }, true) {
                let key_ref = unsafe { &(*node_ptr).key };
                let _ = self.find_position(key_ref);
                // SAFETY: the level-0 mark carries `EXTRACTED`, so whichever
                // thread's help-unlink CAS physically detaches this node
                // (this call's own `find_position` above, or a later one)
                // skips retiring it; `Extracted`'s drop is therefore the
                // unique retirer.
                return Some(Extracted { inner: unsafe { RawExtracted::new(node_ptr) } });
            }
        }
    }

    /// Removes and returns the largest key, or `None` if the set is empty.
    pub fn extract_max(&self) -> Option<Extracted<K>> {
        let _registry = crate::registry::attach();
        loop {
            let mut guard: Guard<Node<K>, MARK_BITS> = Guard::new();
            let mut last_guard: Guard<Node<K>, MARK_BITS> = Guard::new();
            let mut curr = guard.acquire(&self.head[0], Ordering::Acquire);
            let mut last_ptr: Option<*mut Node<K>> = None;

            loop {
                match curr {
                    None => break,
                    Some(ptr) => {
                        let node = unsafe { ptr.as_ref() };
                        if node.next[0].load(Ordering::Acquire).decompose_tag() == 0 {
                            last_ptr = Some(ptr.decompose_ptr().as_ptr());
                            core::mem::swap(&mut last_guard, &mut guard);
                        }
                        curr = guard.acquire(&node.next[0], Ordering::Acquire);
                    }
                }
            }

            let node_ptr = match last_ptr {
                Some(p) => p,
                None => return None,
            };
            if self.mark_for_deletion(unsafe { &*node_ptr }, true) {
                let key_ref = unsafe { &(*node_ptr).key };
                let _ = self.find_position(key_ref);
                return Some(Extracted { inner: unsafe { RawExtracted::new(node_ptr) } });
            }
        }
    }

    /// Removes every element. Not atomic with respect to concurrent inserts
    /// racing the same call.
    pub fn clear(&self) {
        let _guard = crate::registry::attach();
        for level in &self.head[1..] {
            level.store(MarkedPtr::null(), Ordering::Relaxed);
        }
        let old = self.head[0].swap(MarkedPtr::null(), Ordering::AcqRel);
        let mut curr = old.decompose_ptr();
        while let Some(ptr) = core::ptr::NonNull::new(curr) {
            let node = unsafe { ptr.as_ref() };
            let next = node.next[0].load(Ordering::Relaxed).decompose_ptr();
            unsafe { Hp::retire(Box::from_raw(ptr.as_ptr())) };
            curr = next;
        }
        self.counter.reset();
    }
}

impl<K, G: LevelGenerator, C: ItemCounter, S: Stat> Drop for SkipListSet<K, G, C, S> {
    fn drop(&mut self) {
        let mut curr = self.head[0].load(Ordering::Relaxed).decompose_ptr();
        while let Some(ptr) = core::ptr::NonNull::new(curr) {
            unsafe {
                let node = Box::from_raw(ptr.as_ptr());
                curr = node.next[0].load(Ordering::Relaxed).decompose_ptr();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::AtomicCounter;

    #[test]
    fn insert_contains_erase_roundtrip() {
        let set: SkipListSet<i32, Xorshift32, AtomicCounter> = SkipListSet::new();
        for k in [5, 3, 8, 1, 9, 4] {
            assert!(set.insert(k));
        }
        assert!(!set.insert(3));
        assert_eq!(set.size(), 6);
        for k in [5, 3, 8, 1, 9, 4] {
            assert!(set.contains(&k));
        }
        assert!(set.erase(&3));
        assert!(!set.contains(&3));
        assert!(!set.erase(&3));
        assert_eq!(set.size(), 5);
    }

    #[test]
    fn functor_variants_see_the_right_key() {
        let set: SkipListSet<i32, Xorshift32, AtomicCounter> = SkipListSet::new();
        let mut seen = None;
        assert!(set.insert_with(7, |k| seen = Some(*k)));
        assert_eq!(seen, Some(7));

        seen = None;
        assert!(set.find(&7, |k| seen = Some(*k)));
        assert_eq!(seen, Some(7));

        let extracted = set.extract(&7).expect("7 is present");
        assert_eq!(*extracted, 7);
        assert!(!set.contains(&7));
        drop(extracted);

        assert!(set.update(7, true, |is_new, existing, _| {
            assert!(is_new);
            assert!(existing.is_none());
        }));
        let mut erased = None;
        assert!(set.erase_with(&7, |k| erased = Some(*k)));
        assert_eq!(erased, Some(7));
    }

    #[test]
    fn extract_min_and_max_drain_in_order() {
        let set: SkipListSet<i32, Xorshift32, AtomicCounter> = SkipListSet::new();
        for k in [10, 20, 30] {
            set.insert(k);
        }
        assert_eq!(*set.extract_min().unwrap(), 10);
        assert_eq!(*set.extract_min().unwrap(), 20);
        assert_eq!(*set.extract_max().unwrap(), 30);
        assert!(set.empty());
        assert!(set.extract_min().is_none());
    }

    #[test]
    fn level_subset_property_holds_after_churn() {
        let set: SkipListSet<i32, Xorshift32, AtomicCounter> = SkipListSet::new();
        for k in 0..200 {
            set.insert(k);
        }
        for k in (0..200).step_by(3) {
            set.erase(&k);
        }
        let mut expected = 0;
        for k in 0..200 {
            if k % 3 != 0 {
                assert!(set.contains(&k));
                expected += 1;
            } else {
                assert!(!set.contains(&k));
            }
        }
        assert_eq!(set.size(), expected);
    }

    #[test]
    fn concurrent_insert_and_erase() {
        use std::sync::Arc;
        use std::thread;

        let set = Arc::new(SkipListSet::<i32, Xorshift32, AtomicCounter>::new());
        for k in (1..500).step_by(2) {
            set.insert(k);
        }
        let inserter = {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                for k in (0..500).step_by(2) {
                    set.insert(k);
                }
            })
        };
        let eraser = {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                for k in (1..500).step_by(2) {
                    set.erase(&k);
                }
            })
        };
        inserter.join().unwrap();
        eraser.join().unwrap();

        for k in (0..500).step_by(2) {
            assert!(set.contains(&k));
        }
        for k in (1..500).step_by(2) {
            assert!(!set.contains(&k));
        }
    }
}
