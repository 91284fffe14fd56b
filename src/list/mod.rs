//! Ordered linked list (component E, §4.E): a Harris/Michael-style
//! lock-free sorted singly linked list, generalized from the lock-coupling
//! design this crate's tests started from into mark-bit logical deletion
//! protected by hazard pointers.
//!
//! The list itself is the foundation [`crate::split_list`] builds its
//! bit-reversed bucket chain on top of.

use core::sync::atomic::Ordering;

use crate::backoff::Backoff;
use crate::container::Extracted as RawExtracted;
use crate::counter::ItemCounter;
use crate::hp::{Guard, Hp};
use crate::stat::{Event, Stat};
use crate::sync::{Atomic, MarkedNonNull, MarkedPtr};

/// Number of tag bits a node's `next` pointer carries: bit 0 is the logical
/// deletion mark, bit 1 marks a node already owned by a live [`Extracted`]
/// handle so a concurrent helper physically unlinking it does not also
/// retire it.
pub(crate) const MARK_BITS: u32 = 2;

const DELETED: usize = 0b01;
const EXTRACTED: usize = 0b10;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Node
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Node<K> {
    pub(crate) key: K,
    pub(crate) next: Atomic<Node<K>, MARK_BITS>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Extracted
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Ownership of a key removed via [`OrderedListSet::extract`]; retires the
/// underlying node on drop.
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
// OrderedListSet
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent sorted set backed by a lock-free linked list.
pub struct OrderedListSet<K, C: ItemCounter = (), S: Stat = ()> {
    head: Atomic<Node<K>, MARK_BITS>,
    counter: C,
    stat: S,
}

impl<K, C: ItemCounter, S: Stat> Default for OrderedListSet<K, C, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, C: ItemCounter, S: Stat> OrderedListSet<K, C, S> {
    /// Creates a new, empty list.
    pub fn new() -> Self {
        Self { head: Atomic::null(), counter: C::default(), stat: S::default() }
    }

    /// Current element count, subject to the configured counter policy.
    #[inline]
    pub fn size(&self) -> usize {
        self.counter.get()
    }

    /// `true` if the list currently holds no elements (subject to the same
    /// caveat as [`OrderedListSet::size`]).
    #[inline]
    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// The list's head slot, for callers (the split-ordered set) that need
    /// a starting point for [`OrderedListSet::search_from`] and friends
    /// before any bucket dummy exists.
    pub(crate) fn head_slot(&self) -> *const Atomic<Node<K>, MARK_BITS> {
        &self.head
    }
}

struct Cursor<K> {
    /// Either `&self.head` or a protected node's `next` field; valid for as
    /// long as `prev_guard` protects its owning node (or forever, for
    /// `head`).
    prev_slot: *const Atomic<Node<K>, MARK_BITS>,
    #[allow(dead_code)]
    prev_guard: Guard<Node<K>, MARK_BITS>,
    curr: Option<MarkedNonNull<Node<K>, MARK_BITS>>,
    #[allow(dead_code)]
    curr_guard: Guard<Node<K>, MARK_BITS>,
    found: bool,
}

impl<K: Ord + 'static, C: ItemCounter, S: Stat> OrderedListSet<K, C, S> {
    /// Traverses the list looking for `key`, physically unlinking any
    /// logically deleted node it passes along the way (§4.E's search
    /// primitive).
    fn search(&self, key: &K) -> Cursor<K> {
        self.search_from(&self.head, key)
    }

    /// Like [`OrderedListSet::search`] but starts traversing from an
    /// arbitrary slot instead of the head, for callers (the split-ordered
    /// set) that cache a fast entry point into the middle of the list.
    ///
    /// # Safety contract
    ///
    /// `start` must point at a slot that is guaranteed live for as long as
    /// the call runs without itself needing hazard protection (e.g. a
    /// permanent dummy node's `next` field, which per §4.F is never
    /// retired).
    pub(crate) fn search_from(&self, start: *const Atomic<Node<K>, MARK_BITS>, key: &K) -> Cursor<K> {
        let _guard = crate::registry::attach();
        let mut backoff = Backoff::new();
        'retry: loop {
            let mut prev_slot: *const Atomic<Node<K>, MARK_BITS> = start;
            let mut prev_guard: Guard<Node<K>, MARK_BITS> = Guard::new();
            let mut curr_guard: Guard<Node<K>, MARK_BITS> = Guard::new();
            let mut curr = curr_guard.acquire(unsafe { &*prev_slot }, Ordering::Acquire);

            loop {
                let curr_ptr = match curr {
                    None => {
                        return Cursor { prev_slot, prev_guard, curr: None, curr_guard, found: false };
                    }
                    Some(ptr) => ptr,
                };

                let node = unsafe { curr_ptr.as_ref() };
                let next = node.next.load(Ordering::Acquire);
                let (next_ptr, mark) = next.decompose();

                if mark != 0 {
                    // `curr` is logically deleted; help finish the physical unlink.
                    let expected = MarkedPtr::compose(curr_ptr.decompose_ptr().as_ptr(), 0);
                    let unmarked_next = MarkedPtr::compose(next_ptr, 0);
                    let unlinked = unsafe {
                        (*prev_slot).compare_exchange(expected, unmarked_next, Ordering::Release, Ordering::Acquire)
                    };
                    match unlinked {
                        Ok(_) => {
                            self.stat.record(Event::PhysicalUnlink);
                            if mark & EXTRACTED == 0 {
                                // SAFETY: just unlinked from every structure reachable by
                                // other threads, and not claimed by a live `Extracted`.
                                unsafe { Hp::retire(Box::from_raw(curr_ptr.decompose_ptr().as_ptr())) };
                            }
                            curr_guard.release();
                            curr = curr_guard.acquire(unsafe { &*prev_slot }, Ordering::Acquire);
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
                    core::mem::swap(&mut prev_guard, &mut curr_guard);
                    prev_slot = &node.next;
                    curr = curr_guard.acquire(unsafe { &*prev_slot }, Ordering::Acquire);
                } else {
                    let found = &node.key == key;
                    return Cursor { prev_slot, prev_guard, curr: Some(curr_ptr), curr_guard, found };
                }
            }
        }
    }

    /// Inserts `key`. Returns `false` (without mutating) if it is already
    /// present.
    pub fn insert(&self, key: K) -> bool {
        self.insert_with(key, |_| {})
    }

    /// Like [`OrderedListSet::insert`] but calls `on_insert` with the newly
    /// linked key immediately after it becomes visible.
    pub fn insert_with<F: FnOnce(&K)>(&self, key: K, on_insert: F) -> bool {
        self.insert_with_from(&self.head, key, on_insert)
    }

    /// Like [`OrderedListSet::insert`] but searches from `start` (see
    /// [`OrderedListSet::search_from`]'s safety contract).
    pub(crate) fn insert_from(&self, start: *const Atomic<Node<K>, MARK_BITS>, key: K) -> bool {
        self.insert_with_from(start, key, |_| {})
    }

    /// Like [`OrderedListSet::insert_from`] but calls `on_insert` on success.
    pub(crate) fn insert_with_from<F: FnOnce(&K)>(
        &self,
        start: *const Atomic<Node<K>, MARK_BITS>,
        key: K,
        on_insert: F,
    ) -> bool {
        let new_node = Box::into_raw(Box::new(Node { key, next: Atomic::null() }));
        let mut backoff = Backoff::new();
        loop {
            let key_ref = unsafe { &(*new_node).key };
            let cursor = self.search_from(start, key_ref);
            if cursor.found {
                // SAFETY: never published; no other thread can have observed it.
                unsafe { drop(Box::from_raw(new_node)) };
                return false;
            }

            let next = cursor.curr.map(MarkedNonNull::into_marked_ptr).unwrap_or_else(MarkedPtr::null);
            unsafe { (*new_node).next.store(next, Ordering::Relaxed) };
            let desired = MarkedPtr::compose(new_node, 0);

            let result =
                unsafe { (*cursor.prev_slot).compare_exchange(next, desired, Ordering::Release, Ordering::Acquire) };
            match result {
                Ok(_) => {
                    self.counter.inc();
                    on_insert(unsafe { &(*new_node).key });
                    return true;
                }
                Err(_) => {
                    self.stat.record(Event::CasRetry);
                    backoff.spin();
                }
            }
        }
    }

    /// Removes `key`. Returns `false` if it was not present.
    pub fn erase(&self, key: &K) -> bool {
        self.erase_with(key, |_| {})
    }

    /// Like [`OrderedListSet::erase`] but calls `on_erase` with the removed
    /// key immediately before it is retired.
    pub fn erase_with<F: FnOnce(&K)>(&self, key: &K, on_erase: F) -> bool {
        self.erase_with_from(&self.head, key, on_erase)
    }

    /// Like [`OrderedListSet::erase`] but searches from `start`.
    pub(crate) fn erase_from(&self, start: *const Atomic<Node<K>, MARK_BITS>, key: &K) -> bool {
        self.erase_with_from(start, key, |_| {})
    }

    /// Like [`OrderedListSet::erase_from`] but calls `on_erase` on success.
    pub(crate) fn erase_with_from<F: FnOnce(&K)>(
        &self,
        start: *const Atomic<Node<K>, MARK_BITS>,
        key: &K,
        on_erase: F,
    ) -> bool {
        let mut backoff = Backoff::new();
        loop {
            let cursor = self.search_from(start, key);
            let curr = match (cursor.found, cursor.curr) {
                (true, Some(curr)) => curr,
                _ => return false,
            };

            let node = unsafe { curr.as_ref() };
            let next = node.next.load(Ordering::Acquire);
            if next.decompose_tag() != 0 {
                // someone else is already deleting this node; resolve by re-searching
                backoff.spin();
                continue;
            }

            let marked_next = next.with_tag(DELETED);
            match node.next.compare_exchange(next, marked_next, Ordering::Release, Ordering::Acquire) {
                Ok(_) => {
                    self.counter.dec();
                    self.stat.record(Event::MarkedNodeEncountered);
                    on_erase(&node.key);
                    // best-effort physical unlink; only the CAS that actually wins it
                    // retires `curr`, since a racing helper in `search_from` may have
                    // already unlinked (and retired) it first.
                    let expected = MarkedPtr::compose(curr.decompose_ptr().as_ptr(), 0);
                    let own_unlink = unsafe {
                        (*cursor.prev_slot).compare_exchange(expected, next, Ordering::Release, Ordering::Acquire)
                    };
                    if own_unlink.is_ok() {
                        self.stat.record(Event::PhysicalUnlink);
                        unsafe { Hp::retire(Box::from_raw(curr.decompose_ptr().as_ptr())) };
                    }
                    return true;
                }
                Err(_) => {
                    self.stat.record(Event::CasRetry);
                    backoff.spin();
                }
            }
        }
    }

    /// Removes `key` and returns ownership of it, or `None` if absent.
    pub fn extract(&self, key: &K) -> Option<Extracted<K>> {
        self.extract_from(&self.head, key)
    }

    /// Like [`OrderedListSet::extract`] but searches from `start`.
    pub(crate) fn extract_from(&self, start: *const Atomic<Node<K>, MARK_BITS>, key: &K) -> Option<Extracted<K>> {
        let mut backoff = Backoff::new();
        loop {
            let cursor = self.search_from(start, key);
            let curr = match (cursor.found, cursor.curr) {
                (true, Some(curr)) => curr,
                _ => return None,
            };

            let node = unsafe { curr.as_ref() };
            let next = node.next.load(Ordering::Acquire);
            if next.decompose_tag() != 0 {
                backoff.spin();
                continue;
            }

            let marked_next = next.with_tag(DELETED | EXTRACTED);
            match node.next.compare_exchange(next, marked_next, Ordering::Release, Ordering::Acquire) {
                Ok(_) => {
                    self.counter.dec();
                    self.stat.record(Event::MarkedNodeEncountered);
                    let expected = MarkedPtr::compose(curr.decompose_ptr().as_ptr(), 0);
                    // SAFETY: the mark carries `EXTRACTED`, so neither this
                    // best-effort unlink nor any racing helper in `search_from`
                    // retires `curr` — `Extracted`'s drop is the unique retirer,
                    // whether or not the CAS below succeeds.
                    let _ = unsafe { (*cursor.prev_slot).compare_exchange(expected, next, Ordering::Release, Ordering::Acquire) };
                    return Some(Extracted { inner: unsafe { RawExtracted::new(curr.decompose_ptr().as_ptr()) } });
                }
                Err(_) => {
                    self.stat.record(Event::CasRetry);
                    backoff.spin();
                }
            }
        }
    }

    /// Reports whether `key` is present, physically unlinking any marked
    /// nodes encountered along the way.
    pub fn contains(&self, key: &K) -> bool {
        self.search(key).found
    }

    /// Like [`OrderedListSet::contains`] but searches from `start`.
    pub(crate) fn contains_from(&self, start: *const Atomic<Node<K>, MARK_BITS>, key: &K) -> bool {
        self.search_from(start, key).found
    }

    /// Finds `key` and calls `f` with it if present. Returns `true` iff found.
    pub fn find<F: FnOnce(&K)>(&self, key: &K, f: F) -> bool {
        self.find_from(&self.head, key, f)
    }

    /// Like [`OrderedListSet::find`] but searches from `start`.
    pub(crate) fn find_from<F: FnOnce(&K)>(&self, start: *const Atomic<Node<K>, MARK_BITS>, key: &K, f: F) -> bool {
        let cursor = self.search_from(start, key);
        match (cursor.found, cursor.curr) {
            (true, Some(curr)) => {
                f(&unsafe { curr.as_ref() }.key);
                true
            }
            _ => false,
        }
    }

    /// Finds the live node holding a key equal to `key`, inserting it first
    /// if absent, and returns a pointer to it. Intended for permanent
    /// entries (e.g. split-list bucket dummies) that are never erased, so
    /// the returned pointer stays valid without further hazard protection.
    pub(crate) fn find_or_insert_from(&self, start: *const Atomic<Node<K>, MARK_BITS>, key: K) -> *const Node<K>
    where
        K: Clone,
    {
        loop {
            let cursor = self.search_from(start, &key);
            if cursor.found {
                if let Some(curr) = cursor.curr {
                    return curr.decompose_ptr().as_ptr();
                }
            }

            let new_node = Box::into_raw(Box::new(Node { key: key.clone(), next: Atomic::null() }));
            let next = cursor.curr.map(MarkedNonNull::into_marked_ptr).unwrap_or_else(MarkedPtr::null);
            unsafe { (*new_node).next.store(next, Ordering::Relaxed) };
            let desired = MarkedPtr::compose(new_node, 0);
            let result =
                unsafe { (*cursor.prev_slot).compare_exchange(next, desired, Ordering::Release, Ordering::Acquire) };
            match result {
                Ok(_) => {
                    self.counter.inc();
                    return new_node as *const Node<K>;
                }
                Err(_) => {
                    unsafe { drop(Box::from_raw(new_node)) };
                }
            }
        }
    }

    /// Combines lookup, optional insertion and a user callback in one
    /// traversal: `f` is called with `(is_new, existing, input)` (§6's
    /// `update` entry).
    pub fn update<F>(&self, key: K, allow_insert: bool, f: F) -> bool
    where
        F: FnOnce(bool, Option<&K>, &K),
    {
        self.update_from(&self.head, key, allow_insert, f)
    }

    /// Like [`OrderedListSet::update`] but searches from `start`.
    pub(crate) fn update_from<F>(
        &self,
        start: *const Atomic<Node<K>, MARK_BITS>,
        key: K,
        allow_insert: bool,
        f: F,
    ) -> bool
    where
        F: FnOnce(bool, Option<&K>, &K),
    {
        let cursor = self.search_from(start, &key);
        if cursor.found {
            let node = unsafe { cursor.curr.expect("found implies curr").as_ref() };
            f(false, Some(&node.key), &key);
            true
        } else if allow_insert {
            f(true, None, &key);
            drop(cursor);
            self.insert_from(start, key)
        } else {
            false
        }
    }

    /// Removes every element. Not atomic with respect to concurrent
    /// inserts racing the same call.
    pub fn clear(&self) {
        let _guard = crate::registry::attach();
        let old = self.head.swap(MarkedPtr::null(), Ordering::AcqRel);
        let mut curr = old.decompose_ptr();
        while let Some(ptr) = core::ptr::NonNull::new(curr) {
            let node = unsafe { ptr.as_ref() };
            let next = node.next.load(Ordering::Relaxed).decompose_ptr();
            if node.next.load(Ordering::Relaxed).decompose_tag() == 0 {
                self.counter.dec();
            }
            unsafe { Hp::retire(Box::from_raw(ptr.as_ptr())) };
            curr = next;
        }
        self.counter.reset();
    }

    /// A read-only snapshot-style iterator; skips nodes observed logically
    /// deleted without attempting to physically unlink them.
    pub fn iter(&self) -> Iter<'_, K, C, S>
    where
        K: Clone,
    {
        Iter { list: self, _registry: crate::registry::attach(), guard: Guard::new(), slot: &self.head }
    }
}

impl<K, C: ItemCounter, S: Stat> Drop for OrderedListSet<K, C, S> {
    fn drop(&mut self) {
        let mut curr = self.head.load(Ordering::Relaxed).decompose_ptr();
        while let Some(ptr) = core::ptr::NonNull::new(curr) {
            unsafe {
                let node = Box::from_raw(ptr.as_ptr());
                curr = node.next.load(Ordering::Relaxed).decompose_ptr();
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Iter
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A read-only snapshot iterator over an [`OrderedListSet`].
pub struct Iter<'a, K, C: ItemCounter, S: Stat> {
    // borrow-checker enforced: the list's `Drop` frees nodes outright, so an
    // iterator (which holds no hazard pointer of its own between `next`
    // calls) must not be able to outlive the list.
    #[allow(dead_code)]
    list: &'a OrderedListSet<K, C, S>,
    _registry: crate::registry::RegistryGuard,
    guard: Guard<Node<K>, MARK_BITS>,
    slot: *const Atomic<Node<K>, MARK_BITS>,
}

impl<'a, K: Ord + Clone + 'static, C: ItemCounter, S: Stat> Iterator for Iter<'a, K, C, S> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        loop {
            let curr = self.guard.acquire(unsafe { &*self.slot }, Ordering::Acquire)?;
            let node = unsafe { curr.as_ref() };
            let next = node.next.load(Ordering::Acquire);
            self.slot = &node.next;
            if next.decompose_tag() != 0 {
                continue;
            }
            return Some(node.key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_erase_roundtrip() {
        let list: OrderedListSet<i32> = OrderedListSet::new();
        assert!(list.insert(5));
        assert!(list.insert(3));
        assert!(!list.insert(3));
        assert!(list.contains(&3));
        assert!(list.erase(&3));
        assert!(!list.contains(&3));
        assert!(!list.erase(&3));
    }

    #[test]
    fn iteration_is_sorted() {
        let list: OrderedListSet<i32> = OrderedListSet::new();
        for k in [5, 3, 8, 1, 9, 4] {
            assert!(list.insert(k));
        }
        let collected: Vec<i32> = list.iter().collect();
        assert_eq!(collected, vec![1, 3, 4, 5, 8, 9]);

        assert!(list.erase(&5));
        let collected: Vec<i32> = list.iter().collect();
        assert_eq!(collected, vec![1, 3, 4, 8, 9]);
    }

    #[test]
    fn size_tracks_with_atomic_counter() {
        use crate::counter::AtomicCounter;
        let list: OrderedListSet<i32, AtomicCounter> = OrderedListSet::new();
        for k in 0..10 {
            list.insert(k);
        }
        assert_eq!(list.size(), 10);
        for k in 0..5 {
            list.erase(&k);
        }
        assert_eq!(list.size(), 5);
        list.clear();
        assert_eq!(list.size(), 0);
        assert!(list.empty());
    }

    #[test]
    fn insert_with_and_erase_with_invoke_functor() {
        let list: OrderedListSet<i32> = OrderedListSet::new();
        let mut inserted = None;
        assert!(list.insert_with(4, |k| inserted = Some(*k)));
        assert_eq!(inserted, Some(4));

        let mut found = None;
        assert!(list.find(&4, |k| found = Some(*k)));
        assert_eq!(found, Some(4));
        assert!(!list.find(&9, |_| panic!("must not be called")));

        let mut erased = None;
        assert!(list.erase_with(&4, |k| erased = Some(*k)));
        assert_eq!(erased, Some(4));
        assert!(!list.contains(&4));
    }

    #[test]
    fn extract_hands_back_sole_ownership() {
        let list: OrderedListSet<i32> = OrderedListSet::new();
        for k in [1, 2, 3] {
            list.insert(k);
        }
        let extracted = list.extract(&2).expect("2 is present");
        assert_eq!(*extracted, 2);
        assert!(!list.contains(&2));
        drop(extracted);
        assert!(list.extract(&2).is_none());
    }

    #[test]
    fn update_inserts_when_allowed() {
        let list: OrderedListSet<i32> = OrderedListSet::new();
        let mut saw_new = false;
        assert!(list.update(7, true, |is_new, existing, _| {
            saw_new = is_new;
            assert!(existing.is_none());
        }));
        assert!(saw_new);
        assert!(list.contains(&7));

        let mut saw_existing = false;
        assert!(list.update(7, false, |is_new, existing, _| {
            saw_existing = !is_new;
            assert_eq!(existing, Some(&7));
        }));
        assert!(saw_existing);
    }

    #[test]
    fn concurrent_insert_and_erase() {
        use std::sync::Arc;
        use std::thread;

        let list = Arc::new(OrderedListSet::<i32>::new());
        for k in (1..1000).step_by(2) {
            list.insert(k);
        }

        let inserter = {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                for k in (0..1000).step_by(2) {
                    list.insert(k);
                }
            })
        };
        let eraser = {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                for k in (1..1000).step_by(2) {
                    list.erase(&k);
                }
            })
        };
        inserter.join().unwrap();
        eraser.join().unwrap();

        for k in (0..1000).step_by(2) {
            assert!(list.contains(&k), "missing even key {k}");
        }
        for k in (1..1000).step_by(2) {
            assert!(!list.contains(&k), "odd key {k} should have been erased");
        }
    }
}
