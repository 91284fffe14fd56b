//! Split-ordered hash set (component F, §4.F): a resizable hash set layered
//! directly on [`crate::list`]'s lock-free ordered list, keyed by the
//! bit-reversed hash of the user key so that growing the bucket table never
//! disturbs already-linked items.
//!
//! Grounded on the same split-ordered-list technique as
//! `hash_table/split_ordered_list.rs` and its `growable_array.rs` bucket
//! table in the retrieved homework set, adapted from crossbeam-epoch onto
//! this crate's hazard-pointer list.

mod table;

use core::cmp::Ordering as CmpOrdering;
use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::hash_map::DefaultHasher;

use crate::counter::ItemCounter;
use crate::list::{Extracted as ListExtracted, Node, OrderedListSet};
use crate::stat::Stat;

use self::table::BucketTable;

const LOAD_FACTOR: usize = 4;
const INITIAL_CAPACITY: usize = 2;

////////////////////////////////////////////////////////////////////////////////////////////////////
// SplitKey
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The ordered-list key a [`SplitOrderedSet`] actually stores: either a
/// bucket dummy (permanent, never erased) or a real user value, tagged by a
/// bit-reversed sort value that places every dummy before any real item
/// sharing its reversed prefix.
enum SplitKey<K> {
    Dummy(u64),
    Real(u64, K),
}

impl<K: Clone> Clone for SplitKey<K> {
    fn clone(&self) -> Self {
        match self {
            SplitKey::Dummy(v) => SplitKey::Dummy(*v),
            SplitKey::Real(v, k) => SplitKey::Real(*v, k.clone()),
        }
    }
}

impl<K> SplitKey<K> {
    #[inline]
    fn sort_value(&self) -> u64 {
        match self {
            SplitKey::Dummy(v) | SplitKey::Real(v, _) => *v,
        }
    }
}

// Equality and ordering here deliberately ignore `K`'s payload beyond the
// sort value: two real entries only collide if their hashes' bit-reversal
// coincides, which this set treats as out of scope (consistent with the
// homework set this is grounded on, which elides hashing collisions
// entirely).
impl<K> PartialEq for SplitKey<K> {
    fn eq(&self, other: &Self) -> bool {
        self.sort_value() == other.sort_value()
    }
}
impl<K> Eq for SplitKey<K> {}
impl<K> PartialOrd for SplitKey<K> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl<K> Ord for SplitKey<K> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.sort_value().cmp(&other.sort_value())
    }
}

#[inline]
fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// The dummy sort value for bucket `index`: `index`'s bits reversed, whose
/// low bit is always `0` because `index` never uses the top bit of the
/// 64-bit word (capacities in this set never approach `2^63`).
#[inline]
fn dummy_sort_value(index: usize) -> u64 {
    (index as u64).reverse_bits()
}

/// The sort value for a real item: the hash's bits reversed with the low
/// bit forced to `1`, guaranteeing it never numerically collides with a
/// dummy's sort value for the same reversed prefix.
#[inline]
fn real_sort_value<K: Hash>(key: &K) -> u64 {
    hash_of(key).reverse_bits() | 1
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Extracted
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Ownership of a key removed via [`SplitOrderedSet::extract`]; retires the
/// underlying list node on drop.
pub struct Extracted<K: 'static> {
    inner: ListExtracted<SplitKey<K>>,
}

impl<K: 'static> core::ops::Deref for Extracted<K> {
    type Target = K;
    fn deref(&self) -> &K {
        match &*self.inner {
            SplitKey::Real(_, k) => k,
            SplitKey::Dummy(_) => unreachable!("only real entries are ever extracted"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// SplitOrderedSet
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent hash set built from a single split-ordered linked list plus
/// a lazily growing bucket table.
pub struct SplitOrderedSet<K, C: ItemCounter = (), S: Stat = ()> {
    list: OrderedListSet<SplitKey<K>, C, S>,
    buckets: BucketTable<SplitKey<K>>,
    capacity: AtomicUsize,
}

impl<K, C: ItemCounter, S: Stat> Default for SplitOrderedSet<K, C, S>
where
    K: Ord + Hash + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, C: ItemCounter, S: Stat> SplitOrderedSet<K, C, S>
where
    K: Ord + Hash + Clone + 'static,
{
    /// Creates a new set with the default initial capacity of two buckets.
    pub fn new() -> Self {
        let list = OrderedListSet::new();
        let buckets = BucketTable::new();
        // bucket 0's dummy always sorts first; insert it directly at head.
        let head_slot = list.head_slot();
        let dummy0 = list.find_or_insert_from(head_slot, SplitKey::Dummy(dummy_sort_value(0)));
        buckets.set(0, dummy0, Ordering::Relaxed);
        Self { list, buckets, capacity: AtomicUsize::new(INITIAL_CAPACITY) }
    }

    /// Current logical bucket-table capacity (a power of two).
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Current element count.
    pub fn size(&self) -> usize {
        self.list.size()
    }

    /// `true` if the set holds no elements.
    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// The parent bucket index whose dummy must exist before `index`'s can
    /// be created, per the standard split-ordered-list recursive
    /// initialization: clear `index`'s highest set bit.
    fn parent_bucket(index: usize) -> usize {
        if index == 0 {
            return 0;
        }
        let highest = usize::BITS - 1 - index.leading_zeros();
        index & !(1 << highest)
    }

    /// Returns the dummy node for `index`, recursively initializing parent
    /// buckets (and this one) if they don't exist yet.
    fn bucket_dummy(&self, index: usize) -> *const Node<SplitKey<K>> {
        if let Some(existing) = self.buckets.get(index, Ordering::Acquire) {
            return existing;
        }

        let parent_index = Self::parent_bucket(index);
        let parent_dummy =
            if parent_index == index { self.buckets.get(0, Ordering::Acquire).expect("bucket 0 always exists") } else { self.bucket_dummy(parent_index) };

        let dummy_key = SplitKey::Dummy(dummy_sort_value(index));
        let dummy = self.list.find_or_insert_from(unsafe { &(*parent_dummy).next }, dummy_key);
        self.buckets.set(index, dummy, Ordering::Release);
        dummy
    }

    fn bucket_index_of(&self, key: &K) -> usize {
        let capacity = self.capacity();
        (hash_of(key) as usize) & (capacity - 1)
    }

    fn maybe_grow(&self) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        if self.size() > capacity * LOAD_FACTOR {
            let _ = self.capacity.compare_exchange(capacity, capacity * 2, Ordering::Relaxed, Ordering::Relaxed);
        }
    }

    /// Inserts `key`. Returns `false` if it was already present.
    pub fn insert(&self, key: K) -> bool {
        self.insert_with(key, |_| {})
    }

    /// Like [`SplitOrderedSet::insert`] but calls `on_insert` with the
    /// inserted key on success.
    pub fn insert_with<F: FnOnce(&K)>(&self, key: K, on_insert: F) -> bool {
        let dummy = self.bucket_dummy(self.bucket_index_of(&key));
        let sort_value = real_sort_value(&key);
        let inserted = self.list.insert_with_from(unsafe { &(*dummy).next }, SplitKey::Real(sort_value, key), |split_key| {
            if let SplitKey::Real(_, k) = split_key {
                on_insert(k);
            }
        });
        if inserted {
            self.maybe_grow();
        }
        inserted
    }

    /// Removes `key`. Returns `false` if it was not present.
    pub fn erase(&self, key: &K) -> bool {
        self.erase_with(key, |_| {})
    }

    /// Like [`SplitOrderedSet::erase`] but calls `on_erase` with the removed
    /// key immediately before it is retired.
    pub fn erase_with<F: FnOnce(&K)>(&self, key: &K, on_erase: F) -> bool {
        let dummy = self.bucket_dummy(self.bucket_index_of(key));
        let sort_value = real_sort_value(key);
        self.list.erase_with_from(unsafe { &(*dummy).next }, &SplitKey::Dummy(sort_value), |split_key| {
            if let SplitKey::Real(_, k) = split_key {
                on_erase(k);
            }
        })
    }

    /// Removes `key` and returns ownership of it, or `None` if absent.
    pub fn extract(&self, key: &K) -> Option<Extracted<K>> {
        let dummy = self.bucket_dummy(self.bucket_index_of(key));
        let sort_value = real_sort_value(key);
        self.list
            .extract_from(unsafe { &(*dummy).next }, &SplitKey::Dummy(sort_value))
            .map(|inner| Extracted { inner })
    }

    /// Reports whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        let dummy = self.bucket_dummy(self.bucket_index_of(key));
        let sort_value = real_sort_value(key);
        self.list.contains_from(unsafe { &(*dummy).next }, &SplitKey::Dummy(sort_value))
    }

    /// Finds `key` and calls `f` with it if present. Returns `true` iff found.
    pub fn find<F: FnOnce(&K)>(&self, key: &K, f: F) -> bool {
        let dummy = self.bucket_dummy(self.bucket_index_of(key));
        let sort_value = real_sort_value(key);
        self.list.find_from(unsafe { &(*dummy).next }, &SplitKey::Dummy(sort_value), |split_key| {
            if let SplitKey::Real(_, k) = split_key {
                f(k);
            }
        })
    }

    /// Combines lookup, optional insertion and a user callback in one
    /// traversal (§6's `update` entry).
    pub fn update<F>(&self, key: K, allow_insert: bool, f: F) -> bool
    where
        F: FnOnce(bool, Option<&K>, &K),
    {
        let dummy = self.bucket_dummy(self.bucket_index_of(&key));
        let sort_value = real_sort_value(&key);
        let updated = self.list.update_from(
            unsafe { &(*dummy).next },
            SplitKey::Real(sort_value, key),
            allow_insert,
            |is_new, existing, input| {
                let existing = existing.map(|split_key| match split_key {
                    SplitKey::Real(_, k) => k,
                    SplitKey::Dummy(_) => unreachable!("bucket dummies never match a real sort value"),
                });
                let input = match input {
                    SplitKey::Real(_, k) => k,
                    SplitKey::Dummy(_) => unreachable!("constructed above as `Real`"),
                };
                f(is_new, existing, input);
            },
        );
        if updated {
            self.maybe_grow();
        }
        updated
    }

    /// Removes every element. Not atomic with respect to concurrent
    /// inserts racing the same call, and (unlike the plain list) does not
    /// reset the bucket table: capacity never shrinks.
    pub fn clear(&self) {
        self.list.clear();
        // bucket 0's dummy was freed by `list.clear()` along with everything
        // else; every bucket must be re-initialized lazily on next access.
        self.buckets.reset();
        let head_slot = self.list.head_slot();
        let dummy0 = self.list.find_or_insert_from(head_slot, SplitKey::Dummy(dummy_sort_value(0)));
        self.buckets.set(0, dummy0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::AtomicCounter;

    #[test]
    fn insert_contains_erase_roundtrip() {
        let set: SplitOrderedSet<i32, AtomicCounter> = SplitOrderedSet::new();
        for k in 1..=16 {
            assert!(set.insert(k), "insert {k}");
        }
        assert!(!set.insert(5));
        assert_eq!(set.size(), 16);

        for k in 1..=16 {
            assert!(set.contains(&k), "missing {k}");
        }

        for k in (1..=16).step_by(2) {
            assert!(set.erase(&k));
        }
        for k in 1..=8 {
            assert_eq!(set.contains(&(2 * k)), true);
            assert_eq!(set.contains(&(2 * k - 1)), false);
        }
    }

    #[test]
    fn functor_variants_see_the_right_key() {
        let set: SplitOrderedSet<i32, AtomicCounter> = SplitOrderedSet::new();
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

        assert!(set.insert(7));
        let mut erased = None;
        assert!(set.erase_with(&7, |k| erased = Some(*k)));
        assert_eq!(erased, Some(7));
    }

    #[test]
    fn grows_capacity_under_load() {
        let set: SplitOrderedSet<i32, AtomicCounter> = SplitOrderedSet::new();
        let initial = set.capacity();
        for k in 0..64 {
            set.insert(k);
        }
        assert!(set.capacity() > initial, "capacity should have grown under load");
    }

    #[test]
    fn concurrent_inserts_preserve_every_key() {
        use std::sync::Arc;
        use std::thread;

        let set = Arc::new(SplitOrderedSet::<i32, AtomicCounter>::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let set = Arc::clone(&set);
            handles.push(thread::spawn(move || {
                for k in (t..2000).step_by(4) {
                    set.insert(k);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(set.size(), 2000);
        for k in 0..2000 {
            assert!(set.contains(&k), "missing key {k}");
        }
    }
}
