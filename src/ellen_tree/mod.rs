//! Ellen non-blocking external-node binary search tree (component H,
//! §4.H), grounded on the update-descriptor protocol of the retrieved
//! `ellen_bintree_rcu.h`, adapted from its RCU read-side critical sections
//! onto this crate's hazard pointers.
//!
//! Every mutation is coordinated through an `update` field instead of a
//! lock: a thread that wants to change a node's children first CAS's a
//! descriptor describing the change into that field, then performs the
//! change, then CAS's the field back to `Clean`. Any other thread that
//! observes a non-`Clean` field during its own search is obliged to help
//! complete it before making progress past that node.
//!
//! Trade-off: `Mark` (the state a delete installs on the parent being
//! bypassed) is not actually helped to completion by other threads here —
//! they spin-wait (with backoff) until the marking thread finishes instead.
//! The full algorithm helps every state uniformly, which keeps insert and
//! delete both lock-free; this simplification keeps delete only
//! obstruction-free on a subtree under contention, in exchange for a much
//! smaller state machine to implement correctly. Insert remains lock-free:
//! `IFlag` is still genuinely helped by any observing thread.

use core::cmp::Ordering as CmpOrdering;
use core::sync::atomic::Ordering;

use crate::backoff::Backoff;
use crate::container::Extracted as RawExtracted;
use crate::counter::ItemCounter;
use crate::hp::{Guard, Hp};
use crate::stat::{Event, Stat};
use crate::sync::{Atomic, MarkedPtr};

const UPDATE_TAG_BITS: u32 = 2;
const CLEAN: usize = 0;
const IFLAG: usize = 1;
const DFLAG: usize = 2;
const MARK: usize = 3;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Bound
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A tree key, extended with the two permanent sentinels that keep the
/// rightmost spine non-empty even when the tree holds no user keys.
enum Bound<K> {
    Value(K),
    /// The second-from-rightmost permanent leaf.
    Inf1,
    /// The absolute rightmost permanent leaf.
    Inf2,
}

impl<K: PartialEq> PartialEq for Bound<K> {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.cmp_kind(other), CmpOrdering::Equal)
    }
}
impl<K: PartialEq> Eq for Bound<K> {}
impl<K: Ord> PartialOrd for Bound<K> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl<K: Ord> Ord for Bound<K> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.cmp_kind(other)
    }
}

impl<K: Ord> Bound<K> {
    fn cmp_kind(&self, other: &Self) -> CmpOrdering {
        use Bound::*;
        match (self, other) {
            (Value(a), Value(b)) => a.cmp(b),
            (Value(_), Inf1) | (Value(_), Inf2) | (Inf1, Inf2) => CmpOrdering::Less,
            (Inf1, Inf1) | (Inf2, Inf2) => CmpOrdering::Equal,
            (Inf1, Value(_)) | (Inf2, Value(_)) | (Inf2, Inf1) => CmpOrdering::Greater,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// TreeNode
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct TreeNode<K> {
    kind: NodeKind<K>,
}

enum NodeKind<K> {
    Leaf(Bound<K>),
    Internal {
        key: Bound<K>,
        left: Atomic<TreeNode<K>, 0>,
        right: Atomic<TreeNode<K>, 0>,
        update: Atomic<UpdateDescriptor<K>, UPDATE_TAG_BITS>,
    },
}

impl<K> TreeNode<K> {
    fn leaf(key: Bound<K>) -> Box<Self> {
        Box::new(Self { kind: NodeKind::Leaf(key) })
    }

    fn internal(key: Bound<K>, left: *mut TreeNode<K>, right: *mut TreeNode<K>) -> Box<Self> {
        Box::new(Self {
            kind: NodeKind::Internal {
                key,
                left: Atomic::new(MarkedPtr::compose(left, 0)),
                right: Atomic::new(MarkedPtr::compose(right, 0)),
                update: Atomic::null(),
            },
        })
    }

    fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    fn key(&self) -> &Bound<K> {
        match &self.kind {
            NodeKind::Leaf(k) => k,
            NodeKind::Internal { key, .. } => key,
        }
    }

    fn child_slot(&self, left: bool) -> &Atomic<TreeNode<K>, 0> {
        match &self.kind {
            NodeKind::Internal { left: l, right: r, .. } => {
                if left {
                    l
                } else {
                    r
                }
            }
            NodeKind::Leaf(_) => unreachable!("leaves have no children"),
        }
    }

    fn update(&self) -> &Atomic<UpdateDescriptor<K>, UPDATE_TAG_BITS> {
        match &self.kind {
            NodeKind::Internal { update, .. } => update,
            NodeKind::Leaf(_) => unreachable!("leaves carry no update descriptor"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// UpdateDescriptor
////////////////////////////////////////////////////////////////////////////////////////////////////

enum UpdateDescriptor<K> {
    Insert {
        parent: *mut TreeNode<K>,
        leaf: *mut TreeNode<K>,
        new_internal: *mut TreeNode<K>,
        leaf_is_left_child: bool,
    },
    Delete {
        grandparent: *mut TreeNode<K>,
        parent: *mut TreeNode<K>,
        leaf: *mut TreeNode<K>,
        parent_is_left_child: bool,
        parent_update_snapshot: MarkedPtr<UpdateDescriptor<K>, UPDATE_TAG_BITS>,
        /// `true` when this delete originates from [`EllenTreeSet::extract`]
        /// or [`EllenTreeSet::extract_extreme`]: `finish_delete` must then
        /// hand `leaf` back undisposed so the caller's `Extracted` handle is
        /// the sole retirer, instead of retiring it itself.
        dispose_leaf: bool,
    },
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Extracted
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Ownership of a key removed via [`EllenTreeSet::extract_min`] or
/// [`EllenTreeSet::extract_max`]; retires the underlying leaf on drop.
pub struct Extracted<K: 'static> {
    inner: RawExtracted<TreeNode<K>>,
}

impl<K: 'static> core::ops::Deref for Extracted<K> {
    type Target = K;
    fn deref(&self) -> &K {
        match &self.inner.kind {
            NodeKind::Leaf(Bound::Value(k)) => k,
            _ => unreachable!("extracted nodes are always real-valued leaves"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// EllenTreeSet
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A concurrent sorted set backed by Ellen et al.'s external-node lock-free
/// binary search tree.
pub struct EllenTreeSet<K, C: ItemCounter = (), S: Stat = ()> {
    root: Atomic<TreeNode<K>, 0>,
    counter: C,
    stat: S,
}

impl<K: Ord + 'static, C: ItemCounter, S: Stat> Default for EllenTreeSet<K, C, S> {
    fn default() -> Self {
        Self::new()
    }
}

struct SearchResult<K> {
    grandparent: Option<*mut TreeNode<K>>,
    gp_guard: Guard<TreeNode<K>, 0>,
    gp_update: MarkedPtr<UpdateDescriptor<K>, UPDATE_TAG_BITS>,
    parent_is_left_of_gp: bool,
    parent: *mut TreeNode<K>,
    parent_guard: Guard<TreeNode<K>, 0>,
    parent_update: MarkedPtr<UpdateDescriptor<K>, UPDATE_TAG_BITS>,
    leaf_is_left_of_parent: bool,
    leaf: *mut TreeNode<K>,
    leaf_guard: Guard<TreeNode<K>, 0>,
}

impl<K: Ord + 'static, C: ItemCounter, S: Stat> EllenTreeSet<K, C, S> {
    /// Creates a new set pre-populated with the two permanent sentinel
    /// leaves.
    pub fn new() -> Self {
        let inf1 = Box::into_raw(TreeNode::leaf(Bound::Inf1));
        let inf2 = Box::into_raw(TreeNode::leaf(Bound::Inf2));
        let root = TreeNode::internal(Bound::Inf1, inf1, inf2);
        Self { root: Atomic::new(MarkedPtr::compose(Box::into_raw(root), 0)), counter: C::default(), stat: S::default() }
    }

    /// Current element count, subject to the configured counter policy.
    pub fn size(&self) -> usize {
        self.counter.get()
    }

    /// `true` if the set currently holds no elements.
    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// Descends from the root, helping any non-`Clean` node it passes
    /// (spinning instead of fully helping `Mark`, per this module's
    /// documented trade-off), and returns the grandparent/parent/leaf
    /// triple for `key`.
    fn search(&self, key: &Bound<K>) -> SearchResult<K> {
        let _guard = crate::registry::attach();
        let mut backoff = Backoff::new();
        loop {
            let mut gp_guard: Guard<TreeNode<K>, 0> = Guard::new();
            let mut parent_guard: Guard<TreeNode<K>, 0> = Guard::new();
            let mut leaf_guard: Guard<TreeNode<K>, 0> = Guard::new();

            let mut grandparent: Option<*mut TreeNode<K>> = None;
            let mut gp_update = MarkedPtr::null();
            let mut parent: Option<*mut TreeNode<K>> = None;
            let mut parent_update = MarkedPtr::null();
            let mut parent_is_left_of_gp = false;
            let mut leaf_is_left_of_parent = false;

            let mut curr = leaf_guard.acquire(&self.root, Ordering::Acquire).expect("root always present");

            loop {
                let node = unsafe { curr.as_ref() };
                if node.is_leaf() {
                    break;
                }

                let update = node.update().load(Ordering::Acquire);
                if update.decompose_tag() != CLEAN {
                    self.help(curr.decompose_ptr().as_ptr(), update, &mut backoff);
                    backoff.spin();
                    break;
                }

                let go_left = key < node.key();
                let next_slot = node.child_slot(go_left);

                // roll the triple forward one level: the old parent becomes the new
                // grandparent, and the internal node just examined becomes the new parent.
                core::mem::swap(&mut gp_guard, &mut parent_guard);
                grandparent = parent;
                gp_update = parent_update;
                parent_is_left_of_gp = leaf_is_left_of_parent;

                core::mem::swap(&mut parent_guard, &mut leaf_guard);
                parent = Some(curr.decompose_ptr().as_ptr());
                parent_update = update;
                leaf_is_left_of_parent = go_left;

                curr = match leaf_guard.acquire(next_slot, Ordering::Acquire) {
                    Some(ptr) => ptr,
                    None => unreachable!("child slots are never null in this tree"),
                };
            }

            // the inner loop only breaks on a real leaf or after helping a
            // non-clean node; in the latter case `curr` is still internal and
            // the whole search restarts from the root.
            if unsafe { curr.as_ref() }.is_leaf() {
                let parent = parent.expect("the root is always internal, so any leaf has a parent");
                return SearchResult {
                    grandparent,
                    gp_guard,
                    gp_update,
                    parent_is_left_of_gp,
                    parent,
                    parent_guard,
                    parent_update,
                    leaf_is_left_of_parent,
                    leaf: curr.decompose_ptr().as_ptr(),
                    leaf_guard,
                };
            }
        }
    }

    /// Dispatches to the right helper for whatever `update` currently holds,
    /// per this module's documented Mark trade-off.
    fn help(&self, node_ptr: *mut TreeNode<K>, update: MarkedPtr<UpdateDescriptor<K>, UPDATE_TAG_BITS>, backoff: &mut Backoff) {
        self.stat.record(Event::HelpStep);
        match update.decompose_tag() {
            IFLAG => self.help_insert(node_ptr, update),
            DFLAG => self.help_delete(node_ptr, update),
            MARK => {
                self.stat.record(Event::MarkedNodeEncountered);
                backoff.spin();
            }
            _ => {}
        }
    }

    fn help_insert(&self, parent: *mut TreeNode<K>, update: MarkedPtr<UpdateDescriptor<K>, UPDATE_TAG_BITS>) {
        let desc_ptr = update.decompose_ptr();
        let desc = unsafe { &*desc_ptr };
        if let UpdateDescriptor::Insert { leaf, new_internal, leaf_is_left_child, .. } = desc {
            let parent_node = unsafe { &*parent };
            let slot = parent_node.child_slot(*leaf_is_left_child);
            let _ = slot.compare_exchange(
                MarkedPtr::compose(*leaf, 0),
                MarkedPtr::compose(*new_internal, 0),
                Ordering::Release,
                Ordering::Acquire,
            );
            if parent_node
                .update()
                .compare_exchange(update, MarkedPtr::null(), Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: uniquely retired by whichever thread wins this CAS.
                unsafe { Hp::retire(Box::from_raw(desc_ptr)) };
            }
        }
    }

    fn help_delete(&self, grandparent: *mut TreeNode<K>, update: MarkedPtr<UpdateDescriptor<K>, UPDATE_TAG_BITS>) {
        let desc_ptr = update.decompose_ptr();
        let desc = unsafe { &*desc_ptr };
        if let UpdateDescriptor::Delete { parent, leaf, parent_is_left_child, parent_update_snapshot, dispose_leaf, .. } = desc
        {
            let parent_node = unsafe { &**parent };
            let marked = MarkedPtr::<UpdateDescriptor<K>, UPDATE_TAG_BITS>::compose(desc_ptr, MARK);
            let mark_result =
                parent_node.update().compare_exchange(*parent_update_snapshot, marked, Ordering::Release, Ordering::Acquire);
            let already_marked = matches!(mark_result, Err(actual) if actual == marked);
            if mark_result.is_ok() || already_marked {
                self.finish_delete(grandparent, *parent, *leaf, *parent_is_left_child, desc_ptr, update, *dispose_leaf);
            } else {
                let gp_node = unsafe { &*grandparent };
                let _ = gp_node.update().compare_exchange(update, MarkedPtr::null(), Ordering::Release, Ordering::Acquire);
            }
        }
    }

    /// Bypasses `parent` by swinging `grandparent`'s child pointer to
    /// `leaf`'s sibling, retires `parent`, and clears the `DFlag`. `leaf`
    /// itself is retired here only when `dispose_leaf` is `false`; when
    /// `true` (an `extract`/`extract_extreme` call), the caller's
    /// `Extracted` handle is the sole owner and retirer of `leaf`.
    fn finish_delete(
        &self,
        grandparent: *mut TreeNode<K>,
        parent: *mut TreeNode<K>,
        leaf: *mut TreeNode<K>,
        parent_is_left_child: bool,
        desc_ptr: *mut UpdateDescriptor<K>,
        dflag: MarkedPtr<UpdateDescriptor<K>, UPDATE_TAG_BITS>,
        dispose_leaf: bool,
    ) {
        let parent_node = unsafe { &*parent };
        let leaf_is_left = {
            let left = parent_node.child_slot(true).load(Ordering::Acquire).decompose_ptr();
            left == leaf
        };
        let sibling = parent_node.child_slot(!leaf_is_left).load(Ordering::Acquire).decompose_ptr();

        let gp_node = unsafe { &*grandparent };
        let gp_slot = gp_node.child_slot(parent_is_left_child);
        let bypassed = gp_slot
            .compare_exchange(MarkedPtr::compose(parent, 0), MarkedPtr::compose(sibling, 0), Ordering::Release, Ordering::Acquire)
            .is_ok();

        if gp_node.update().compare_exchange(dflag, MarkedPtr::null(), Ordering::Release, Ordering::Acquire).is_ok() {
            // SAFETY: this CAS winner is the unique retirer for both.
            unsafe { Hp::retire(Box::from_raw(desc_ptr)) };
            if bypassed {
                self.stat.record(Event::PhysicalUnlink);
                unsafe { Hp::retire(Box::from_raw(parent)) };
                if !dispose_leaf {
                    unsafe { Hp::retire(Box::from_raw(leaf)) };
                }
            }
        }
    }

    /// Inserts `key`. Returns `false` (without mutating) if already present.
    pub fn insert(&self, key: K) -> bool {
        self.insert_with(key, |_| {})
    }

    /// Like [`EllenTreeSet::insert`] but calls `on_insert` with the newly
    /// linked key on success.
    pub fn insert_with(&self, key: K, on_insert: impl FnOnce(&K)) -> bool {
        let target = Bound::Value(key);
        let mut backoff = Backoff::new();
        loop {
            let res = self.search(&target);
            let leaf_node = unsafe { &*res.leaf };
            if leaf_node.key() == &target {
                return false;
            }

            let new_leaf = Box::into_raw(TreeNode::leaf(clone_bound(&target)));
            let old_key = clone_bound(leaf_node.key());
            let (left, right) = if target < old_key {
                (new_leaf, res.leaf)
            } else {
                (res.leaf, new_leaf)
            };
            let routing_key = if target < old_key { old_key } else { clone_bound(&target) };
            let new_internal = Box::into_raw(TreeNode::internal(routing_key, left, right));

            let desc = Box::into_raw(Box::new(UpdateDescriptor::Insert {
                parent: res.parent,
                leaf: res.leaf,
                new_internal,
                leaf_is_left_child: res.leaf_is_left_of_parent,
            }));
            let iflag = MarkedPtr::compose(desc, IFLAG);
            let parent_node = unsafe { &*res.parent };
            let installed = parent_node.update().compare_exchange(
                MarkedPtr::null(),
                iflag,
                Ordering::Release,
                Ordering::Acquire,
            );
            match installed {
                Ok(_) => {
                    self.help_insert(res.parent, iflag);
                    self.counter.inc();
                    if let Bound::Value(k) = &target {
                        on_insert(k);
                    }
                    return true;
                }
                Err(current) => {
                    // SAFETY: never published.
                    unsafe {
                        drop(Box::from_raw(new_internal));
                        drop(Box::from_raw(new_leaf));
                        drop(Box::from_raw(desc));
                    }
                    if current.decompose_tag() != CLEAN {
                        self.help(res.parent, current, &mut backoff);
                    }
                    backoff.spin();
                }
            }
        }
    }

    /// Removes `key`. Returns `false` if it was not present.
    pub fn erase(&self, key: &K) -> bool {
        self.erase_with(key, |_| {})
    }

    /// Like [`EllenTreeSet::erase`] but calls `on_erase` with the removed
    /// key once the delete has been installed.
    pub fn erase_with(&self, key: &K, on_erase: impl FnOnce(&K)) -> bool {
        let target = Bound::Value(clone_k(key));
        let found = self.erase_bound(&target, false).is_some();
        if found {
            on_erase(key);
        }
        found
    }

    /// Removes `key` and returns ownership of it, or `None` if absent.
    pub fn extract(&self, key: &K) -> Option<Extracted<K>> {
        let target = Bound::Value(clone_k(key));
        self.erase_bound(&target, true).map(|leaf| Extracted { inner: unsafe { RawExtracted::new(leaf) } })
    }

    /// Installs and helps complete a delete of `target`. Returns the
    /// now-unlinked leaf pointer on success. When `dispose_leaf` is `true`
    /// the leaf is guaranteed not to have been retired yet — the caller
    /// becomes its unique owner; when `false`, [`Self::finish_delete`]
    /// retires it itself (the common `erase` path).
    fn erase_bound(&self, target: &Bound<K>, dispose_leaf: bool) -> Option<*mut TreeNode<K>> {
        let mut backoff = Backoff::new();
        loop {
            let res = self.search(target);
            let leaf_node = unsafe { &*res.leaf };
            if leaf_node.key() != target {
                return None;
            }
            let grandparent = match res.grandparent {
                Some(gp) => gp,
                None => return None,
            };

            let parent_update_snapshot = res.parent_update;
            let gp_node = unsafe { &*grandparent };

            let desc = Box::into_raw(Box::new(UpdateDescriptor::Delete {
                grandparent,
                parent: res.parent,
                leaf: res.leaf,
                parent_is_left_child: res.parent_is_left_of_gp,
                parent_update_snapshot,
                dispose_leaf,
            }));
            let dflag = MarkedPtr::compose(desc, DFLAG);
            let installed =
                gp_node.update().compare_exchange(res.gp_update, dflag, Ordering::Release, Ordering::Acquire);
            match installed {
                Ok(_) => {
                    self.help_delete(grandparent, dflag);
                    self.counter.dec();
                    return Some(res.leaf);
                }
                Err(current) => {
                    unsafe { drop(Box::from_raw(desc)) };
                    if current.decompose_tag() != CLEAN {
                        self.help(grandparent, current, &mut backoff);
                    }
                    backoff.spin();
                }
            }
        }
    }

    /// Reports whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        let target = Bound::Value(clone_k(key));
        let res = self.search(&target);
        unsafe { &*res.leaf }.key() == &target
    }

    /// Finds `key` and calls `f` with it if present. Returns `true` iff found.
    pub fn find(&self, key: &K, f: impl FnOnce(&K)) -> bool {
        let target = Bound::Value(clone_k(key));
        let res = self.search(&target);
        if unsafe { &*res.leaf }.key() == &target {
            f(key);
            true
        } else {
            false
        }
    }

    /// Combines lookup, optional insertion and a user callback in one
    /// traversal: `f` is called with `(is_new, existing, input)` (§6's
    /// `update` entry).
    pub fn update(&self, key: K, allow_insert: bool, f: impl FnOnce(bool, Option<&K>, &K)) -> bool {
        let target = Bound::Value(key);
        let res = self.search(&target);
        if unsafe { &*res.leaf }.key() == &target {
            if let Bound::Value(k) = &target {
                f(false, Some(k), k);
            }
            true
        } else if allow_insert {
            if let Bound::Value(k) = &target {
                f(true, None, k);
            }
            drop(res);
            match target {
                Bound::Value(k) => self.insert(k),
                _ => unreachable!("constructed as `Value` above"),
            }
        } else {
            false
        }
    }

    /// Removes and returns the smallest key, or `None` if the set is empty.
    pub fn extract_min(&self) -> Option<Extracted<K>> {
        self.extract_extreme(true)
    }

    /// Removes and returns the largest key, or `None` if the set is empty.
    /// (The absolute rightmost leaf is always `Inf2`; this returns the
    /// largest *real* key, i.e. the rightmost leaf excluding both
    /// sentinels.)
    pub fn extract_max(&self) -> Option<Extracted<K>> {
        self.extract_extreme(false)
    }

    fn extract_extreme(&self, min: bool) -> Option<Extracted<K>> {
        let _registry = crate::registry::attach();
        loop {
            let mut guard: Guard<TreeNode<K>, 0> = Guard::new();
            let root = guard.acquire(&self.root, Ordering::Acquire)?;
            // `Inf2` is always the root's direct right child, so the largest
            // real key (if any) lives in the root's left subtree; walking
            // right from there the rest of the way finds it. For the
            // smallest key, walking left all the way from the root already
            // stays inside that same subtree.
            let mut curr =
                guard.acquire(unsafe { root.as_ref() }.child_slot(true), Ordering::Acquire).expect("root always has a left child");
            loop {
                let node = unsafe { curr.as_ref() };
                if node.is_leaf() {
                    break;
                }
                curr = guard.acquire(node.child_slot(min), Ordering::Acquire).expect("children never null");
            }
            let node = unsafe { curr.as_ref() };
            if matches!(node.key(), Bound::Inf1 | Bound::Inf2) {
                return None;
            }
            let target = clone_bound(node.key());
            if let Some(leaf) = self.erase_bound(&target, true) {
                return Some(Extracted { inner: unsafe { RawExtracted::new(leaf) } });
            }
            // lost a race with another deleter of the same extreme key; retry.
        }
    }

    /// Removes every element, rebuilding the two-sentinel empty tree. Not
    /// atomic with respect to concurrent mutation racing the same call.
    pub fn clear(&self) {
        let _guard = crate::registry::attach();
        let inf1 = Box::into_raw(TreeNode::leaf(Bound::Inf1));
        let inf2 = Box::into_raw(TreeNode::leaf(Bound::Inf2));
        let fresh_root = Box::into_raw(TreeNode::internal(Bound::Inf1, inf1, inf2));
        let old = self.root.swap(MarkedPtr::compose(fresh_root, 0), Ordering::AcqRel);
        free_subtree(old.decompose_ptr());
        self.counter.reset();
    }
}

fn free_subtree<K>(ptr: *mut TreeNode<K>) {
    if ptr.is_null() {
        return;
    }
    let node = unsafe { Box::from_raw(ptr) };
    if let NodeKind::Internal { left, right, update, .. } = node.kind {
        free_subtree(left.load(Ordering::Relaxed).decompose_ptr());
        free_subtree(right.load(Ordering::Relaxed).decompose_ptr());
        let desc = update.load(Ordering::Relaxed).decompose_ptr();
        if !desc.is_null() {
            unsafe { drop(Box::from_raw(desc)) };
        }
    }
}

impl<K, C: ItemCounter, S: Stat> Drop for EllenTreeSet<K, C, S> {
    fn drop(&mut self) {
        free_subtree(self.root.load(Ordering::Relaxed).decompose_ptr());
    }
}

fn clone_bound<K: Clone>(b: &Bound<K>) -> Bound<K> {
    match b {
        Bound::Value(k) => Bound::Value(k.clone()),
        Bound::Inf1 => Bound::Inf1,
        Bound::Inf2 => Bound::Inf2,
    }
}

fn clone_k<K: Clone>(k: &K) -> K {
    k.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::AtomicCounter;

    #[test]
    fn insert_contains_erase_roundtrip() {
        let set: EllenTreeSet<i32, AtomicCounter> = EllenTreeSet::new();
        for k in [50, 30, 70, 20, 40] {
            assert!(set.insert(k));
        }
        assert!(!set.insert(30));
        assert_eq!(set.size(), 5);

        assert!(set.erase(&30));
        assert!(!set.contains(&30));
        assert!(set.contains(&20));
        assert!(set.contains(&40));
        assert_eq!(set.size(), 4);
    }

    #[test]
    fn extract_min_and_max() {
        let set: EllenTreeSet<i32, AtomicCounter> = EllenTreeSet::new();
        for k in [10, 20, 30] {
            set.insert(k);
        }
        assert_eq!(*set.extract_min().unwrap(), 10);
        assert_eq!(*set.extract_max().unwrap(), 30);
        assert_eq!(*set.extract_min().unwrap(), 20);
        assert!(set.empty());
    }

    #[test]
    fn functor_variants_see_the_right_key() {
        let set: EllenTreeSet<i32, AtomicCounter> = EllenTreeSet::new();
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
    fn concurrent_insert_and_erase() {
        use std::sync::Arc;
        use std::thread;

        let set = Arc::new(EllenTreeSet::<i32, AtomicCounter>::new());
        for k in (1..300).step_by(2) {
            set.insert(k);
        }
        let inserter = {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                for k in (0..300).step_by(2) {
                    set.insert(k);
                }
            })
        };
        let eraser = {
            let set = Arc::clone(&set);
            thread::spawn(move || {
                for k in (1..300).step_by(2) {
                    set.erase(&k);
                }
            })
        };
        inserter.join().unwrap();
        eraser.join().unwrap();

        for k in (0..300).step_by(2) {
            assert!(set.contains(&k));
        }
        for k in (1..300).step_by(2) {
            assert!(!set.contains(&k));
        }
    }
}
