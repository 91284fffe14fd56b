//! The bucket table backing [`super::SplitOrderedSet`]: a flat array of
//! lazily allocated, doubling-size segments, so the table can grow without
//! ever moving an already-published bucket pointer.
//!
//! A simplified flattening of the recursive segments-of-segments table in
//! the retrieved homework set's `growable_array.rs`: that design supports
//! arbitrarily deep nesting, but a single level of 64 segments already
//! covers every index a `usize` can express, so the recursion collapses to
//! one array lookup plus one segment lookup.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::list::Node;

/// `usize::BITS`; one segment per bit position covers every representable
/// index.
const MAX_SEGMENTS: usize = usize::BITS as usize;

/// Splits a bucket index into `(segment, offset, segment_len)`: segment
/// sizes double starting at `1`, so segment `s` holds indices
/// `[2^s - 1, 2^(s+1) - 2]`.
fn locate(index: usize) -> (usize, usize, usize) {
    let pos = index + 1;
    let segment = (usize::BITS - 1 - pos.leading_zeros()) as usize;
    let segment_len = 1usize << segment;
    let offset = pos - segment_len;
    (segment, offset, segment_len)
}

type Segment<K> = Box<[AtomicPtr<Node<K>>]>;

pub(super) struct BucketTable<K> {
    segments: Box<[AtomicPtr<Segment<K>>]>,
}

impl<K> BucketTable<K> {
    pub(super) fn new() -> Self {
        let segments = (0..MAX_SEGMENTS).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Self { segments }
    }

    /// Returns the dummy node pointer stored at `index`, if the bucket has
    /// been initialized.
    pub(super) fn get(&self, index: usize, order: Ordering) -> Option<*const Node<K>> {
        let (segment, offset, _) = locate(index);
        let seg_ptr = self.segments[segment].load(order);
        if seg_ptr.is_null() {
            return None;
        }
        // SAFETY: non-null segment pointers are only ever set once, to a
        // fully initialized boxed slice, and never freed while `self` lives.
        let seg = unsafe { &*seg_ptr };
        let slot = seg[offset].load(order);
        if slot.is_null() {
            None
        } else {
            Some(slot as *const Node<K>)
        }
    }

    /// Records `dummy` as the permanent bucket pointer for `index`,
    /// allocating the owning segment first if this is its first entry.
    /// Safe to call redundantly with the same `dummy` from multiple racing
    /// threads: every caller is expected to have obtained `dummy` from the
    /// same underlying list's deduplicated insert.
    pub(super) fn set(&self, index: usize, dummy: *const Node<K>, order: Ordering) {
        let (segment, offset, segment_len) = locate(index);
        self.ensure_segment(segment, segment_len);
        // SAFETY: `ensure_segment` guarantees this is non-null by now.
        let seg_ptr = self.segments[segment].load(Ordering::Acquire);
        let seg = unsafe { &*seg_ptr };
        seg[offset].store(dummy as *mut Node<K>, order);
    }

    fn ensure_segment(&self, segment: usize, segment_len: usize) {
        if !self.segments[segment].load(Ordering::Acquire).is_null() {
            return;
        }
        let fresh: Segment<K> = (0..segment_len).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        let boxed = Box::into_raw(Box::new(fresh));
        let result =
            self.segments[segment].compare_exchange(ptr::null_mut(), boxed, Ordering::AcqRel, Ordering::Acquire);
        if result.is_err() {
            // SAFETY: never published; no other thread observed `boxed`.
            unsafe { drop(Box::from_raw(boxed)) };
        }
    }

    /// Drops every allocated segment and resets the table to empty, without
    /// touching whatever the bucket pointers referred to (the owning list is
    /// responsible for the actual nodes).
    pub(super) fn reset(&self) {
        for slot in self.segments.iter() {
            let seg_ptr = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !seg_ptr.is_null() {
                // SAFETY: uniquely owned; no concurrent access survives the swap.
                unsafe { drop(Box::from_raw(seg_ptr)) };
            }
        }
    }
}

impl<K> Drop for BucketTable<K> {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_covers_doubling_segments() {
        assert_eq!(locate(0), (0, 0, 1));
        assert_eq!(locate(1), (1, 0, 2));
        assert_eq!(locate(2), (1, 1, 2));
        assert_eq!(locate(3), (2, 0, 4));
        assert_eq!(locate(6), (2, 3, 4));
        assert_eq!(locate(7), (3, 0, 8));
    }

    #[test]
    fn set_then_get_roundtrips() {
        let table: BucketTable<u32> = BucketTable::new();
        assert_eq!(table.get(5, Ordering::Acquire), None);
        let fake = 0x1000 as *const Node<u32>;
        table.set(5, fake, Ordering::Release);
        assert_eq!(table.get(5, Ordering::Acquire), Some(fake));
    }
}
