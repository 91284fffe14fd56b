//! The reclamation contract shared by both SMR schemes (§4.A/§9 "pointer
//! graphs with shared ownership").
//!
//! Containers never own their nodes through Rust's ordinary ownership types;
//! a node's destruction is gated by whichever SMR scheme (hazard pointers or
//! epoch) is attached to the container, which is why this crate threads a
//! type-erased [`Retired`] handle plus a disposer callback through both
//! [`crate::hp`] and [`crate::rcu`] instead of `Box`/`Arc`.

use core::fmt;
use core::ptr::NonNull;

/// A disposer invoked by the SMR scheme at the moment it is safe to actually
/// destroy a retired record. Pluggable per §6 (`disposer` option); the
/// default simply runs the type's `Drop` glue and deallocates it (below).
pub trait Disposer<T> {
    fn dispose(&self, value: Box<T>);
}

/// The default disposer: drop and deallocate exactly as `Box<T>`'s own
/// destructor would.
#[derive(Copy, Clone, Debug, Default)]
pub struct DropDisposer;

impl<T> Disposer<T> for DropDisposer {
    #[inline]
    fn dispose(&self, value: Box<T>) {
        drop(value);
    }
}

/// A type-erased handle to a single retired record, carrying its address and
/// a function pointer to its (monomorphized) drop glue.
///
/// An in-crate replacement for the `reclaim::Retired<HP>` shape used by the
/// unpublished git dependency this crate doesn't carry (see DESIGN.md): same
/// idea, no external crate required.
pub struct Retired {
    addr: NonNull<()>,
    drop_glue: unsafe fn(NonNull<()>),
}

impl Retired {
    /// Captures `boxed` as a retired record, to be dropped and deallocated
    /// exactly once by a future call to [`Retired::reclaim`].
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no live reference to `*boxed` survives
    /// past the point where the record is handed to the SMR scheme's retire
    /// queue, other than references protected by that scheme.
    pub unsafe fn new<T>(boxed: Box<T>) -> Self {
        unsafe fn drop_glue<T>(addr: NonNull<()>) {
            drop(Box::from_raw(addr.as_ptr().cast::<T>()));
        }

        let addr = NonNull::new_unchecked(Box::into_raw(boxed)).cast::<()>();
        Self { addr, drop_glue: drop_glue::<T> }
    }

    /// The untyped address of the retired record, used to compare against
    /// protected hazard/epoch snapshots without needing the concrete type.
    #[inline]
    pub fn address(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    /// Drops and deallocates the retired record.
    ///
    /// # Safety
    ///
    /// Must only be called once the owning SMR scheme has established that
    /// no thread holds a live reference to this address (§8 property 5).
    #[inline]
    pub unsafe fn reclaim(self) {
        (self.drop_glue)(self.addr);
    }
}

impl fmt::Debug for Retired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retired").field("addr", &self.addr).finish()
    }
}

// SAFETY: a `Retired` only ever carries an address and a function pointer
// between threads; the underlying record's `Send`-ness was established by
// the container that retired it.
unsafe impl Send for Retired {}
