//! Hazard pointers (component B): a memory reclamation scheme in which each
//! thread publishes the addresses it is currently dereferencing in a small
//! set of globally visible slots ("hazards"). A retired record is only
//! reclaimed once a scan of every hazard slot shows no thread still holds its
//! address, per the contract in §4.B.

mod config;
mod default;
mod global;
mod guard;
mod hazard;
mod local;
mod retired;

pub use self::config::{Config, ConfigBuilder};
pub use self::guard::{Guard, NotEqual};
pub use self::local::RecycleError;

use crate::reclaim::{Disposer, Retired};

/// A handle to the hazard-pointer reclamation scheme.
///
/// `Hp` itself carries no state: every hazard-pointer operation in this crate
/// goes through one shared global list plus a thread-local cache (see
/// [`default`]), and `Hp` is just the type containers program against when
/// choosing hazard pointers over epoch-based reclamation as their SMR scheme.
#[derive(Copy, Clone, Debug, Default)]
pub struct Hp;

impl Hp {
    /// Retires a boxed record, deferring its destruction until no hazard
    /// pointer protects its address any longer.
    ///
    /// # Safety
    ///
    /// The caller must have already unlinked `boxed` from every structure
    /// reachable by other threads.
    #[inline]
    pub unsafe fn retire<T: 'static>(boxed: Box<T>) {
        let retired = Retired::new(boxed);
        default::retire_record(retired);
    }

    /// Retires a record with a custom [`Disposer`] instead of the default
    /// drop-and-deallocate behavior.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Hp::retire`].
    #[inline]
    pub unsafe fn retire_with<T: 'static, D: Disposer<T> + 'static>(boxed: Box<T>, disposer: D) {
        // the disposer is boxed alongside the value so its vtable/drop glue travels with the
        // retired record without needing a second type parameter on `Retired` itself.
        struct Disposed<T, D: Disposer<T>> {
            value: core::mem::ManuallyDrop<Box<T>>,
            disposer: D,
        }
        impl<T, D: Disposer<T>> Drop for Disposed<T, D> {
            fn drop(&mut self) {
                let value = unsafe { core::mem::ManuallyDrop::take(&mut self.value) };
                self.disposer.dispose(value);
            }
        }
        let wrapped = Box::new(Disposed { value: core::mem::ManuallyDrop::new(boxed), disposer });
        let retired = Retired::new(wrapped);
        default::retire_record(retired);
    }
}
