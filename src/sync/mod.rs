//! Atomic primitives and tagged pointers (component A).

mod atomic;
mod marked_ptr;

pub use self::atomic::Atomic;
pub use self::marked_ptr::{MarkedNonNull, MarkedPtr};
