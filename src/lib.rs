//! Concurrent set/map containers built on pluggable safe memory reclamation.
//!
//! Every container in this crate (`list`, `split_list`, `skiplist`,
//! `ellen_tree`) is generic over an [`counter::ItemCounter`] and a
//! [`stat::Stat`] policy, so the cost of tracking size or internal
//! diagnostics compiles away entirely when both are left at `()`. They sit
//! on top of one of two safe memory reclamation substrates: hazard pointers
//! (`hp`, a single global domain) or epoch-based reclamation (`rcu`, one
//! domain per instance). `sync` provides the tagged-pointer primitives both
//! substrates and every container build their lock-free algorithms from.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

pub mod alloc;
pub mod backoff;
pub mod container;
pub mod counter;
pub mod ellen_tree;
pub mod error;
pub mod hp;
pub mod list;
#[cfg(feature = "std")]
pub mod rcu;
mod reclaim;
mod registry;
mod sanitize;
pub mod skiplist;
#[cfg(feature = "std")]
pub mod split_list;
pub mod stat;
pub mod sync;

pub use crate::counter::{AtomicCounter, ItemCounter};
pub use crate::ellen_tree::EllenTreeSet;
pub use crate::error::DeadlockError;
pub use crate::hp::Hp;
pub use crate::list::OrderedListSet;
#[cfg(feature = "std")]
pub use crate::rcu::{DeadlockPolicy, Flavor, ReadGuard, Rcu};
pub use crate::registry::{attach, active_threads, RegistryGuard};
pub use crate::skiplist::{LevelGenerator, SkipListSet, Turbo16, Turbo24, Turbo32, Xorshift16, Xorshift24, Xorshift32};
#[cfg(feature = "std")]
pub use crate::split_list::SplitOrderedSet;
pub use crate::stat::{Event, EventCounters, Stat};
