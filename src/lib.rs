#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

mod coordinator;
mod error;
mod hash_table;

/// A concurrent map using segmented hopscotch hashing.
///
/// This module provides [`ConcurrentMap`], which stores entries in a
/// directory of hopscotch segments and grows by doubling the number of
/// segments.
pub mod hash_map;

pub mod spread;

pub use coordinator::TableState;
pub use error::Error;
pub use error::Result;
pub use hash_map::ConcurrentMap;
pub use hash_map::DEFAULT_CAPACITY;
pub use hash_map::Iter;
pub use hash_map::Options;
pub use hash_table::ADD_RANGE;
#[cfg(any(test, feature = "stats"))]
pub use hash_table::DebugStats;
pub use hash_table::HOP_RANGE;
pub use hash_table::MAX_SEGMENTS;

cfg_if::cfg_if! {
    if #[cfg(feature = "foldhash")] {
        /// The hasher builder used when none is given.
        pub type DefaultHashBuilder = foldhash::fast::RandomState;
    } else {
        /// The hasher builder used when none is given.
        pub type DefaultHashBuilder = std::collections::hash_map::RandomState;
    }
}
