#![cfg_attr(not(test), no_std)]

#![deny(missing_docs)]

//! Building blocks for lock-free memory allocation.
//!
//! lfalloc-core is a set of building blocks to carve memory concurrently, without locks on the hot path. It contains:
//! -   A platform trait, used to allocate large raw regions of memory to be carved up.
//! -   A uniform layer of atomic primitives, and a versioned lock-free stack of indices built on top of it.
//! -   A write-preferring reader/writer spinlock.
//! -   A fixed-block (slab) allocator, and a ring (bucket) allocator for variable-sized requests.
//!
//! No process-wide state is involved: every allocator owns all of its state, and releases its memory on drop.

mod api;
mod internals;
mod utils;

pub use api::*;
