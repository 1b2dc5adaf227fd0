#![deny(missing_docs)]

//! Lock-free memory allocators.
//!
//! The allocators carve memory obtained from the operating system, concurrently, without locks on the hot path:
//!
//! -   `FixedBlockAllocator` hands out blocks of a single layout, for node-based containers and object pools.
//! -   `RingAllocator` hands out allocations of any size, from large shared buckets recycled once drained.
//!
//! Both implement `Allocate`, the minimal allocate/deallocate interface expected by their consumers.
//!
//! Each allocator owns all of its state, and returns all of its memory to the operating system when dropped.
//!
//! #   Example
//!
//! ```
//! use lfalloc::{Allocate, FixedBlockAllocator};
//!
//! let allocator = FixedBlockAllocator::for_type::<[u64; 4]>(16).expect("Valid configuration");
//!
//! let block = allocator.allocate(1);
//!
//! unsafe {
//!     block.cast::<[u64; 4]>().as_ptr().write([1, 2, 3, 4]);
//!     allocator.deallocate(block, 1);
//! }
//! ```

mod allocate;
mod error;
mod fixed_block;
mod platform;
mod ring;

pub use allocate::Allocate;
pub use error::ConfigurationError;
pub use fixed_block::FixedBlockAllocator;
pub use platform::SystemPlatform;
pub use ring::RingAllocator;

pub use lfalloc_core::Platform;
