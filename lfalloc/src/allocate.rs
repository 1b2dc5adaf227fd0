//! The interface of the allocators.

use std::{alloc::{self, Layout}, ptr::NonNull};

/// Allocate
///
/// The minimal allocation interface, as consumed by containers and pools.
///
/// The meaning of `count` depends on the allocator: a number of blocks for `FixedBlockAllocator`, which only ever
/// allocates 1 at a time, and a number of bytes for `RingAllocator`.
pub trait Allocate {
    /// Allocates `count` units.
    ///
    /// #   Panics
    ///
    /// Aborts, through `std::alloc::handle_alloc_error`, if the memory cannot be obtained.
    fn allocate(&self, count: usize) -> NonNull<u8>;

    /// Deallocates `count` units.
    ///
    /// #   Safety
    ///
    /// -   `pointer` must have been returned by `self.allocate(count)`, with the same `count`.
    /// -   `pointer` must not have been deallocated since.
    unsafe fn deallocate(&self, pointer: NonNull<u8>, count: usize);
}

//  Out of memory is not recoverable.
#[cold]
#[inline(never)]
pub(crate) fn out_of_memory(layout: Layout) -> ! {
    log::error!("out of memory: could not allocate {:?}", layout);

    alloc::handle_alloc_error(layout)
}
