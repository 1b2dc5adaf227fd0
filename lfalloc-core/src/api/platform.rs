//! Platform
//!
//! The Platform trait is used to request memory directly from the Platform. By abstracting the underlying platform,
//! it becomes possible to easily port the code to a different OS, or even to a bare-metal target.
//!
//! Chunks and buckets are the only memory ever requested from the Platform, and they are only returned to it when the
//! allocator owning them is dropped (or, for chunks, cleared).

use core::{
    alloc::Layout,
    ptr::NonNull,
};

/// Abstraction of platform specific memory allocation and deallocation.
pub trait Platform {
    /// Allocates a fresh block of memory as per the specified layout.
    ///
    /// Returns None if the allocation request cannot be satisfied; the allocators do not retry.
    ///
    /// #   Safety
    ///
    /// The caller may assume that if the returned pointer is not null then:
    /// -   The number of usable bytes is _greater than or equal_ to `layout.size()`.
    /// -   The pointer is _at least_ aligned to `layout.align()`.
    ///
    /// `allocate` assumes that:
    /// -   `layout.size()` is non-zero.
    /// -   `layout.align()` is non-zero, and is a power of 2.
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Deallocates the supplied block of memory.
    ///
    /// #   Safety
    ///
    /// The caller should no longer reference the memory after calling this function.
    ///
    /// `deallocate` assumes that:
    /// -   `pointer` was allocated by this instance of `Platform`, with `layout` as argument.
    /// -   `pointer` is the value returned by `Plaform`, and not an interior pointer.
    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout);
}

impl<'a, P: Platform + ?Sized> Platform for &'a P {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> { (**self).allocate(layout) }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout) { (**self).deallocate(pointer, layout) }
}
