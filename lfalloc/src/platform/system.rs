//! Implementation of the Platform trait, for non-Unix targets.
//!
//! Memory is obtained from the system allocator.

use std::{alloc::{GlobalAlloc, Layout, System}, ptr::NonNull};

use lfalloc_core::Platform;

/// Implementation of the Platform trait, on top of the system allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPlatform;

impl SystemPlatform {
    /// Creates an instance.
    pub const fn new() -> Self { Self }
}

impl Platform for SystemPlatform {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let pointer = NonNull::new(System.alloc(layout));

        if pointer.is_none() {
            log::error!("allocate: could not allocate {:?}", layout);
        }

        pointer
    }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout) { System.dealloc(pointer.as_ptr(), layout) }
}
