//! Ring Allocator, bound to a platform.

use std::{alloc::Layout, fmt, ptr::NonNull};

use lfalloc_core::{self, Platform};

use crate::{Allocate, ConfigurationError, SystemPlatform};
use crate::allocate::out_of_memory;

/// RingAllocator
///
/// A bump allocator for allocations of any size, safe to use concurrently from any number of threads.
///
/// Allocations are carved from large buckets, the first of `initial_capacity` bytes; once the current bucket is
/// exhausted it is replaced by a drained bucket, or a larger one. A bucket is drained once all the allocations carved
/// from it were deallocated.
///
/// All allocations are aligned on `ALIGNMENT`.
pub struct RingAllocator<P: Platform = SystemPlatform>(lfalloc_core::RingAllocator<P>);

impl RingAllocator {
    /// Creates an instance, with a first bucket of `initial_capacity` bytes.
    ///
    /// No memory is requested until the first allocation.
    pub fn new(initial_capacity: usize) -> Result<Self, ConfigurationError> {
        Self::with_platform(SystemPlatform::new(), initial_capacity)
    }
}

impl<P: Platform> RingAllocator<P> {
    /// The alignment of all allocations.
    pub const ALIGNMENT: usize = lfalloc_core::RingAllocator::<P>::ALIGNMENT.value();

    /// The maximum capacity of a bucket.
    pub const MAX_CAPACITY: usize = lfalloc_core::RingAllocator::<P>::MAX_CAPACITY;

    /// Creates an instance, with a first bucket of `initial_capacity` bytes, obtaining its memory from `platform`.
    pub fn with_platform(platform: P, initial_capacity: usize) -> Result<Self, ConfigurationError> {
        if initial_capacity == 0 {
            return Err(ConfigurationError::ZeroHint);
        }

        if initial_capacity > Self::MAX_CAPACITY {
            return Err(ConfigurationError::HintTooLarge { hint: initial_capacity, maximum: Self::MAX_CAPACITY, });
        }

        Ok(Self(lfalloc_core::RingAllocator::new(platform, initial_capacity)))
    }

    /// Returns the number of buckets.
    pub fn number_buckets(&self) -> usize { self.0.number_buckets() }

    /// Returns the capacity of the current bucket, or 0 prior to the first allocation.
    pub fn current_capacity(&self) -> usize { self.0.current_capacity() }

    /// Returns the number of times the current bucket was replaced.
    pub fn replacements(&self) -> usize { self.0.replacements() }

    /// Returns whether `pointer` lies within one of the buckets of this allocator.
    pub fn owns(&self, pointer: NonNull<u8>) -> bool { self.0.owns(pointer) }

    /// Returns a reference to the platform.
    pub fn platform(&self) -> &P { self.0.platform() }

    /// Allocates `size` bytes, or returns None if they cannot be obtained.
    pub fn try_allocate(&self, size: usize) -> Option<NonNull<u8>> { self.0.allocate(size) }

    /// Returns the size of the allocation, as requested.
    ///
    /// #   Safety
    ///
    /// -   `pointer` must have been returned by `self.allocate()`, and not been deallocated since.
    pub unsafe fn size_of_allocation(&self, pointer: NonNull<u8>) -> usize { self.0.size_of_allocation(pointer) }
}

impl<P: Platform> Allocate for RingAllocator<P> {
    fn allocate(&self, count: usize) -> NonNull<u8> {
        match self.try_allocate(count) {
            Some(allocation) => allocation,
            None => {
                let layout = Layout::from_size_align(count, Self::ALIGNMENT).unwrap_or(Layout::new::<u8>());
                out_of_memory(layout)
            },
        }
    }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, count: usize) {
        debug_assert_eq!(count, self.size_of_allocation(pointer));

        self.0.deallocate(pointer);
    }
}

impl<P: Platform> fmt::Debug for RingAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(&self.0, f) }
}
