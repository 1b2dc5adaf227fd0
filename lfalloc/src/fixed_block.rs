//! Fixed-Block Allocator, bound to a platform.

use std::{alloc::Layout, fmt, ptr::NonNull};

use lfalloc_core::{self, Platform};

use crate::{Allocate, ConfigurationError, SystemPlatform};
use crate::allocate::out_of_memory;

/// FixedBlockAllocator
///
/// A slab allocator for blocks of a single layout, safe to use concurrently from any number of threads.
///
/// Memory is obtained from the platform in chunks, the first of `initial_blocks` blocks, the following ones growing
/// by half each time.
pub struct FixedBlockAllocator<P: Platform = SystemPlatform>(lfalloc_core::FixedBlockAllocator<P>);

impl FixedBlockAllocator {
    /// Creates an instance for blocks of `layout`, with a first chunk of `initial_blocks` blocks.
    ///
    /// No memory is requested until the first allocation.
    pub fn new(layout: Layout, initial_blocks: usize) -> Result<Self, ConfigurationError> {
        Self::with_platform(SystemPlatform::new(), layout, initial_blocks)
    }

    /// Creates an instance for blocks suitable for `T`, with a first chunk of `initial_blocks` blocks.
    pub fn for_type<T>(initial_blocks: usize) -> Result<Self, ConfigurationError> {
        Self::new(Layout::new::<T>(), initial_blocks)
    }
}

impl<P: Platform> FixedBlockAllocator<P> {
    /// The maximum number of blocks of a single chunk.
    pub const MAX_BLOCKS_PER_CHUNK: usize = lfalloc_core::FixedBlockAllocator::<P>::MAX_BLOCKS_PER_CHUNK;

    /// Creates an instance for blocks of `layout`, with a first chunk of `initial_blocks` blocks, obtaining its memory
    /// from `platform`.
    pub fn with_platform(platform: P, layout: Layout, initial_blocks: usize) -> Result<Self, ConfigurationError> {
        if layout.size() == 0 {
            return Err(ConfigurationError::ZeroBlockSize);
        }

        if initial_blocks == 0 {
            return Err(ConfigurationError::ZeroHint);
        }

        if initial_blocks > Self::MAX_BLOCKS_PER_CHUNK {
            return Err(ConfigurationError::HintTooLarge { hint: initial_blocks, maximum: Self::MAX_BLOCKS_PER_CHUNK, });
        }

        lfalloc_core::FixedBlockAllocator::new(platform, layout, initial_blocks)
            .map(Self)
            .ok_or(ConfigurationError::InvalidLayout(layout))
    }

    /// Returns the layout of the blocks, once padded.
    pub fn block_layout(&self) -> Layout { self.0.block_layout() }

    /// Returns the number of blocks, free or not, across all chunks.
    pub fn capacity(&self) -> usize { self.0.capacity() }

    /// Returns the number of chunks.
    pub fn number_chunks(&self) -> usize { self.0.number_chunks() }

    /// Returns whether `pointer` designates a block of this allocator.
    pub fn owns(&self, pointer: NonNull<u8>) -> bool { self.0.owns(pointer) }

    /// Returns a reference to the platform.
    pub fn platform(&self) -> &P { self.0.platform() }

    /// Allocates one block, or returns None if no memory can be obtained from the platform.
    pub fn try_allocate(&self) -> Option<NonNull<u8>> { self.0.allocate() }

    /// Releases all chunks, then consolidates their aggregate capacity in as few chunks as possible.
    ///
    /// All blocks previously handed out become invalid.
    ///
    /// #   Panics
    ///
    /// Aborts, through `std::alloc::handle_alloc_error`, if the consolidated chunk cannot be obtained.
    pub fn clear(&mut self) {
        let capacity = self.capacity();

        if self.0.clear().is_none() {
            let size = self.block_layout().size().saturating_mul(capacity);
            let layout = Layout::from_size_align(size, self.block_layout().align()).unwrap_or(self.block_layout());

            out_of_memory(layout);
        }
    }
}

impl<P: Platform> Allocate for FixedBlockAllocator<P> {
    fn allocate(&self, count: usize) -> NonNull<u8> {
        debug_assert_eq!(1, count, "Blocks are allocated one at a time");

        match self.try_allocate() {
            Some(block) => block,
            None => out_of_memory(self.block_layout()),
        }
    }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, count: usize) {
        debug_assert_eq!(1, count, "Blocks are deallocated one at a time");

        self.0.deallocate(pointer);
    }
}

impl<P: Platform> fmt::Debug for FixedBlockAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(&self.0, f) }
}
