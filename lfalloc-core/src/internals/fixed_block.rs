//! Fixed-Block Allocator.
//!
//! A slab allocator, handing out blocks of a single layout, carved from chunks requested from the `Platform`.
//!
//! Each block is designated by a 32-bits index: the top 8 bits select the chunk, and the low 24 bits the block within
//! the chunk. The free blocks are kept in a `TaggedStack` of such indices, whose links live in the first 4 bytes of
//! the free blocks themselves.
//!
//! Chunks are append-only: they are only ever returned to the `Platform` by `clear`, or on drop, both of which require
//! exclusive access.
//!
//! When the free list runs dry, a single thread grows the allocator by one chunk, the size of which follows the
//! growth sequence of `utils::grow` starting from the initial hint.

use core::{alloc::Layout, cmp, fmt, hint, mem, ptr::{self, NonNull}};

use crate::{Platform, PowerOf2};
use crate::utils;

use super::atomic::{Atomic, AtomicPtr};
use super::tagged_stack::{StackLinks, TaggedStack};

/// FixedBlockAllocator
///
/// Hands out blocks of a fixed layout, concurrently, without locks.
pub struct FixedBlockAllocator<P: Platform> {
    free: TaggedStack,
    chunks: Chunks,
    growing: Atomic<u8>,
    layout: Layout,
    hint: usize,
    platform: P,
}

impl<P: Platform> FixedBlockAllocator<P> {
    /// The maximum number of chunks.
    pub const MAX_CHUNKS: usize = MAX_CHUNKS;

    /// The maximum number of blocks within a single chunk.
    pub const MAX_BLOCKS_PER_CHUNK: usize = MAX_BLOCKS_PER_CHUNK;

    /// Creates an instance, handing out blocks of `layout`, with an initial chunk of `hint` blocks.
    ///
    /// The layout is normalized: its alignment is raised to at least 4, and its size to at least 4 then rounded up to
    /// a multiple of the alignment. The hint is clamped to `[1, MAX_BLOCKS_PER_CHUNK]`.
    ///
    /// No memory is requested from the platform until the first allocation.
    ///
    /// Returns None if the normalized layout cannot be represented.
    pub fn new(platform: P, layout: Layout, hint: usize) -> Option<Self> {
        let layout = Self::normalize(layout)?;
        let hint = cmp::min(cmp::max(hint, 1), MAX_BLOCKS_PER_CHUNK);

        let free = TaggedStack::new();
        let chunks = Chunks::new(layout.size());
        let growing = Atomic::new(0);

        Some(Self { free, chunks, growing, layout, hint, platform, })
    }

    /// Returns the layout of the blocks, once normalized.
    pub fn block_layout(&self) -> Layout { self.layout }

    /// Returns the size, in blocks, of the initial chunk.
    pub fn hint(&self) -> usize { self.hint }

    /// Returns the number of blocks, free or not, across all chunks.
    pub fn capacity(&self) -> usize { self.chunks.capacity() }

    /// Returns the number of chunks.
    pub fn number_chunks(&self) -> usize { self.chunks.len() }

    /// Returns whether `pointer` designates a block of this allocator.
    pub fn owns(&self, pointer: NonNull<u8>) -> bool { self.chunks.index_of(pointer).is_some() }

    /// Returns a reference to the platform.
    pub fn platform(&self) -> &P { &self.platform }

    /// Allocates one block.
    ///
    /// Returns None if the free list is empty and a new chunk cannot be obtained from the platform.
    #[inline]
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        loop {
            if let Some(index) = self.free.pop(&self.chunks) {
                return Some(self.chunks.block(index));
            }

            self.refill()?;
        }
    }

    /// Deallocates one block.
    ///
    /// #   Safety
    ///
    /// -   `pointer` must have been returned by `self.allocate()`, and not been deallocated since.
    pub unsafe fn deallocate(&self, pointer: NonNull<u8>) {
        //  Scans the chunks, newest first: at most `MAX_CHUNKS`, and in practice a handful given the growth rate.
        let index = self.chunks.index_of(pointer);

        debug_assert!(index.is_some(), "{:?} is not a block of this allocator", pointer);

        if let Some(index) = index {
            self.free.push(index, &self.chunks);
        }
    }

    /// Releases all chunks, then consolidates their aggregate capacity into as few chunks as possible.
    ///
    /// All blocks previously handed out become invalid.
    ///
    /// Returns the new capacity, or None if the platform could not provide the consolidated chunk(s), in which case
    /// the allocator is left with whatever capacity it did obtain.
    pub fn clear(&mut self) -> Option<usize> {
        let capacity = self.capacity();

        self.release();
        self.free = TaggedStack::new();

        let mut remaining = capacity;

        while remaining > 0 {
            let blocks = cmp::min(remaining, MAX_BLOCKS_PER_CHUNK);

            self.add_chunk(blocks)?;

            remaining -= blocks;
        }

        log::debug!("clear: {} blocks of {} bytes in {} chunk(s)", capacity, self.layout.size(), self.number_chunks());

        Some(capacity)
    }

    //  Internal.
    fn normalize(layout: Layout) -> Option<Layout> {
        let align = cmp::max(layout.align(), mem::align_of::<Atomic<u32>>());
        let size = cmp::max(layout.size(), mem::size_of::<Atomic<u32>>());

        Layout::from_size_align(size, align).ok().map(|layout| layout.pad_to_align())
    }

    //  Internal.
    //
    //  Either grows the allocator, or waits for the thread growing it.
    #[cold]
    #[inline(never)]
    fn refill(&self) -> Option<()> {
        if self.growing.bit_test_and_set(0) {
            while self.growing.load() != 0 {
                hint::spin_loop();
            }

            return Some(());
        }

        //  Blocks may have been deallocated, or another thread may have grown, since the last pop.
        let result = if self.free.is_empty() { self.grow() } else { Some(()) };

        self.growing.bit_test_and_reset(0);

        result
    }

    //  Internal.
    //
    //  Requires holding the `growing` flag.
    fn grow(&self) -> Option<()> {
        let blocks = match self.chunks.len().checked_sub(1) {
            None => self.hint,
            Some(last) => cmp::min(utils::grow(self.chunks.blocks(last), self.hint), MAX_BLOCKS_PER_CHUNK),
        };

        self.add_chunk(blocks)
    }

    //  Internal.
    //
    //  Requires holding the `growing` flag, or exclusive access.
    fn add_chunk(&self, blocks: usize) -> Option<()> {
        debug_assert!(blocks > 0 && blocks <= MAX_BLOCKS_PER_CHUNK, "{}", blocks);

        let chunk = self.chunks.len();

        if chunk >= MAX_CHUNKS {
            log::warn!("add_chunk: all {} chunks in use", MAX_CHUNKS);
            return None;
        }

        let layout = self.chunk_layout(blocks)?;

        //  Safety:
        //  -   `layout.size()` is non-zero, as `blocks` and the block size are non-zero.
        let Some(base) = (unsafe { self.platform.allocate(layout) }) else {
            log::debug!("add_chunk: platform could not allocate {:?}", layout);
            return None;
        };

        debug_assert!(utils::is_sufficiently_aligned_for(base, PowerOf2::align_of_layout(layout)));

        let block_size = self.layout.size();

        for block in 0..blocks {
            let next = if block + 1 < blocks { index_of(chunk, block + 1) } else { TaggedStack::NULL };

            //  Safety:
            //  -   Within the bounds of the chunk.
            //  -   Suitably aligned, as the block alignment is at least that of `Atomic<u32>`.
            unsafe { ptr::write(base.as_ptr().add(block * block_size) as *mut Atomic<u32>, Atomic::new(next)) };
        }

        self.chunks.publish(chunk, base, blocks);

        //  Safety:
        //  -   The blocks of the new chunk are owned by this thread, and linked from first to last.
        unsafe { self.free.push_chain(index_of(chunk, 0), index_of(chunk, blocks - 1), &self.chunks) };

        log::debug!("add_chunk: chunk {} of {} blocks of {} bytes", chunk, blocks, block_size);

        Some(())
    }

    //  Internal.
    fn chunk_layout(&self, blocks: usize) -> Option<Layout> {
        let size = self.layout.size().checked_mul(blocks)?;

        Layout::from_size_align(size, self.layout.align()).ok()
    }

    //  Internal.
    //
    //  Returns all chunks to the platform.
    fn release(&mut self) {
        for chunk in 0..self.chunks.len() {
            let (base, blocks) = self.chunks.take(chunk);

            let (Some(base), Some(layout)) = (base, self.chunk_layout(blocks)) else {
                debug_assert!(false, "Chunk {} was not published", chunk);
                continue;
            };

            //  Safety:
            //  -   `base` was allocated by `self.platform`, with `layout`.
            unsafe { self.platform.deallocate(base, layout) };
        }

        self.chunks.length.store(0);
    }
}

impl<P: Platform> Drop for FixedBlockAllocator<P> {
    fn drop(&mut self) { self.release(); }
}

impl<P: Platform> fmt::Debug for FixedBlockAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedBlockAllocator")
            .field("layout", &self.layout)
            .field("hint", &self.hint)
            .field("chunks", &self.number_chunks())
            .field("capacity", &self.capacity())
            .finish()
    }
}

//
//  Implementation
//

const MAX_CHUNKS: usize = 255;

const CHUNK_SHIFT: u32 = 24;

const MAX_BLOCKS_PER_CHUNK: usize = 1 << CHUNK_SHIFT;

const BLOCK_MASK: u32 = (1 << CHUNK_SHIFT) - 1;

//  The chunk index of `MAX_CHUNKS` is never used, hence `TaggedStack::NULL` never designates a block.
fn index_of(chunk: usize, block: usize) -> u32 {
    debug_assert!(chunk < MAX_CHUNKS, "{}", chunk);
    debug_assert!(block < MAX_BLOCKS_PER_CHUNK, "{}", block);

    (chunk as u32) << CHUNK_SHIFT | block as u32
}

fn split_index(index: u32) -> (usize, usize) { ((index >> CHUNK_SHIFT) as usize, (index & BLOCK_MASK) as usize) }

#[derive(Default)]
struct Chunk {
    base: AtomicPtr<u8>,
    blocks: Atomic<u32>,
}

//  The table of chunks.
//
//  A chunk slot is written once, before `length` is incremented to cover it, and only reset under exclusive access.
struct Chunks {
    block_size: usize,
    length: Atomic<usize>,
    slots: [Chunk; MAX_CHUNKS],
}

impl Chunks {
    fn new(block_size: usize) -> Self {
        Self { block_size, length: Atomic::new(0), slots: core::array::from_fn(|_| Chunk::default()), }
    }

    fn len(&self) -> usize { self.length.load() }

    fn blocks(&self, chunk: usize) -> usize { self.slots[chunk].blocks.load() as usize }

    fn capacity(&self) -> usize { (0..self.len()).map(|chunk| self.blocks(chunk)).sum() }

    fn publish(&self, chunk: usize, base: NonNull<u8>, blocks: usize) {
        debug_assert_eq!(chunk, self.len());

        self.slots[chunk].blocks.store(blocks as u32);
        self.slots[chunk].base.store(Some(base));
        self.length.store(chunk + 1);
    }

    fn take(&self, chunk: usize) -> (Option<NonNull<u8>>, usize) {
        let slot = &self.slots[chunk];

        (slot.base.exchange(None), slot.blocks.fetch_exchange(0) as usize)
    }

    //  Returns the address of the block designated by `index`.
    fn block(&self, index: u32) -> NonNull<u8> {
        let (chunk, block) = split_index(index);

        let base = self.slots[chunk].base.load();

        debug_assert!(base.is_some(), "Chunk {} is not published", chunk);
        debug_assert!(block < self.blocks(chunk), "{} >= {}", block, self.blocks(chunk));

        //  Safety:
        //  -   Indices are only handed out after their chunk was published.
        //  -   The block is within the bounds of its chunk.
        unsafe {
            let base = base.unwrap_unchecked();
            NonNull::new_unchecked(base.as_ptr().add(block * self.block_size))
        }
    }

    //  Returns the index of the block at `pointer`, if any.
    //
    //  The most recent chunks are the largest, hence are checked first.
    fn index_of(&self, pointer: NonNull<u8>) -> Option<u32> {
        let address = pointer.as_ptr() as usize;

        for chunk in (0..self.len()).rev() {
            let Some(base) = self.slots[chunk].base.load() else { continue };

            let offset = address.wrapping_sub(base.as_ptr() as usize);

            if offset >= self.blocks(chunk) * self.block_size {
                continue;
            }

            debug_assert!(offset % self.block_size == 0, "{:?} is not on a block boundary", pointer);

            return if offset % self.block_size == 0 { Some(index_of(chunk, offset / self.block_size)) } else { None };
        }

        None
    }
}

//  Safety:
//  -   The link of a block is its first 4 bytes, which remain valid until the chunk is released, which requires
//      exclusive access.
unsafe impl StackLinks for Chunks {
    fn link(&self, index: u32) -> &Atomic<u32> {
        let block = self.block(index);

        //  Safety:
        //  -   The block is at least 4 bytes, and aligned on at least 4 bytes.
        unsafe { &*(block.as_ptr() as *const Atomic<u32>) }
    }
}

// mod tests
