//! Ring Allocator.
//!
//! A bump allocator for allocations of any size, carved from buckets requested from the `Platform`.
//!
//! #   Buckets
//!
//! A bucket is a large region of memory, starting with its own header, followed by its payload. Allocations are
//! carved from the payload of the _current_ bucket by bumping its `reserved` counter.
//!
//! Each allocation holds a read lock on its bucket for as long as it is outstanding, and is preceded by an
//! `AllocationHeader` pointing back to its bucket, so that deallocation only requires the pointer.
//!
//! #   Replacement
//!
//! Once the current bucket cannot fit a request, a single thread, elected by the `replacing` flag, replaces it by
//! either a recycled bucket large enough, or a fresh bucket at least large enough for the request and larger than the
//! bucket it replaces.
//!
//! #   Retirement
//!
//! A bucket which is no longer current, and on which no allocation is outstanding, is retired: under its write lock,
//! its `reserved` counter is reset and it is pushed onto the `gc` stack, ready for reuse.
//!
//! Any thread which may have been the last obstacle to retirement checks for it: the replacer after swapping the
//! current bucket, and any thread releasing a read lock.
//!
//! Buckets are only ever returned to the `Platform` on drop.

use core::{alloc::Layout, cmp, fmt, hint, mem, ptr::{self, NonNull}};

use crate::{Platform, PowerOf2};
use crate::utils;

use super::atomic::{barrier, Atomic, AtomicPtr};
use super::rw_lock::RwLock;
use super::tagged_stack::{StackLinks, TaggedStack};

/// RingAllocator
///
/// Hands out allocations of any size, concurrently, without locks on the fast path.
pub struct RingAllocator<P: Platform> {
    current: AtomicPtr<Bucket>,
    gc: TaggedStack,
    registry: Registry,
    replacing: Atomic<u8>,
    replacements: Atomic<usize>,
    largest: Atomic<usize>,
    hint: usize,
    platform: P,
}

impl<P: Platform> RingAllocator<P> {
    /// The alignment of all allocations.
    pub const ALIGNMENT: PowerOf2 = ALIGNMENT;

    /// The maximum capacity of a bucket, in bytes.
    pub const MAX_CAPACITY: usize = MAX_CAPACITY;

    /// Creates an instance, whose first bucket will have a capacity of `hint` bytes.
    ///
    /// The hint is raised to at least `ALIGNMENT`, and rounded up to a multiple of it.
    ///
    /// No memory is requested from the platform until the first allocation.
    pub fn new(platform: P, hint: usize) -> Self {
        let hint = ALIGNMENT.checked_round_up(cmp::max(hint, 1)).unwrap_or(MAX_CAPACITY);
        let hint = cmp::min(hint, MAX_CAPACITY);

        let current = AtomicPtr::default();
        let gc = TaggedStack::new();
        let registry = Registry::new();
        let replacing = Atomic::new(0);
        let replacements = Atomic::new(0);
        let largest = Atomic::new(0);

        Self { current, gc, registry, replacing, replacements, largest, hint, platform, }
    }

    /// Returns the capacity of the first bucket.
    pub fn hint(&self) -> usize { self.hint }

    /// Returns the number of buckets, whether current, in use, or available for reuse.
    pub fn number_buckets(&self) -> usize { self.registry.len() }

    /// Returns the capacity of the current bucket, if any, or 0.
    pub fn current_capacity(&self) -> usize {
        //  Safety:
        //  -   Buckets live as long as `self`.
        self.current.load().map(|bucket| unsafe { bucket.as_ref() }.capacity).unwrap_or(0)
    }

    /// Returns the number of times the current bucket was replaced.
    pub fn replacements(&self) -> usize { self.replacements.load() }

    /// Returns whether `pointer` lies within the payload of one of the buckets of this allocator.
    pub fn owns(&self, pointer: NonNull<u8>) -> bool { self.registry.find(pointer).is_some() }

    /// Returns a reference to the platform.
    pub fn platform(&self) -> &P { &self.platform }

    /// Allocates `size` bytes, aligned on `ALIGNMENT`.
    ///
    /// Returns None if `size` is too large to ever be allocated, or the platform cannot provide a bucket to fit it.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let needed = Self::needed(size)?;

        loop {
            let Some(bucket) = self.current.load() else {
                self.replace(None, needed)?;
                continue;
            };

            //  Safety:
            //  -   Buckets live as long as `self`.
            let current = unsafe { bucket.as_ref() };

            if !current.fits(current.reserved.load(), needed) {
                self.replace(Some(bucket), needed)?;
                continue;
            }

            //  The bucket is being retired, or recycled.
            if !current.lock.try_read_lock() {
                hint::spin_loop();
                continue;
            }

            //  Pairs with the barrier in `install`: either the replacer sees this reader, or this thread sees the
            //  replacement.
            barrier();

            if self.current.load() != Some(bucket) {
                self.release(bucket);
                continue;
            }

            let offset = current.reserved.fetch_add(needed);

            if current.fits(offset, needed) {
                //  Safety:
                //  -   `offset..offset+needed` is exclusively reserved, and within the payload.
                //  -   The read lock is held, and handed over to the allocation.
                return Some(unsafe { current.carve(offset, size, needed) });
            }

            //  Only roll back if no other reservation was stacked on top of this one, lest the range be handed out
            //  again while the other is still outstanding.
            current.reserved.compare_and_swap(offset, offset.wrapping_add(needed));

            self.release(bucket);
            self.replace(Some(bucket), needed)?;
        }
    }

    /// Deallocates an allocation.
    ///
    /// #   Safety
    ///
    /// -   `pointer` must have been returned by `self.allocate()`, and not been deallocated since.
    pub unsafe fn deallocate(&self, pointer: NonNull<u8>) {
        let header = AllocationHeader::of(pointer);
        let bucket = header.bucket;

        debug_assert!(self.registry.find(pointer) == Some(bucket), "{:?} is not an allocation of this allocator", pointer);

        self.release(bucket);
    }

    /// Returns the size requested for the allocation.
    ///
    /// #   Safety
    ///
    /// -   `pointer` must have been returned by `self.allocate()`, and not been deallocated since.
    pub unsafe fn size_of_allocation(&self, pointer: NonNull<u8>) -> usize { AllocationHeader::of(pointer).size }

    //  Internal.
    //
    //  Returns the number of bytes to reserve for `size`.
    fn needed(size: usize) -> Option<usize> {
        let needed = ALIGNMENT.checked_round_up(size)?.checked_add(HEADER_SIZE)?;

        if needed <= MAX_CAPACITY { Some(needed) } else { None }
    }

    //  Internal.
    //
    //  Releases a read lock, then retires the bucket if this was its last reader.
    fn release(&self, bucket: NonNull<Bucket>) {
        //  Safety:
        //  -   Buckets live as long as `self`.
        let released = unsafe { bucket.as_ref() };

        released.lock.read_unlock();

        //  Pairs with the barrier in `install`: either the replacer sees this reader gone, or this thread sees the
        //  replacement.
        barrier();

        self.try_retire(bucket);
    }

    //  Internal.
    //
    //  Either replaces `observed`, or waits for the thread replacing it.
    #[cold]
    #[inline(never)]
    fn replace(&self, observed: Option<NonNull<Bucket>>, needed: usize) -> Option<()> {
        if self.replacing.bit_test_and_set(0) {
            while self.replacing.load() != 0 {
                hint::spin_loop();
            }

            return Some(());
        }

        //  Another thread may have replaced it in the meantime.
        let result = if self.current.load() == observed { self.install(observed, needed) } else { Some(()) };

        self.replacing.bit_test_and_reset(0);

        result
    }

    //  Internal.
    //
    //  Requires holding the `replacing` flag.
    fn install(&self, old: Option<NonNull<Bucket>>, needed: usize) -> Option<()> {
        match self.recycle(needed) {
            Some(bucket) => {
                //  Safety:
                //  -   Buckets live as long as `self`.
                let recycled = unsafe { bucket.as_ref() };

                //  Stale readers may still attempt to retire it; under the lock they see it either parked or current.
                recycled.lock.lock();
                recycled.parked.store(0);
                self.current.store(Some(bucket));
                recycled.lock.unlock();

                log::trace!("install: recycled bucket {} of {} bytes", recycled.index, recycled.capacity);
            },
            None => {
                let bucket = self.create(old, needed)?;
                self.current.store(Some(bucket));
            },
        }

        let Some(old) = old else { return Some(()) };

        self.replacements.fetch_add(1);

        //  Pairs with the barriers in `allocate` and `release`.
        barrier();

        self.try_retire(old);

        Some(())
    }

    //  Internal.
    //
    //  Pops buckets off `gc` until one is large enough; the ones too small are pushed back, in a single chain.
    //
    //  Requires holding the `replacing` flag.
    fn recycle(&self, needed: usize) -> Option<NonNull<Bucket>> {
        let mut found = None;
        let mut skipped: Option<(u32, u32)> = None;

        while let Some(index) = self.gc.pop(&self.registry) {
            let bucket = self.registry.bucket(index);

            //  Safety:
            //  -   Buckets live as long as `self`.
            if unsafe { bucket.as_ref() }.capacity >= needed {
                found = Some(bucket);
                break;
            }

            skipped = match skipped {
                None => Some((index, index)),
                Some((first, last)) => {
                    self.registry.link(index).store(first);
                    Some((index, last))
                },
            };
        }

        if let Some((first, last)) = skipped {
            //  Safety:
            //  -   The chain was just popped, hence is owned, and its buckets are still parked.
            unsafe { self.gc.push_chain(first, last, &self.registry) };
        }

        found
    }

    //  Internal.
    //
    //  Requires holding the `replacing` flag.
    fn create(&self, old: Option<NonNull<Bucket>>, needed: usize) -> Option<NonNull<Bucket>> {
        let index = self.registry.len();

        self.registry.reserve(index, &self.platform)?;

        //  Safety:
        //  -   Buckets live as long as `self`.
        let previous = old.map(|bucket| unsafe { bucket.as_ref() }.capacity).unwrap_or(0);

        //  A recycled bucket may be smaller than earlier ones; growth resumes from the largest.
        let previous = cmp::max(previous, self.largest.load());

        //  Never smaller than the request it is created for.
        let capacity = cmp::max(utils::grow(previous, self.hint), needed);
        let capacity = ALIGNMENT.checked_round_up(capacity)?;

        debug_assert!(capacity >= needed);

        let layout = Bucket::layout(capacity)?;

        //  Safety:
        //  -   `layout.size()` is non-zero, as it includes the bucket header.
        let Some(base) = (unsafe { self.platform.allocate(layout) }) else {
            log::debug!("create: platform could not allocate {:?}", layout);
            return None;
        };

        debug_assert!(utils::is_sufficiently_aligned_for(base, PowerOf2::align_of_layout(layout)));

        let bucket = base.cast::<Bucket>();

        //  Safety:
        //  -   `base` is suitably sized and aligned for a `Bucket` followed by `capacity` bytes.
        unsafe {
            ptr::write(bucket.as_ptr(), Bucket::new(capacity, index as u32));
            bucket.as_ref().poison();
        }

        self.registry.publish(index, bucket);
        self.largest.store(capacity);

        log::debug!("create: bucket {} of {} bytes", index, capacity);

        Some(bucket)
    }

    //  Internal.
    //
    //  Parks the bucket in `gc`, if not current and no allocation is outstanding.
    fn try_retire(&self, bucket: NonNull<Bucket>) {
        //  Safety:
        //  -   Buckets live as long as `self`.
        let retiree = unsafe { bucket.as_ref() };

        if self.current.load() == Some(bucket) || retiree.lock.readers() != 0 {
            return;
        }

        //  Whoever holds the lock, reader or writer, will see the bucket through.
        if !retiree.lock.try_lock_strict() {
            return;
        }

        if self.current.load() != Some(bucket) && retiree.parked.load() == 0 {
            retiree.parked.store(1);
            retiree.reserved.store(0);

            //  Safety:
            //  -   No allocation is outstanding, and the write lock is held, hence the payload is exclusive.
            //  -   Being parked, the index is not within `gc`, and is owned under the lock.
            unsafe {
                retiree.poison();
                self.gc.push(retiree.index, &self.registry);
            }

            log::trace!("try_retire: parked bucket {} of {} bytes", retiree.index, retiree.capacity);
        }

        retiree.lock.unlock();
    }
}

impl<P: Platform> Drop for RingAllocator<P> {
    fn drop(&mut self) {
        for index in 0..self.registry.len() {
            let Some(bucket) = self.registry.slot(index).and_then(|slot| slot.exchange(None)) else { continue };

            //  Safety:
            //  -   Buckets live as long as `self`.
            let capacity = unsafe { bucket.as_ref() }.capacity;

            let Some(layout) = Bucket::layout(capacity) else {
                debug_assert!(false, "Bucket {} of {} bytes has no layout", index, capacity);
                continue;
            };

            //  Safety:
            //  -   `bucket` was allocated by `self.platform`, with `layout`.
            unsafe { self.platform.deallocate(bucket.cast(), layout) };
        }

        //  Safety:
        //  -   The segments were allocated by `self.platform`, and no bucket is referenced any longer.
        unsafe { self.registry.release(&self.platform) };

        self.current.store(None);
    }
}

impl<P: Platform> fmt::Debug for RingAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingAllocator")
            .field("hint", &self.hint)
            .field("buckets", &self.number_buckets())
            .field("current_capacity", &self.current_capacity())
            .field("replacements", &self.replacements())
            .finish()
    }
}

//
//  Implementation
//

const ALIGNMENT: PowerOf2 = unsafe { PowerOf2::new_unchecked(16) };

//  The registry holds `FIRST_SEGMENT << s` buckets in its segment `s`; the first is inline.
const FIRST_SEGMENT: usize = 64;

//  Keeps every bucket index below `TaggedStack::NULL`.
const MAX_SEGMENTS: usize = 26;

const HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();

const PAYLOAD_OFFSET: usize = ALIGNMENT.round_up(mem::size_of::<Bucket>());

//  Keeps the bucket layout within `isize::MAX`.
const MAX_CAPACITY: usize = ALIGNMENT.round_down(isize::MAX as usize - PAYLOAD_OFFSET - mem::align_of::<Bucket>());

const POISON: u8 = 0xA5;

#[repr(C, align(16))]
struct AllocationHeader {
    size: usize,
    bucket: NonNull<Bucket>,
}

impl AllocationHeader {
    //  Safety:
    //  -   `pointer` must have been returned by `RingAllocator::allocate`, and not been deallocated since.
    unsafe fn of<'a>(pointer: NonNull<u8>) -> &'a AllocationHeader {
        &*(pointer.as_ptr().sub(HEADER_SIZE) as *const AllocationHeader)
    }
}

#[repr(C, align(64))]
struct Bucket {
    capacity: usize,
    reserved: Atomic<usize>,
    lock: RwLock,
    index: u32,
    parked: Atomic<u8>,
    link: Atomic<u32>,
}

impl Bucket {
    fn new(capacity: usize, index: u32) -> Self {
        Self {
            capacity,
            reserved: Atomic::new(0),
            lock: RwLock::new(),
            index,
            parked: Atomic::new(0),
            link: Atomic::new(TaggedStack::NULL),
        }
    }

    fn layout(capacity: usize) -> Option<Layout> {
        Layout::from_size_align(PAYLOAD_OFFSET.checked_add(capacity)?, mem::align_of::<Bucket>()).ok()
    }

    fn payload(&self) -> *mut u8 { unsafe { (self as *const Self as *mut u8).add(PAYLOAD_OFFSET) } }

    fn fits(&self, offset: usize, needed: usize) -> bool {
        offset <= self.capacity && self.capacity - offset >= needed
    }

    //  Writes the header of the allocation at `offset`, and returns the pointer past it.
    //
    //  Safety:
    //  -   `offset..offset+needed` must be exclusively reserved, and within the payload.
    unsafe fn carve(&self, offset: usize, size: usize, needed: usize) -> NonNull<u8> {
        debug_assert!(self.fits(offset, needed));

        let header = self.payload().add(offset);

        if cfg!(debug_assertions) {
            let region = core::slice::from_raw_parts(header, needed);
            debug_assert!(region.iter().all(|byte| *byte == POISON), "Reserved region was written to after retirement");
        }

        ptr::write(header as *mut AllocationHeader, AllocationHeader { size, bucket: NonNull::from(self), });

        NonNull::new_unchecked(header.add(HEADER_SIZE))
    }

    //  Fills the payload with `POISON`, in debug.
    //
    //  Safety:
    //  -   Requires exclusive access to the payload.
    unsafe fn poison(&self) {
        if cfg!(debug_assertions) {
            ptr::write_bytes(self.payload(), POISON, self.capacity);
        }
    }

    //  Returns whether `pointer` is the address of an allocation carved from this bucket.
    fn contains(&self, pointer: NonNull<u8>) -> bool {
        let offset = (pointer.as_ptr() as usize).wrapping_sub(self.payload() as usize);

        offset >= HEADER_SIZE && offset <= self.capacity
    }
}

//  The table of buckets.
//
//  Append-only, it is made of segments of doubling size: the first is inline, the others are obtained from the
//  platform on demand. A slot is written once, before `length` is incremented to cover it, and only reset on drop.
struct Registry {
    length: Atomic<usize>,
    inline: [AtomicPtr<Bucket>; FIRST_SEGMENT],
    segments: [AtomicPtr<AtomicPtr<Bucket>>; MAX_SEGMENTS - 1],
}

impl Registry {
    fn new() -> Self {
        let length = Atomic::new(0);
        let inline = core::array::from_fn(|_| AtomicPtr::default());
        let segments = core::array::from_fn(|_| AtomicPtr::default());

        Self { length, inline, segments, }
    }

    fn len(&self) -> usize { self.length.load() }

    //  Ensures the slot for `index` exists, allocating its segment if necessary.
    //
    //  Requires holding the `replacing` flag.
    fn reserve<P: Platform>(&self, index: usize, platform: &P) -> Option<()> {
        let (segment, _) = Self::locate(index);

        if segment == 0 {
            return Some(());
        }

        let Some(cell) = self.segments.get(segment - 1) else {
            log::warn!("reserve: bucket {} is beyond the last segment", index);
            return None;
        };

        if cell.load().is_some() {
            return Some(());
        }

        let length = Self::segment_length(segment);
        let layout = Layout::array::<AtomicPtr<Bucket>>(length).ok()?;

        //  Safety:
        //  -   `layout.size()` is non-zero.
        let Some(base) = (unsafe { platform.allocate(layout) }) else {
            log::debug!("reserve: platform could not allocate {:?}", layout);
            return None;
        };

        let base = base.cast::<AtomicPtr<Bucket>>();

        for offset in 0..length {
            //  Safety:
            //  -   `base` is suitably sized and aligned for `length` slots.
            unsafe { ptr::write(base.as_ptr().add(offset), AtomicPtr::default()) };
        }

        cell.store(Some(base));

        log::debug!("reserve: segment {} of {} buckets", segment, length);

        Some(())
    }

    fn publish(&self, index: usize, bucket: NonNull<Bucket>) {
        debug_assert_eq!(index, self.len());

        let Some(slot) = self.slot(index) else {
            debug_assert!(false, "Bucket {} was not reserved", index);
            return;
        };

        slot.store(Some(bucket));
        self.length.store(index + 1);
    }

    fn bucket(&self, index: u32) -> NonNull<Bucket> {
        let bucket = self.slot(index as usize).and_then(|slot| slot.load());

        debug_assert!(bucket.is_some(), "Bucket {} is not published", index);

        //  Safety:
        //  -   Indices are only pushed onto `gc` after their bucket was published.
        unsafe { bucket.unwrap_unchecked() }
    }

    fn find(&self, pointer: NonNull<u8>) -> Option<NonNull<Bucket>> {
        (0..self.len())
            .filter_map(|index| self.slot(index)?.load())
            //  Safety:
            //  -   Buckets live as long as `self`.
            .find(|bucket| unsafe { bucket.as_ref() }.contains(pointer))
    }

    fn slot(&self, index: usize) -> Option<&AtomicPtr<Bucket>> {
        let (segment, offset) = Self::locate(index);

        if segment == 0 {
            return self.inline.get(offset);
        }

        let base = self.segments.get(segment - 1)?.load()?;

        //  Safety:
        //  -   A segment holds `segment_length(segment)` initialized slots, and lives as long as `self`.
        Some(unsafe { &*base.as_ptr().add(offset) })
    }

    //  Returns the segment and the offset within it of `index`.
    fn locate(index: usize) -> (usize, usize) {
        let shifted = index + FIRST_SEGMENT;
        let segment = usize::BITS - 1 - shifted.leading_zeros() - FIRST_SEGMENT.trailing_zeros();

        (segment as usize, shifted - (FIRST_SEGMENT << segment))
    }

    fn segment_length(segment: usize) -> usize { FIRST_SEGMENT << segment }

    //  Returns the segments to the platform.
    //
    //  Safety:
    //  -   The segments must have been allocated by `platform`.
    //  -   No slot may be referenced any longer.
    unsafe fn release<P: Platform>(&self, platform: &P) {
        for (index, cell) in self.segments.iter().enumerate() {
            let Some(base) = cell.exchange(None) else { continue };

            let Ok(layout) = Layout::array::<AtomicPtr<Bucket>>(Self::segment_length(index + 1)) else { continue };

            platform.deallocate(base.cast(), layout);
        }

        self.length.store(0);
    }
}

//  Safety:
//  -   The link of a bucket lives in its header, which remains valid until drop.
unsafe impl StackLinks for Registry {
    fn link(&self, index: u32) -> &Atomic<u32> {
        //  Safety:
        //  -   Buckets live as long as `self`.
        unsafe { &(*self.bucket(index).as_ptr()).link }
    }
}

// mod tests
