//! Implementation of the Platform trait, for Unix.
//!
//! Memory is mapped directly from the OS, by anonymous private mappings.

use std::{alloc::Layout, ptr::{self, NonNull}};

use lfalloc_core::{Platform, PowerOf2};

/// Implementation of the Platform trait, for Unix.
///
/// Sizes are rounded up to a multiple of the page size; alignments beyond the page size are met by over-allocating,
/// then trimming front and back.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPlatform;

impl SystemPlatform {
    /// Creates an instance.
    pub const fn new() -> Self { Self }
}

impl Platform for SystemPlatform {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let page_size = page_size();

        let size = page_size.checked_round_up(layout.size())?;

        let pointer = if layout.align() <= page_size.value() {
            mmap_allocate(size)
        } else {
            mmap_over(size, PowerOf2::align_of_layout(layout))
        };

        debug_assert!(pointer.map_or(true, |p| p.as_ptr() as usize % layout.align() == 0),
            "Incorrect alignment of allocation: {:?} for {:?}", pointer, layout);

        pointer
    }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout) {
        let size = page_size().round_up(layout.size());

        munmap_deallocate(pointer.as_ptr(), size);
    }
}

//
//  Implementation Details
//

fn page_size() -> PowerOf2 {
    //  Safety:
    //  -   `_SC_PAGESIZE` is always a valid name.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    PowerOf2::new(page_size as usize).unwrap_or(FALLBACK_PAGE_SIZE)
}

const FALLBACK_PAGE_SIZE: PowerOf2 = unsafe { PowerOf2::new_unchecked(4096) };

//  Allocates `size` bytes, a multiple of the page size, aligned on `alignment`, itself larger than the page size.
//
//  Ensures the alignment is met by over-allocating then trimming front and back.
fn mmap_over(size: usize, alignment: PowerOf2) -> Option<NonNull<u8>> {
    let over_size = size.checked_add(alignment.value())?;
    let front_pointer = mmap_allocate(over_size)?;

    let back_size = (front_pointer.as_ptr() as usize) % alignment;
    let front_size = alignment.value() - back_size;

    debug_assert!(front_size + size + back_size == over_size,
        "{} + {} + {} != {}", front_size, size, back_size, over_size);

    //  Safety:
    //  -   `front_size` is less than `over_size`, hence the result is within the mapped area.
    let aligned_pointer = unsafe { front_pointer.as_ptr().add(front_size) };

    //  Safety:
    //  -   `front_size + size` is at most `over_size`, hence the result is within the mapped area, or at its end.
    let back_pointer = unsafe { aligned_pointer.add(size) };

    //  Safety:
    //  -   Both areas are page-aligned, mapped, and no longer in use.
    unsafe {
        munmap_deallocate(front_pointer.as_ptr(), front_size);

        if back_size > 0 {
            munmap_deallocate(back_pointer, back_size);
        }
    }

    NonNull::new(aligned_pointer)
}

//  Wrapper around `mmap`.
//
//  Returns a pointer to `size` bytes of memory, aligned on the page size.
fn mmap_allocate(size: usize) -> Option<NonNull<u8>> {
    let length = size;
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    //  No specific address hint.
    let addr = ptr::null_mut();
    //  When used in conjunction with MAP_ANONYMOUS, fd is mandated to be -1 on some implementations.
    let fd = -1;
    //  When used in conjunction with MAP_ANONYMOUS, offset is mandated to be 0 on some implementations.
    let offset = 0;

    //  Safety:
    //  -   `addr`, `fd`, and `offset` are suitable for MAP_ANONYMOUS.
    let result = unsafe { libc::mmap(addr, length, prot, flags, fd, offset) };

    if result == libc::MAP_FAILED {
        log::error!("mmap_allocate: could not map {} bytes", size);
        return None;
    }

    NonNull::new(result as *mut u8)
}

//  Wrapper around `munmap`.
//
//  #   Panics
//
//  If `munmap` returns a non-0 result.
//
//  #   Safety
//
//  -   Assumes that `addr` points to a `mmap`ed area of at least `size` bytes.
//  -   Assumes that the range `[addr, addr + size)` is no longer in use.
unsafe fn munmap_deallocate(addr: *mut u8, size: usize) {
    let result = libc::munmap(addr as *mut libc::c_void, size);
    assert!(result == 0, "Could not munmap {:x}, {}: {}", addr as usize, size, result);
}

// mod tests
