//! A collection of utilities.

use core::{cmp, ptr::NonNull};

mod power_of_2;

pub use power_of_2::PowerOf2;

/// Returns whether the pointer is sufficiently aligned for the given alignment.
pub(crate) fn is_sufficiently_aligned_for(ptr: NonNull<u8>, alignment: PowerOf2) -> bool {
    (ptr.as_ptr() as usize) % alignment == 0
}

/// Returns the next size of the growth sequence.
///
/// The sequence grows by roughly half of the `current` size at each step, similar to a Fibonacci sequence, and never
/// returns less than `minimum` nor less than `current + 1`.
pub(crate) fn grow(current: usize, minimum: usize) -> usize {
    let increment = cmp::max(current / 2, 1);

    cmp::max(current.saturating_add(increment), minimum)
}

#[cfg(test)]
mod tests {

use super::*;

#[test]
fn is_sufficiently_aligned_for() {
    fn is_aligned_for(ptr: usize, alignment: usize) -> bool {
        let alignment = PowerOf2::new(alignment).unwrap();
        let ptr = NonNull::new(ptr as *mut u8).unwrap();
        super::is_sufficiently_aligned_for(ptr, alignment)
    }

    assert!(is_aligned_for(1, 1));
    assert!(is_aligned_for(3, 1));

    assert!(!is_aligned_for(1, 2));
    assert!(is_aligned_for(2, 2));

    assert!(!is_aligned_for(8, 16));
    assert!(is_aligned_for(48, 16));
}

#[test]
fn grow_sequence() {
    fn sequence(start: usize, minimum: usize, length: usize) -> Vec<usize> {
        let mut result = vec!(start);

        while result.len() < length {
            let last = *result.last().unwrap();
            result.push(grow(last, minimum));
        }

        result
    }

    assert_eq!(vec!(8, 12, 18, 27, 40, 60), sequence(8, 1, 6));
    assert_eq!(vec!(0, 4, 6, 9), sequence(0, 4, 4));
    assert_eq!(vec!(1, 2, 3, 4, 6), sequence(1, 1, 5));
}

#[test]
fn grow_saturates() {
    assert_eq!(usize::MAX, grow(usize::MAX - 1, 1));
    assert_eq!(usize::MAX, grow(usize::MAX, 1));
}

#[test]
fn grow_minimum() {
    assert_eq!(1024, grow(16, 1024));
    assert_eq!(1536, grow(1024, 1024));
}

} // mod tests
