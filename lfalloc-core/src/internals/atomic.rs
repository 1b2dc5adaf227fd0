//! Atomic primitives.
//!
//! A uniform layer over the platform atomics, for every operand width of 1, 2, 4 and 8 bytes, as well as pointer
//! width:
//!
//! -   Compare-and-swap, with or without reading back the value observed.
//! -   Fetch-add, fetch-sub and fetch-exchange.
//! -   Single bit test-and-set and test-and-reset.
//!
//! Read-modify-write operations use AcqRel (Acquire on failure), loads use Acquire and stores use Release, so that
//! publishing through any of them is always safe.
//!
//! A failed compare-and-swap is not an error: it is the normal unit of progress of lock-free algorithms, and the
//! caller is expected to retry with the freshly observed value.
//!
//! There is no double-word compare-and-swap: versioned references pack a 32-bits index and a 32-bits generation in a
//! single 64-bits word instead, which any 64-bits capable target can swap in a single instruction.

use core::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{self, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

/// Full memory barrier.
///
/// Required between a store to one location and a load from another, when another thread performs the mirror
/// sequence and at least one of the two threads must observe the other's store.
#[inline(always)]
pub fn barrier() { atomic::fence(Ordering::SeqCst) }

/// An integral type for which an atomic counterpart exists.
///
/// Implemented for `u8`, `u16`, `u32`, `u64` and `usize`.
pub trait AtomicPrimitive: Copy + Eq + fmt::Debug + Sized {
    /// The atomic counterpart.
    type Atomic;

    /// Number of bits.
    const BITS: u32;

    /// Creates a new atomic.
    fn into_atomic(self) -> Self::Atomic;

    /// Loads the current value.
    fn load(atomic: &Self::Atomic, ordering: Ordering) -> Self;

    /// Stores a new value.
    fn store(atomic: &Self::Atomic, value: Self, ordering: Ordering);

    /// Compares and exchanges, returns the previous value on success and the observed value on failure.
    fn compare_exchange(atomic: &Self::Atomic, current: Self, new: Self) -> Result<Self, Self>;

    /// Adds, wrapping around, and returns the previous value.
    fn fetch_add(atomic: &Self::Atomic, delta: Self) -> Self;

    /// Subtracts, wrapping around, and returns the previous value.
    fn fetch_sub(atomic: &Self::Atomic, delta: Self) -> Self;

    /// Exchanges, and returns the previous value.
    fn swap(atomic: &Self::Atomic, new: Self) -> Self;

    /// Sets the bit at `bit`, and returns whether it was previously set.
    fn bit_set(atomic: &Self::Atomic, bit: u32) -> bool;

    /// Resets the bit at `bit`, and returns whether it was previously set.
    fn bit_reset(atomic: &Self::Atomic, bit: u32) -> bool;
}

macro_rules! atomic_primitive {
    ($value:ty, $atomic:ty) => {
        impl AtomicPrimitive for $value {
            type Atomic = $atomic;

            const BITS: u32 = <$value>::BITS;

            fn into_atomic(self) -> $atomic { <$atomic>::new(self) }

            fn load(atomic: &$atomic, ordering: Ordering) -> Self { atomic.load(ordering) }

            fn store(atomic: &$atomic, value: Self, ordering: Ordering) { atomic.store(value, ordering) }

            fn compare_exchange(atomic: &$atomic, current: Self, new: Self) -> Result<Self, Self> {
                atomic.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            }

            fn fetch_add(atomic: &$atomic, delta: Self) -> Self { atomic.fetch_add(delta, Ordering::AcqRel) }

            fn fetch_sub(atomic: &$atomic, delta: Self) -> Self { atomic.fetch_sub(delta, Ordering::AcqRel) }

            fn swap(atomic: &$atomic, new: Self) -> Self { atomic.swap(new, Ordering::AcqRel) }

            fn bit_set(atomic: &$atomic, bit: u32) -> bool {
                debug_assert!(bit < Self::BITS, "{} >= {}", bit, Self::BITS);

                let mask: $value = 1 << bit;
                atomic.fetch_or(mask, Ordering::AcqRel) & mask != 0
            }

            fn bit_reset(atomic: &$atomic, bit: u32) -> bool {
                debug_assert!(bit < Self::BITS, "{} >= {}", bit, Self::BITS);

                let mask: $value = 1 << bit;
                atomic.fetch_and(!mask, Ordering::AcqRel) & mask != 0
            }
        }
    };
}

atomic_primitive!(u8, AtomicU8);
atomic_primitive!(u16, AtomicU16);
atomic_primitive!(u32, AtomicU32);
atomic_primitive!(u64, AtomicU64);
atomic_primitive!(usize, AtomicUsize);

//  No 16-bytes operand: the ABA tag of `TaggedStack` travels with a 32-bits index, in a single `u64`.

/// Atomic
///
/// An atomic integer, exposing the primitive operations with orderings baked in.
///
/// It has the same in-memory representation as the underlying atomic, and may therefore be overlaid on raw memory.
#[repr(transparent)]
pub struct Atomic<T: AtomicPrimitive>(T::Atomic);

impl<T: AtomicPrimitive> Atomic<T> {
    /// Creates an instance.
    pub fn new(value: T) -> Self { Self(value.into_atomic()) }

    /// Loads the current value.
    pub fn load(&self) -> T { T::load(&self.0, Ordering::Acquire) }

    /// Stores a new value.
    pub fn store(&self, value: T) { T::store(&self.0, value, Ordering::Release) }

    /// Replaces the current value by `new` if it is `old`.
    ///
    /// Returns true on success, false on failure.
    pub fn compare_and_swap(&self, new: T, old: T) -> bool { T::compare_exchange(&self.0, old, new).is_ok() }

    /// Replaces the current value by `new` if it is `old`.
    ///
    /// Returns the previous value, `old`, on success, and the value observed in place of `old` on failure, so that
    /// the caller may retry without reloading.
    pub fn compare_and_swap_read(&self, new: T, old: T) -> Result<T, T> { T::compare_exchange(&self.0, old, new) }

    /// Adds `delta`, wrapping around on overflow, and returns the previous value.
    pub fn fetch_add(&self, delta: T) -> T { T::fetch_add(&self.0, delta) }

    /// Subtracts `delta`, wrapping around on overflow, and returns the previous value.
    pub fn fetch_sub(&self, delta: T) -> T { T::fetch_sub(&self.0, delta) }

    /// Replaces the current value by `new`, and returns the previous value.
    pub fn fetch_exchange(&self, new: T) -> T { T::swap(&self.0, new) }

    /// Sets the `bit`-th bit, and returns whether it was previously set.
    pub fn bit_test_and_set(&self, bit: u32) -> bool { T::bit_set(&self.0, bit) }

    /// Resets the `bit`-th bit, and returns whether it was previously set.
    pub fn bit_test_and_reset(&self, bit: u32) -> bool { T::bit_reset(&self.0, bit) }
}

impl<T: AtomicPrimitive + Default> Default for Atomic<T> {
    fn default() -> Self { Self::new(T::default()) }
}

impl<T: AtomicPrimitive> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&T::load(&self.0, Ordering::Relaxed), f)
    }
}

//  Automatically uses Acquire/Release, to synchronize the publication of the pointee.
pub(crate) struct AtomicPtr<T>(atomic::AtomicPtr<T>);

impl<T> AtomicPtr<T> {
    pub(crate) fn load(&self) -> Option<NonNull<T>> { NonNull::new(self.0.load(Ordering::Acquire)) }

    pub(crate) fn store(&self, ptr: Option<NonNull<T>>) { self.0.store(into_raw(ptr), Ordering::Release) }

    pub(crate) fn exchange(&self, ptr: Option<NonNull<T>>) -> Option<NonNull<T>> {
        NonNull::new(self.0.swap(into_raw(ptr), Ordering::AcqRel))
    }
}

impl<T> Default for AtomicPtr<T> {
    fn default() -> Self { Self(atomic::AtomicPtr::new(ptr::null_mut())) }
}

//
//  Implementation
//

#[inline(always)]
fn into_raw<T>(ptr: Option<NonNull<T>>) -> *mut T {
    ptr.map(|t| t.as_ptr())
        .unwrap_or(ptr::null_mut())
}

// mod tests
