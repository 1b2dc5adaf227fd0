use std::{collections::VecDeque, ptr::NonNull, time};

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

use lfalloc::{Allocate, FixedBlockAllocator, RingAllocator};

const CAPACITY: usize = 32;

thread_local! {
    static FIXED_BLOCK_ALLOCATOR: FixedBlockAllocator =
        FixedBlockAllocator::for_type::<[u8; CAPACITY]>(4096).expect("Valid configuration");

    static RING_ALLOCATOR: RingAllocator = RingAllocator::new(1 << 20).expect("Valid configuration");
}

//  Single-Thread Single-Allocation
//
//  This benchmark repeatedly allocates a block of memory on a single thread.
//
//  This is the best-case scenario, with no contention, and measures the lower-bound of allocator latency.
fn single_threaded_single_allocation_allocation(c: &mut Criterion) {
    fn bencher<T: Vector>(name: &'static str, c: &mut Criterion) {
        c.bench_function(name, |b| b.iter_with_large_drop(
            || black_box(T::with_capacity(CAPACITY))
        ));
    }

    warm_up();

    bencher::<SysVec>("ST SA Allocation - sys", c);

    bencher::<FixedVec>("ST SA Allocation - fixed", c);

    bencher::<RingVec>("ST SA Allocation - ring", c);
}

//  Single-Thread Single-Allocation
//
//  This benchmark repeatedly deallocates a block of memory on a single thread.
fn single_threaded_single_allocation_deallocation(c: &mut Criterion) {
    fn bencher<T: Vector>(name: &'static str, c: &mut Criterion) {
        c.bench_function(name, |b| b.iter_custom(|iterations| {
            let mut duration = time::Duration::default();

            for _ in 0..iterations {
                let v = black_box(T::with_capacity(CAPACITY));

                let start = time::Instant::now();

                std::mem::drop(v);

                duration += start.elapsed();
            }

            duration
        }));
    }

    warm_up();

    bencher::<SysVec>("ST SA Deallocation - sys", c);

    bencher::<FixedVec>("ST SA Deallocation - fixed", c);

    bencher::<RingVec>("ST SA Deallocation - ring", c);
}

//  Single-Threaded Single-Allocation Round-Trip.
//
//  This benchmark repeatedly allocates and deallocates a block of memory on a single thread.
fn single_threaded_single_allocation_round_trip(c: &mut Criterion) {
    fn bencher<T: Vector>(name: &'static str, c: &mut Criterion) {
        c.bench_function(name, |b| b.iter(|| {
            let _ = black_box(T::with_capacity(CAPACITY));
        }));
    }

    warm_up();

    bencher::<SysVec>("ST SA Round-trip - sys", c);

    bencher::<FixedVec>("ST SA Round-trip - fixed", c);

    bencher::<RingVec>("ST SA Round-trip - ring", c);
}

criterion_group!(
    single_threaded_single_allocation,
    single_threaded_single_allocation_allocation,
    single_threaded_single_allocation_deallocation,
    single_threaded_single_allocation_round_trip
);

//  Single-Thread Batch-Allocation Allocation.
//
//  This benchmark repeatedly allocates a block of memory on a single thread, keeping all of them alive.
//
//  For the ring allocator, this measures the cost of replacing the current bucket as well.
fn single_threaded_batch_allocation_allocation(c: &mut Criterion) {
    fn bencher<T: Vector>(name: &'static str, c: &mut Criterion, number_iterations: usize) {
        c.bench_function(name, |b| b.iter_batched_ref(
            || Vec::<T>::with_capacity(number_iterations),
            |v| v.push(black_box(T::with_capacity(CAPACITY))),
            BatchSize::NumIterations(number_iterations as u64)
        ));
    }

    const NUMBER_ITERATIONS: usize = 1024;

    warm_up();

    bencher::<SysVec>("ST BA Allocation - sys", c, NUMBER_ITERATIONS);

    bencher::<FixedVec>("ST BA Allocation - fixed", c, NUMBER_ITERATIONS);

    bencher::<RingVec>("ST BA Allocation - ring", c, NUMBER_ITERATIONS);
}

//  Single-Thread Batch-Allocation Deallocation.
//
//  This benchmark repeatedly deallocates a block of memory on a single thread, from a batch allocated beforehand.
fn single_threaded_batch_allocation_deallocation(c: &mut Criterion) {
    fn bencher<T: Vector>(name: &'static str, c: &mut Criterion, number_iterations: usize) {
        c.bench_function(name, |b| b.iter_batched_ref(
            || {
                let mut v = Vec::<T>::new();
                v.resize_with(number_iterations, || black_box(T::with_capacity(CAPACITY)));
                v
            },
            |v| v.pop(),
            BatchSize::NumIterations(number_iterations as u64)
        ));
    }

    const NUMBER_ITERATIONS: usize = 1024;

    warm_up();

    bencher::<SysVec>("ST BA Deallocation - sys", c, NUMBER_ITERATIONS);

    bencher::<FixedVec>("ST BA Deallocation - fixed", c, NUMBER_ITERATIONS);

    bencher::<RingVec>("ST BA Deallocation - ring", c, NUMBER_ITERATIONS);
}

//  Single-Thread Batch-Allocation Round-Trip.
//
//  This benchmark repeatedly allocates a block of memory on a single thread, then deallocates the oldest one.
fn single_threaded_batch_allocation_round_trip(c: &mut Criterion) {
    fn bencher<T: Vector>(name: &'static str, c: &mut Criterion, number_iterations: usize) {
        c.bench_function(name, |b| b.iter_batched_ref(
            || {
                let mut v = VecDeque::<T>::with_capacity(number_iterations);
                v.resize_with(number_iterations - 1, || black_box(T::with_capacity(CAPACITY)));
                v
            },
            |v| {
                v.push_back(black_box(T::with_capacity(CAPACITY)));
                v.pop_front()
            },
            BatchSize::NumIterations(number_iterations as u64)
        ));
    }

    const NUMBER_ITERATIONS: usize = 1024;

    warm_up();

    bencher::<SysVec>("ST BA Round-trip - sys", c, NUMBER_ITERATIONS);

    bencher::<FixedVec>("ST BA Round-trip - fixed", c, NUMBER_ITERATIONS);

    bencher::<RingVec>("ST BA Round-trip - ring", c, NUMBER_ITERATIONS);
}

criterion_group!(
    single_threaded_batch_allocation,
    single_threaded_batch_allocation_allocation,
    single_threaded_batch_allocation_deallocation,
    single_threaded_batch_allocation_round_trip
);

criterion_main!(
    single_threaded_single_allocation,
    single_threaded_batch_allocation
);

//
//  Implementation Details
//

//  Ensures the first chunk and bucket are allocated outside of the measurements.
fn warm_up() {
    drop(FixedVec::with_capacity(CAPACITY));
    drop(RingVec::with_capacity(CAPACITY));
}

trait Vector: Sized {
    fn with_capacity(capacity: usize) -> Self;
}

type SysVec = Vec<u8>;

impl Vector for SysVec {
    fn with_capacity(capacity: usize) -> SysVec { SysVec::with_capacity(capacity) }
}

//  Similar layout to Vec, for fairness.
struct FixedVec {
    pointer: NonNull<u8>,
    #[allow(dead_code)]
    len: usize,
    #[allow(dead_code)]
    cap: usize,
}

impl Vector for FixedVec {
    fn with_capacity(capacity: usize) -> FixedVec {
        debug_assert!(capacity <= CAPACITY);

        let pointer = FIXED_BLOCK_ALLOCATOR.with(|allocator| allocator.allocate(1));
        FixedVec { pointer, len: 0, cap: capacity }
    }
}

impl Drop for FixedVec {
    fn drop(&mut self) {
        FIXED_BLOCK_ALLOCATOR.with(|allocator| unsafe { allocator.deallocate(self.pointer, 1) })
    }
}

//  Similar layout to Vec, for fairness.
struct RingVec {
    pointer: NonNull<u8>,
    #[allow(dead_code)]
    len: usize,
    cap: usize,
}

impl Vector for RingVec {
    fn with_capacity(capacity: usize) -> RingVec {
        let pointer = RING_ALLOCATOR.with(|allocator| allocator.allocate(capacity));
        RingVec { pointer, len: 0, cap: capacity }
    }
}

impl Drop for RingVec {
    fn drop(&mut self) {
        RING_ALLOCATOR.with(|allocator| unsafe { allocator.deallocate(self.pointer, self.cap) })
    }
}
