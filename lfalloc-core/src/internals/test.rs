//! Test utilities.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    collections::BTreeMap,
    ptr::NonNull,
    sync::Mutex,
};

use crate::Platform;

/// A platform backed by the system allocator, which keeps track of the outstanding allocations.
///
/// It may be instructed to fail after a number of successful allocations.
#[derive(Default)]
pub(crate) struct TestPlatform {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    outstanding: BTreeMap<usize, Layout>,
    allocations: usize,
    budget: Option<usize>,
}

impl TestPlatform {
    /// Creates an instance which fails all allocations past the first `budget` ones.
    pub(crate) fn with_budget(budget: usize) -> Self {
        let platform = Self::default();
        platform.state.lock().unwrap().budget = Some(budget);
        platform
    }

    /// Returns the total number of successful allocations.
    pub(crate) fn allocations(&self) -> usize { self.state.lock().unwrap().allocations }

    /// Returns the layouts of the allocations not yet deallocated, in order of address.
    pub(crate) fn outstanding(&self) -> Vec<Layout> {
        self.state.lock().unwrap().outstanding.values().cloned().collect()
    }

    /// Returns the total number of bytes not yet deallocated.
    pub(crate) fn outstanding_bytes(&self) -> usize { self.outstanding().iter().map(|l| l.size()).sum() }
}

impl Platform for TestPlatform {
    unsafe fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        assert_ne!(0, layout.size());

        let mut state = self.state.lock().unwrap();

        if let Some(budget) = state.budget.as_mut() {
            if *budget == 0 {
                return None;
            }

            *budget -= 1;
        }

        let pointer = NonNull::new(System.alloc(layout))?;

        state.allocations += 1;
        state.outstanding.insert(pointer.as_ptr() as usize, layout);

        Some(pointer)
    }

    unsafe fn deallocate(&self, pointer: NonNull<u8>, layout: Layout) {
        let mut state = self.state.lock().unwrap();

        let recorded = state.outstanding.remove(&(pointer.as_ptr() as usize));

        assert_eq!(Some(layout), recorded, "Unknown or mismatched deallocation of {:?}", pointer);

        System.dealloc(pointer.as_ptr(), layout);
    }
}
