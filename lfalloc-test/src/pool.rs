//! A pool of threads, each running a single task.

use std::{mem, thread::{self, JoinHandle}};

/// Pool
///
/// Spawns one thread per task on construction, and joins them all on `join` or on drop.
pub struct Pool<T>(Vec<JoinHandle<T>>);

impl<T> Pool<T> {
    /// Spawns `count` threads, the i-th one running the task created by `factory(i)`.
    pub fn new<F, G>(count: usize, mut factory: F) -> Self
        where
            F: FnMut(usize) -> G,
            G: FnOnce() -> T + Send + 'static,
            T: Send + 'static,
    {
        let threads = (0..count).map(|i| thread::spawn(factory(i))).collect();

        Self(threads)
    }

    /// Joins all threads, and returns their results in order of spawning.
    ///
    /// #   Panics
    ///
    /// -   If any of the threads panicked, after all threads have been joined.
    pub fn join(mut self) -> Vec<T> {
        let handles = mem::take(&mut self.0);
        Self::join_handles(handles)
    }

    fn join_handles(handles: Vec<JoinHandle<T>>) -> Vec<T> {
        //  Join _all_ threads first, so that none outlives a panicking sibling.
        let results: Vec<_> = handles.into_iter()
            .map(|handle| handle.join())
            .collect();

        results.into_iter()
            .map(|result| result.unwrap())
            .collect()
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        let handles = mem::take(&mut self.0);

        if thread::panicking() {
            handles.into_iter().for_each(|handle| { let _ = handle.join(); });
        } else {
            Self::join_handles(handles);
        }
    }
}

// mod tests
