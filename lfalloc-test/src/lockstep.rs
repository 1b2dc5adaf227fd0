//! A test runner for detecting data races and race conditions.

use std::{
    hint,
    mem,
    sync::{Arc, atomic::{AtomicBool, AtomicUsize, Ordering}},
    thread::{self, JoinHandle},
};

/// Lockstep is a test runner specialized in flushing out data races and race conditions.
///
/// Lockstep runs user-specified steps _in lock-step_ across multiple threads of execution:
///
/// -   A Global state is shared across all threads.
/// -   One Local state is dedicated to each thread; there are as many threads as Local states.
/// -   Each step runs on every thread, and no thread starts step S(i+1) before all threads completed S(i).
///
/// In particular, each step starts as simultaneously as possible on all threads, maximizing contention.
///
/// Constructing a `Lockstep` is done through a `LockstepBuilder`.
pub struct Lockstep<Global, Local> {
    global: Arc<Global>,
    threads: Vec<JoinHandle<Local>>,
    locals: Vec<Local>,
}

impl<Global, Local> Lockstep<Global, Local> {
    /// Returns a reference to the Global state.
    ///
    /// #   Warning
    ///
    /// Access is provided _without_ joining the threads first.
    pub fn global(&self) -> &Global { &self.global }

    /// Joins the threads, and collects their Local states.
    ///
    /// #   Panics
    ///
    /// -   If any of the threads panicked.
    pub fn join(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        let results: Vec<_> = mem::take(&mut self.threads).into_iter()
            .map(|handle| handle.join())
            .collect();

        self.locals = results.into_iter()
            .map(|result| result.unwrap())
            .collect();
    }

    /// Returns the Local states, in the order they were handed to the builder.
    ///
    /// Calls `self.join()` to collect them first, if not already done.
    pub fn locals(&mut self) -> &[Local] {
        self.join();

        &self.locals
    }
}

impl<Global, Local> Drop for Lockstep<Global, Local> {
    fn drop(&mut self) {
        if thread::panicking() {
            mem::take(&mut self.threads).into_iter().for_each(|handle| { let _ = handle.join(); });
        } else {
            self.join();
        }
    }
}

/// LockstepBuilder, a builder for a `Lockstep` instance.
///
/// #   Example
///
/// ```
/// use std::sync::atomic::{AtomicI32, Ordering};
/// use lfalloc_test::LockstepBuilder;
///
/// let mut builder = LockstepBuilder::new(AtomicI32::new(0), vec!(1, 10));
///
/// builder.add_step(|| |global: &AtomicI32, local: &mut i32| { global.fetch_add(*local, Ordering::Relaxed); });
///
/// let mut lockstep = builder.launch(4);
///
/// assert_eq!(&[1, 10], lockstep.locals());
/// assert_eq!(44, lockstep.global().load(Ordering::Relaxed));
/// ```
pub struct LockstepBuilder<Global, Local> {
    global: Arc<Global>,
    locals: Vec<Local>,
    steps: Vec<Vec<Step<Global, Local>>>,
}

impl<Global, Local> LockstepBuilder<Global, Local>
    where
        Global: Send + Sync + 'static,
        Local: Send + 'static,
{
    /// Creates a new instance, which will run one thread per element of `locals`.
    ///
    /// #   Panics
    ///
    /// -   If `locals` is empty.
    pub fn new(global: Global, locals: Vec<Local>) -> Self {
        assert!(!locals.is_empty(), "Cannot run in lock-step without a single thread");

        let global = Arc::new(global);
        let steps = locals.iter().map(|_| vec!()).collect();

        Self { global, locals, steps, }
    }

    /// Adds a step to each thread.
    ///
    /// The step is created by invoking `factory` once per thread.
    pub fn add_step<Factory, S>(&mut self, mut factory: Factory)
        where
            Factory: FnMut() -> S,
            S: FnMut(&Global, &mut Local) + Send + 'static,
    {
        self.add_prepared_step(move || {
            let mut step = factory();
            let prep = |_: &Global, _: &mut Local| ();
            let step = move |global: &Global, local: &mut Local, _: ()| step(global, local);
            (prep, step)
        });
    }

    /// Adds a step to each thread, split in two.
    ///
    /// -   The preparatory part Prep, returning R, runs _before_ waiting for the other threads; it is ideal for
    ///     expensive set-up which should not dilute contention.
    /// -   The actual part S runs as simultaneously as possible on all threads.
    ///
    /// Both are created by invoking `factory` once per thread.
    pub fn add_prepared_step<Factory, Prep, R, S>(&mut self, mut factory: Factory)
        where
            Factory: FnMut() -> (Prep, S),
            Prep: FnMut(&Global, &mut Local) -> R + Send + 'static,
            S: FnMut(&Global, &mut Local, R) + Send + 'static,
    {
        for serie in &mut self.steps {
            let (mut prep, mut step) = factory();

            serie.push(Box::new(move |global: &Global, local: &mut Local, gate: &Gate| {
                let prepared = prep(global, local);

                gate.wait();

                step(global, local, prepared);
            }));
        }
    }

    /// Creates the Lockstep instance, which will run each serie of steps `iterations` times.
    ///
    /// The threads start immediately.
    ///
    /// #   Panics
    ///
    /// -   If no step was added.
    pub fn launch(self, iterations: usize) -> Lockstep<Global, Local> {
        let Self { global, locals, steps, } = self;

        assert!(!steps[0].is_empty(), "Cannot run in lock-step without a single step");

        let gate = Arc::new(Gate::new(locals.len()));

        let threads = locals.into_iter()
            .zip(steps.into_iter())
            .map(|(mut local, mut serie)| {
                let global = global.clone();
                let gate = gate.clone();

                thread::spawn(move || {
                    let guard = PoisonGuard(&*gate);

                    for _ in 0..iterations {
                        for step in &mut serie {
                            step(&*global, &mut local, &*gate);
                        }
                    }

                    mem::forget(guard);

                    local
                })
            })
            .collect();

        Lockstep { global, threads, locals: vec!(), }
    }
}

//
//  Implementation details
//

type Step<Global, Local> = Box<dyn FnMut(&Global, &mut Local, &Gate) + Send + 'static>;

//  A reusable spinning barrier.
//
//  The last thread to arrive resets the count of arrivals, then opens the gate by bumping the generation.
struct Gate {
    arrived: AtomicUsize,
    generation: AtomicUsize,
    poisoned: AtomicBool,
    threads: usize,
}

impl Gate {
    fn new(threads: usize) -> Self {
        Self { arrived: AtomicUsize::new(0), generation: AtomicUsize::new(0), poisoned: AtomicBool::new(false), threads, }
    }

    fn wait(&self) {
        //  Must be read before arriving, lest the last thread opens the gate in between.
        let generation = self.generation.load(Ordering::Acquire);

        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.threads {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            return;
        }

        while self.generation.load(Ordering::Acquire) == generation {
            if self.poisoned.load(Ordering::Relaxed) {
                Self::abandon_ship();
            }

            hint::spin_loop();
        }
    }

    #[cold]
    #[inline(never)]
    fn abandon_ship() -> ! {
        panic!("Another thread panicked in lock-step");
    }
}

//  If a single thread panics, then all threads must stop waiting for it.
struct PoisonGuard<'a>(&'a Gate);

impl<'a> Drop for PoisonGuard<'a> {
    fn drop(&mut self) { self.0.poisoned.store(true, Ordering::Relaxed); }
}

#[cfg(test)]
mod tests {

use std::sync::Mutex;

use super::*;

#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
struct Event {
    iteration: usize,
    step: usize,
    thread: usize,
}

#[derive(Default)]
struct Journal(Mutex<Vec<Event>>);

impl Journal {
    fn record(&self, event: Event) { self.0.lock().unwrap().push(event); }

    //  Events of a given (iteration, step) may be recorded in any order of threads, hence each such group is sorted
    //  by thread, but the groups themselves are never reordered.
    fn events(&self) -> Vec<Event> {
        let mut events = self.0.lock().unwrap().clone();

        let mut start = 0;
        while start < events.len() {
            let (iteration, step) = (events[start].iteration, events[start].step);
            let length = events[start..].iter()
                .take_while(|e| e.iteration == iteration && e.step == step)
                .count();

            events[start..start + length].sort();
            start += length;
        }

        events
    }

    fn expected(threads: usize, iterations: usize, steps: usize) -> Vec<Event> {
        let mut result = vec!();

        for iteration in 0..iterations {
            for step in 0..steps {
                for thread in 0..threads {
                    result.push(Event { iteration, step, thread, });
                }
            }
        }

        result
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct Local {
    thread: usize,
    count: usize,
}

fn run(threads: usize, iterations: usize, steps: usize) {
    let locals = (0..threads).map(|thread| Local { thread, count: 0, }).collect();

    let mut builder = LockstepBuilder::new(Journal::default(), locals);

    for step in 0..steps {
        builder.add_prepared_step(move || {
            let mut iteration = 0;

            let prep = move |_: &Journal, _: &mut Local| {
                iteration += 1;
                iteration - 1
            };

            let step = move |journal: &Journal, local: &mut Local, iteration: usize| {
                journal.record(Event { iteration, step, thread: local.thread, });
                local.count += 1;
            };

            (prep, step)
        });
    }

    let mut lockstep = builder.launch(iterations);

    let expected: Vec<_> = (0..threads).map(|thread| Local { thread, count: iterations * steps, }).collect();

    assert_eq!(&expected[..], lockstep.locals());
    assert_eq!(Journal::expected(threads, iterations, steps), lockstep.global().events());
}

#[test]
fn single_thread_single_step() { run(1, 1, 1); }

#[test]
fn single_thread_n_steps_n_iterations() { run(1, 3, 5); }

#[test]
fn n_threads_single_step_single_iteration() { run(3, 1, 1); }

#[test]
fn n_threads_single_step_n_iterations() { run(3, 4, 1); }

#[test]
fn n_threads_n_steps_n_iterations() { run(4, 10, 3); }

#[test]
#[should_panic]
fn panicking_thread_releases_others() {
    let mut builder = LockstepBuilder::new((), vec!(0usize, 1, 2));

    builder.add_step(|| |_: &(), local: &mut usize| assert_ne!(1, *local));
    builder.add_step(|| |_: &(), _: &mut usize| ());

    let mut lockstep = builder.launch(2);

    lockstep.join();
}

} // mod tests
