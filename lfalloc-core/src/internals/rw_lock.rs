//! A write-preferring reader/writer spin lock.
//!
//! The state is a single word: the top bit is the writer flag, the remaining bits count the live readers.
//!
//! A writer first raises the writer flag, which bars any new reader, then waits for the existing readers to drain.
//! Hence a writer only ever waits on the readers which were already present when it raised its flag, no matter how
//! many readers keep trying to get in.
//!
//! Nothing ever parks: all waits are busy loops.

use core::{fmt, hint};

use super::atomic::Atomic;

/// RwLock
///
/// The lock guards no data of its own; it is up to the caller to associate it with whatever it protects.
pub struct RwLock(Atomic<usize>);

impl RwLock {
    const WRITER_BIT: u32 = usize::BITS - 1;
    const WRITER: usize = 1 << Self::WRITER_BIT;

    /// Creates an unlocked instance.
    pub fn new() -> Self { Self(Atomic::new(0)) }

    /// Returns the number of readers.
    pub fn readers(&self) -> usize { self.0.load() & !Self::WRITER }

    /// Returns whether the writer flag is raised, whether the writer is still waiting for readers or not.
    pub fn is_write_locked(&self) -> bool { self.0.load() & Self::WRITER != 0 }

    /// Acquires a read lock, spinning as long as a writer is present.
    pub fn read_lock(&self) {
        loop {
            let previous = self.0.fetch_add(1);

            debug_assert!(previous & !Self::WRITER != !Self::WRITER, "Too many readers");

            if previous & Self::WRITER == 0 {
                return;
            }

            self.0.fetch_sub(1);

            while self.is_write_locked() {
                hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire a read lock, once.
    ///
    /// Fails if a writer is present, without ever making the reader visible to the writer in this case.
    pub fn try_read_lock(&self) -> bool {
        let mut current = self.0.load();

        loop {
            if current & Self::WRITER != 0 {
                return false;
            }

            match self.0.compare_and_swap_read(current + 1, current) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Releases a read lock.
    pub fn read_unlock(&self) {
        let previous = self.0.fetch_sub(1);

        debug_assert!(previous & !Self::WRITER != 0, "No reader to unlock");
    }

    /// Acquires the write lock, spinning until all readers are gone.
    pub fn lock(&self) {
        self.raise_writer_flag();
        self.wait_for_readers(0);
    }

    /// Attempts to acquire the write lock, once.
    ///
    /// Fails if any reader or writer is present.
    pub fn try_lock_strict(&self) -> bool { self.0.compare_and_swap(Self::WRITER, 0) }

    /// Releases the write lock.
    pub fn unlock(&self) {
        let was_locked = self.0.bit_test_and_reset(Self::WRITER_BIT);

        debug_assert!(was_locked, "Write lock was not held");
    }

    /// Converts the read lock held by the caller into the write lock.
    ///
    /// The caller's read lock is _retained_, and counted as a reader for as long as the write lock is held.
    ///
    /// No other writer can sneak in between, however the caller may spin for a while if another writer got in first.
    pub fn upgrade(&self) {
        debug_assert!(self.readers() > 0, "Upgrading without holding a read lock");

        self.raise_writer_flag();
        self.wait_for_readers(1);
    }

    /// Converts the write lock held by the caller, obtained by `upgrade`, back into a read lock.
    pub fn downgrade(&self) {
        debug_assert!(self.readers() > 0, "Downgrading without holding a read lock");

        let was_locked = self.0.bit_test_and_reset(Self::WRITER_BIT);

        debug_assert!(was_locked, "Write lock was not held");
    }

    //  Internal.
    //
    //  Raises the writer flag, after waiting for any other writer to lower it first.
    fn raise_writer_flag(&self) {
        let mut current = self.0.load();

        loop {
            if current & Self::WRITER != 0 {
                hint::spin_loop();
                current = self.0.load();
                continue;
            }

            match self.0.compare_and_swap_read(current | Self::WRITER, current) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    //  Internal.
    //
    //  Waits until exactly `readers` readers remain; only valid with the writer flag raised.
    fn wait_for_readers(&self, readers: usize) {
        debug_assert!(self.is_write_locked());

        while self.readers() != readers {
            hint::spin_loop();
        }
    }
}

impl Default for RwLock {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.load();

        f.debug_struct("RwLock")
            .field("writer", &(state & Self::WRITER != 0))
            .field("readers", &(state & !Self::WRITER))
            .finish()
    }
}

// mod tests
