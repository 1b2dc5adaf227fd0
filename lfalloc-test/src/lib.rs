//! Test helpers shared by the members of the workspace.
//!
//! -   `Lockstep`, a runner starting the same step on all threads as simultaneously as possible, to flush out data
//!     races and race conditions.
//! -   `Pool`, a set of threads each running a single closure to completion.
//! -   `read_number_from_environment`, to scale stress tests without recompiling.

#![deny(missing_docs)]

mod environment;
mod lockstep;
mod pool;

pub use environment::read_number_from_environment;
pub use lockstep::{Lockstep, LockstepBuilder};
pub use pool::Pool;
