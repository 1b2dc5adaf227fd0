//! The internals of lfalloc-core.
//!
//! The internals provide all the heavy-lifting.

pub mod atomic;
pub mod fixed_block;
pub mod ring;
pub mod rw_lock;
pub mod tagged_stack;

#[cfg(test)]
mod test;
