//! The API of lfalloc-core.

mod platform;

pub use platform::Platform;

pub use crate::internals::{
    atomic::{barrier, Atomic, AtomicPrimitive},
    fixed_block::FixedBlockAllocator,
    ring::RingAllocator,
    rw_lock::RwLock,
    tagged_stack::{StackLinks, TaggedStack},
};
pub use crate::utils::PowerOf2;
