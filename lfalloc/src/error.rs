//! Errors.

use std::alloc::Layout;

use thiserror::Error;

/// Errors detected when constructing an allocator.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum ConfigurationError {
    /// The blocks of a `FixedBlockAllocator` must have a non-zero size.
    #[error("blocks must have a non-zero size")]
    ZeroBlockSize,
    /// The initial chunk or bucket must have a non-zero size.
    #[error("the initial size hint must be non-zero")]
    ZeroHint,
    /// The initial chunk or bucket exceeds the maximum size.
    #[error("the initial size hint {hint} exceeds the maximum of {maximum}")]
    HintTooLarge {
        /// The hint requested.
        hint: usize,
        /// The maximum hint.
        maximum: usize,
    },
    /// The layout cannot be handled, for example because padding it would overflow.
    #[error("unsupported block layout {0:?}")]
    InvalidLayout(Layout),
}
