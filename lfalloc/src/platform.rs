//! Abstraction over OS differences.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::SystemPlatform;

#[cfg(not(unix))]
mod system;

#[cfg(not(unix))]
pub use system::SystemPlatform;
