//! Reading test parameters from the environment.

use std::env;

/// Reads the number stored in the environment variable `name`, or returns `default`.
///
/// A variable which is absent, or which does not parse as a number, yields `default`.
///
/// #   Example
///
/// ```
/// use lfalloc_test::read_number_from_environment;
///
/// let threads = read_number_from_environment("LFALLOC_TEST_SURELY_UNSET", 4);
///
/// assert_eq!(4, threads);
/// ```
pub fn read_number_from_environment(name: &str, default: usize) -> usize {
    match env::var(name).ok().and_then(|value| value.parse().ok()) {
        Some(result) => {
            println!("read_number_from_environment - {}: {}", name, result);
            result
        },
        None => {
            println!("read_number_from_environment - {}: {} (default)", name, default);
            default
        },
    }
}

// mod tests
