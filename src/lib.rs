#![doc = include_str!("../readme.md")]

pub mod core;
pub mod log;

// Re-exported for use inside the logging macros.
pub use colored;
