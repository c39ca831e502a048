//! Utility functions and helpers
//!
//! Atomic file rewrites used by the durable event log.

pub mod atomic;

pub use atomic::{atomic_write_with, cleanup_temp_files};
