//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a deterministic simulation with scripted input
//! - `test_utils`: session construction over in-memory transports and frame-loop helpers
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! mod common;
//! use common::stubs::{GameStub, InputScript};
//! use common::test_utils::{memory_sessions, synchronize_sessions};
//! ```

pub mod stubs;
pub mod test_utils;

// Re-export commonly used items for convenience.
#[allow(unused_imports)]
pub use test_utils::{
    free_port, memory_sessions, run_both, run_until_paused, synchronize_sessions,
    MAX_SYNC_ITERATIONS,
};
