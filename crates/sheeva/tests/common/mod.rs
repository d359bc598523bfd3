//! Shared utilities for sheeva integration tests.
//!
//! - `TestHarness` owns a temporary descriptor directory and an in-memory provider
//! - builders create descriptors and YAML files without boilerplate

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
