//! Test fixtures for integration testing
//!
//! This module provides a pruning test context over an in-memory database
//! and the description of the workloads seeded into it.

mod prune_context;

pub use prune_context::{PruneTestContext, WorkloadConfig, WorkloadInfo};
