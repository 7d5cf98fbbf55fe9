//! Test data generators
//!
//! Seed transaction workloads the way a running transaction system leaves
//! them: records in the transaction collection, tokens in document queues
//! and stash entries for removed documents.

mod workload;

pub use workload::generate_workload;
