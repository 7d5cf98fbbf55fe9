//! Garbage collection of resolved multi-document transactions.
//!
//! Transactions leave a token in the queue of every document they touch and
//! a record in the transaction collection. Once a transaction is aborted or
//! applied, its tokens and record are dead weight. This crate removes them:
//!
//! - [`maybe_prune`] decides from the growth of the transaction collection
//!   whether a run is worthwhile, runs it and records the outcome in
//!   `<txns>.prune`.
//! - [`clean_and_prune`] runs one sweep, or a forward and a reverse sweep
//!   concurrently, and merges their statistics.
//! - [`IncrementalPruner`] is a single sweep.

pub mod collections;
pub mod config;
pub mod decision;
pub mod error;
pub mod incremental;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod rate_gate;
pub mod remover;
pub mod runner;
pub mod stats_store;

pub use config::{PruneOptions, RemoverStrategy};
pub use decision::{PruneDecision, PruneReason, should_prune};
pub use error::{PruneError, Result};
pub use incremental::{
    IncrementalPruneArgs, IncrementalPruner, PrunerStats, TxnBudget, combine_stats,
};
pub use metrics::PruneMetrics;
pub use orchestrator::{CleanAndPruneArgs, CleanupStats, clean_and_prune};
pub use runner::{PruneReport, maybe_prune, maybe_prune_with_config};
pub use stats_store::PruneStatsRecord;
