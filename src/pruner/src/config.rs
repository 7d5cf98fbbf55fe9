//! Pruning run options and tuning constants.

use std::time::Duration;

use chrono::{DateTime, Utc};

pub use common::config::RemoverStrategy;

/// Growth factor used when none is requested.
pub const DEFAULT_PRUNE_FACTOR: f64 = 2.0;

/// Below this many new transactions a prune is not worth it. Without this
/// floor an emptied collection would satisfy any growth factor.
pub const DEFAULT_MIN_NEW_TRANSACTIONS: u64 = 100;

/// More new transactions than this force a prune regardless of the factor.
pub const DEFAULT_MAX_NEW_TRANSACTIONS: u64 = 100_000;

/// Transactions read and evaluated together. Larger batches make document
/// lookups more efficient but produce larger removals.
pub const DEFAULT_TXN_BATCH_SIZE: usize = 1000;
pub const MIN_TXN_BATCH_SIZE: usize = 10;
pub const MAX_TXN_BATCH_SIZE: usize = 100_000;

/// A batch of 1000 transactions takes roughly 100ms, so this slows a sweep
/// by about 10% and gives other queries room.
pub const DEFAULT_BATCH_SLEEP: Duration = Duration::from_millis(10);
pub const MAX_BATCH_SLEEP: Duration = Duration::from_secs(60);

/// Upper bound on identifiers removed by one flush.
pub const MAX_BULK_OPS: usize = 1000;

/// Interval between progress log lines.
pub const LOG_INTERVAL: Duration = Duration::from_secs(15);

/// Passes a sweep makes over the resolved transactions. Removing entries
/// from a collection while iterating it can skip documents, so the sweep
/// repeats until a pass finds nothing to do or this many passes ran.
pub const MAX_ITER_COUNT: usize = 5;

/// Cap on queue tokens held in the document cache.
pub const MAX_MEMORY_TOKENS: usize = 50_000;

/// Documents loaded per lookup query.
pub const QUEUE_BATCH_SIZE: usize = 200;

/// Parameters of a pruning run.
///
/// Zero values and unset options mean "use the default".
/// [`PruneOptions::resolve`] substitutes the defaults without touching the
/// caller's value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PruneOptions {
    /// Prune once the transaction collection grew by this factor.
    pub prune_factor: f64,
    pub min_new_transactions: u64,
    pub max_new_transactions: u64,
    /// Concurrent sweeps. Two or more adds a reverse-order sweep.
    pub max_batches: u32,
    pub batch_sleep: Option<Duration>,
    pub txn_batch_size: usize,
    /// Resolved transactions evaluated per run; 0 evaluates all of them.
    pub max_txns_to_process: usize,
    /// Only transactions created at or before this time are pruned.
    pub max_time: Option<DateTime<Utc>>,
    pub multithreaded: bool,
    pub remover: RemoverStrategy,
}

impl PruneOptions {
    /// Return a copy with every unset field replaced by its default.
    ///
    /// Resolving an already resolved value returns it unchanged.
    pub fn resolve(&self) -> PruneOptions {
        let mut resolved = self.clone();
        if resolved.prune_factor <= 0.0 {
            resolved.prune_factor = DEFAULT_PRUNE_FACTOR;
        }
        if resolved.min_new_transactions == 0 {
            resolved.min_new_transactions = DEFAULT_MIN_NEW_TRANSACTIONS;
        }
        if resolved.max_new_transactions == 0 {
            resolved.max_new_transactions = DEFAULT_MAX_NEW_TRANSACTIONS;
        }
        if resolved.max_batches == 0 {
            resolved.max_batches = 1;
        }
        if resolved.batch_sleep.is_none() {
            resolved.batch_sleep = Some(DEFAULT_BATCH_SLEEP);
        }
        if resolved.txn_batch_size < MIN_TXN_BATCH_SIZE {
            resolved.txn_batch_size = DEFAULT_TXN_BATCH_SIZE;
        }
        resolved
    }

    /// Whether the run should add a reverse-order sweep.
    pub fn dual_direction(&self) -> bool {
        self.multithreaded || self.max_batches > 1
    }
}

impl From<&common::config::PruneConfig> for PruneOptions {
    fn from(config: &common::config::PruneConfig) -> Self {
        let max_time = config.max_age.map(|age| {
            chrono::Duration::from_std(age)
                .ok()
                .and_then(|age| Utc::now().checked_sub_signed(age))
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });
        Self {
            prune_factor: config.prune_factor,
            min_new_transactions: config.min_new_transactions,
            max_new_transactions: config.max_new_transactions,
            max_batches: config.max_batches,
            batch_sleep: config.batch_sleep,
            txn_batch_size: config.txn_batch_size,
            max_txns_to_process: config.max_txns_to_process,
            max_time,
            multithreaded: config.multithreaded,
            remover: config.remover,
        }
    }
}
