//! Runs one or two sweeps over a transaction collection and merges their
//! results.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::store::Collection;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_TXN_BATCH_SIZE, LOG_INTERVAL, MAX_BATCH_SLEEP, MAX_TXN_BATCH_SIZE, MIN_TXN_BATCH_SIZE,
    RemoverStrategy,
};
use crate::error::{PruneError, Result, StoreResultExt};
use crate::incremental::{
    IncrementalPruneArgs, IncrementalPruner, PrunerStats, TxnBudget, combine_stats,
};
use crate::progress::ProgressReporter;

/// Parameters of [`clean_and_prune`].
#[derive(Clone, Debug, Default)]
pub struct CleanAndPruneArgs {
    /// Collection holding the transactions. Its database is searched for
    /// the documents they touched.
    pub txns: Option<Arc<dyn Collection>>,
    /// Current size of `txns` if already known; 0 counts it again.
    pub txns_count: u64,
    /// Only transactions created at or before this time are pruned.
    pub max_time: Option<DateTime<Utc>>,
    /// Resolved transactions evaluated by the whole run, shared by both
    /// sweeps; 0 evaluates all.
    pub max_txns_to_process: usize,
    /// Add a reverse-order sweep running next to the forward sweep.
    pub multithreaded: bool,
    /// Transactions per batch; 0 uses the default.
    pub txn_batch_size: usize,
    pub txn_batch_sleep: Duration,
    pub remover: RemoverStrategy,
}

impl CleanAndPruneArgs {
    /// Check the arguments and return the batch size to use.
    pub fn validate(&self) -> Result<usize> {
        self.checked().map(|(_, batch_size)| batch_size)
    }

    fn checked(&self) -> Result<(Arc<dyn Collection>, usize)> {
        let Some(txns) = self.txns.clone() else {
            return Err(PruneError::Config("nil Txns not valid".to_string()));
        };
        if self.txn_batch_sleep > MAX_BATCH_SLEEP {
            return Err(PruneError::Config(format!(
                "TxnBatchSleepTime ({:?}) must be between 0s and {:?}",
                self.txn_batch_sleep, MAX_BATCH_SLEEP
            )));
        }
        let batch_size = match self.txn_batch_size {
            0 => DEFAULT_TXN_BATCH_SIZE,
            n => n,
        };
        if batch_size < MIN_TXN_BATCH_SIZE {
            return Err(PruneError::Config(format!(
                "TxnBatchSize {batch_size} too small, must be between {MIN_TXN_BATCH_SIZE} and {MAX_TXN_BATCH_SIZE}"
            )));
        }
        if batch_size > MAX_TXN_BATCH_SIZE {
            return Err(PruneError::Config(format!(
                "TxnBatchSize {batch_size} too big, must be between {MIN_TXN_BATCH_SIZE} and {MAX_TXN_BATCH_SIZE}"
            )));
        }
        Ok((txns, batch_size))
    }
}

/// What a [`clean_and_prune`] call did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Queries issued against collections that hold transaction queues
    pub collections_inspected: u64,
    /// Documents whose queues were evaluated
    pub docs_inspected: u64,
    /// Documents updated to drop resolved tokens
    pub docs_cleaned: u64,
    pub stash_documents_removed: u64,
    pub transactions_removed: u64,
    /// Work was left over; another run should follow.
    pub should_retry: bool,
}

impl From<&PrunerStats> for CleanupStats {
    fn from(stats: &PrunerStats) -> Self {
        Self {
            collections_inspected: stats.collection_queries,
            docs_inspected: stats.docs_inspected(),
            docs_cleaned: stats.doc_queues_cleaned,
            stash_documents_removed: stats.stash_docs_removed,
            transactions_removed: stats.txns_removed,
            should_retry: stats.should_retry,
        }
    }
}

#[derive(Default)]
struct Combined {
    stats: PrunerStats,
    error: Option<PruneError>,
}

impl Combined {
    fn record(&mut self, result: Result<PrunerStats>) {
        match result {
            Ok(stats) => self.stats = combine_stats(self.stats, stats),
            Err(err) if self.error.is_none() => self.error = Some(err),
            Err(err) => warn!(error = %err, "second error while handling initial error"),
        }
    }
}

/// Clean resolved transactions out of document queues and remove the
/// transactions that are no longer referenced.
///
/// The forward sweep runs on the calling task. With `multithreaded` set a
/// reverse sweep runs concurrently on a spawned task; both are waited for.
/// The first error either sweep hits is returned; a later one is only
/// logged.
pub async fn clean_and_prune(args: CleanAndPruneArgs) -> Result<CleanupStats> {
    let started = Instant::now();
    let (txns, batch_size) = args.checked()?;

    let txns_count = match args.txns_count {
        0 => txns
            .count()
            .await
            .context("failed to retrieve txns count")?,
        n => n,
    };
    debug!(
        txns = txns.name(),
        txns_count,
        batch_size,
        multithreaded = args.multithreaded,
        "starting txn sweeps"
    );

    let reporter = ProgressReporter::start(LOG_INTERVAL);
    let combined = Arc::new(Mutex::new(Combined::default()));
    let budget = (args.max_txns_to_process > 0).then(|| TxnBudget::new(args.max_txns_to_process));
    let sweep_args = |reverse_order: bool, progress| IncrementalPruneArgs {
        max_time: args.max_time,
        reverse_order,
        txn_batch_size: batch_size,
        txn_batch_sleep: args.txn_batch_sleep,
        max_txns_to_process: args.max_txns_to_process,
        budget: budget.clone(),
        progress: Some(progress),
        remover: args.remover,
    };

    let reverse = args.multithreaded.then(|| {
        let pruner = IncrementalPruner::new(sweep_args(true, reporter.sender()));
        let txns = Arc::clone(&txns);
        let combined = Arc::clone(&combined);
        tokio::spawn(async move {
            let result = pruner.prune(txns).await;
            combined.lock().await.record(result);
        })
    });

    let forward = IncrementalPruner::new(sweep_args(false, reporter.sender()))
        .prune(Arc::clone(&txns))
        .await;
    combined.lock().await.record(forward);

    if let Some(handle) = reverse {
        if let Err(err) = handle.await {
            combined
                .lock()
                .await
                .record(Err(PruneError::Task(err.to_string())));
        }
    }
    let totals = reporter.stop().await;

    let Combined { stats, error } = std::mem::take(&mut *combined.lock().await);
    if let Some(err) = error {
        return Err(err);
    }
    info!(
        txns_removed = stats.txns_removed,
        docs_cleaned = stats.doc_queues_cleaned,
        reported_txns = totals.txns_removed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "pruning removed {} txns and cleaned {} docs in {:?}",
        stats.txns_removed,
        stats.doc_queues_cleaned,
        started.elapsed(),
    );
    debug!("{stats}");
    Ok(CleanupStats::from(&stats))
}
