//! Decide whether a transaction collection needs pruning and prune it.

use std::sync::Arc;

use chrono::Utc;
use common::config::Configuration;
use common::model::ObjectId;
use common::store::Database;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::collections::{prune_collection_name, stash_collection_name};
use crate::config::{DEFAULT_BATCH_SLEEP, PruneOptions};
use crate::decision::{PruneDecision, should_prune};
use crate::error::{PruneError, Result, StoreResultExt};
use crate::metrics::PruneMetrics;
use crate::orchestrator::{CleanAndPruneArgs, CleanupStats, clean_and_prune};
use crate::stats_store::{PruneStatsRecord, last_txns_count, write_prune_stats};

/// Outcome of [`maybe_prune`].
#[derive(Clone, Debug, PartialEq)]
pub struct PruneReport {
    pub decision: PruneDecision,
    /// Transaction count after the previous run, if one was recorded
    pub last_txns_count: Option<u64>,
    pub txns_count: u64,
    /// Set when pruning ran
    pub cleanup: Option<CleanupStats>,
    /// The stats record persisted for this run
    pub record: Option<PruneStatsRecord>,
}

impl PruneReport {
    pub fn pruned(&self) -> bool {
        self.cleanup.is_some()
    }
}

/// Prune `txns_name` in `db` if it grew enough since the last recorded run,
/// then record the run in `<txns_name>.prune`.
pub async fn maybe_prune(
    db: Arc<dyn Database>,
    txns_name: &str,
    options: &PruneOptions,
    metrics: &PruneMetrics,
) -> Result<PruneReport> {
    let options = options.resolve();
    debug!(?options, "resolved prune options");

    let txns = db.collection(txns_name);
    let txns_prune = db.collection(&prune_collection_name(txns_name));
    let stash_name = stash_collection_name(txns_name);
    let txns_stash = db.collection(&stash_name);

    let txns_count = txns
        .count()
        .await
        .context("failed to retrieve starting txns count")?;
    let last_count = last_txns_count(txns_prune.as_ref())
        .await
        .map_err(|err| err.within("failed to retrieve pruning stats"))?;

    let decision = should_prune(last_count, txns_count, &options);
    let mut report = PruneReport {
        decision,
        last_txns_count: last_count,
        txns_count,
        cleanup: None,
        record: None,
    };
    if !decision.required {
        info!(
            last_txns = ?last_count,
            txns = txns_count,
            "txns after last prune: {}, txns now: {}, not pruning: {}",
            display_count(last_count),
            txns_count,
            decision.reason,
        );
        metrics.record_run_skipped();
        return Ok(report);
    }
    info!(
        last_txns = ?last_count,
        txns = txns_count,
        "txns after last prune: {}, txns now: {}, pruning: {}",
        display_count(last_count),
        txns_count,
        decision.reason,
    );
    metrics.record_run_started();

    let started = Utc::now();
    let timer = Instant::now();
    let stash_docs_before = txns_stash
        .count()
        .await
        .with_context(|| format!("failed to retrieve starting {stash_name:?} count"))?;

    let stats = clean_and_prune(CleanAndPruneArgs {
        txns: Some(Arc::clone(&txns)),
        txns_count,
        max_time: options.max_time,
        max_txns_to_process: options.max_txns_to_process,
        multithreaded: options.dual_direction(),
        txn_batch_size: options.txn_batch_size,
        txn_batch_sleep: options.batch_sleep.unwrap_or(DEFAULT_BATCH_SLEEP),
        remover: options.remover,
    })
    .await?;

    let txns_count_after = txns
        .count()
        .await
        .context("failed to retrieve final txns count")?;
    let stash_docs_after = txns_stash
        .count()
        .await
        .with_context(|| format!("failed to retrieve final {stash_name:?} count"))?;
    let elapsed = timer.elapsed();
    info!(
        txns = txns_count_after,
        collections = stats.collections_inspected,
        docs = stats.docs_inspected,
        docs_cleaned = stats.docs_cleaned,
        stash_removed = stats.stash_documents_removed,
        txns_removed = stats.transactions_removed,
        should_retry = stats.should_retry,
        "txn pruning complete after {:?}. txns now: {}, inspected {} collections, {} docs ({} cleaned)\n   removed {} stash docs and {} txn docs",
        elapsed,
        txns_count_after,
        stats.collections_inspected,
        stats.docs_inspected,
        stats.docs_cleaned,
        stats.stash_documents_removed,
        stats.transactions_removed,
    );
    metrics.record_cleanup(&stats);
    metrics.record_duration_ms(elapsed.as_millis() as u64);

    let record = PruneStatsRecord {
        id: ObjectId::new(),
        started,
        completed: Utc::now(),
        txns_before: txns_count,
        txns_after: txns_count_after,
        stash_docs_before,
        stash_docs_after,
    };
    write_prune_stats(txns_prune.as_ref(), &record).await?;

    report.cleanup = Some(stats);
    report.record = Some(record);
    Ok(report)
}

/// Run [`maybe_prune`] with the collection and options named by `config`.
///
/// `db` must be the database the configuration names.
pub async fn maybe_prune_with_config(
    db: Arc<dyn Database>,
    config: &Configuration,
    metrics: &PruneMetrics,
) -> Result<PruneReport> {
    if db.name() != config.database.name {
        return Err(PruneError::Config(format!(
            "database {:?} does not match configured database {:?}",
            db.name(),
            config.database.name
        )));
    }
    let options = PruneOptions::from(&config.prune);
    maybe_prune(db, &config.prune.txns_collection, &options, metrics).await
}

fn display_count(count: Option<u64>) -> String {
    count.map_or_else(|| "none".to_string(), |count| count.to_string())
}
