//! Pruning runs that hit bad state or store failures
//!
//! A failed run must leave the database in a state the next run can finish
//! from, and must not record itself as a completed run.

use std::time::Duration;

use anyhow::Result;
use common::model::ObjectId;
use common::store::{Collection, Database, Document, Operation};
use pruner::{CleanAndPruneArgs, PruneOptions, PruneReason};
use tests_integration::fixtures::{PruneTestContext, WorkloadConfig};
use tests_integration::generators::generate_workload;

fn options() -> PruneOptions {
    PruneOptions {
        batch_sleep: Some(Duration::ZERO),
        txn_batch_size: 25,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_broken_stats_pointer_counts_as_no_previous_run() -> Result<()> {
    let ctx = PruneTestContext::new();
    let info = generate_workload(&ctx.fixture, &WorkloadConfig::default()).await?;
    ctx.database()
        .collection("txns.prune")
        .insert(Document::new("last").with_field("id", ObjectId::new().to_hex()))
        .await?;

    let report = ctx.maybe_prune(&options()).await?;

    assert_eq!(report.last_txns_count, None);
    assert_eq!(report.decision.reason, PruneReason::NoPreviousRun);
    assert_eq!(
        report.cleanup.unwrap().transactions_removed,
        info.resolved.len() as u64
    );

    // The pointer now names the record just written.
    let next = ctx.maybe_prune(&options()).await?;
    assert_eq!(next.last_txns_count, Some(0));
    assert!(!next.pruned());
    Ok(())
}

#[tokio::test]
async fn test_failed_run_is_not_recorded_and_retry_finishes() -> Result<()> {
    let ctx = PruneTestContext::new();
    let info = generate_workload(
        &ctx.fixture,
        &WorkloadConfig {
            pending_every: 4,
            ..Default::default()
        },
    )
    .await?;
    ctx.memory().fail_next("units", Operation::Update).await;

    let err = ctx.maybe_prune(&options()).await.unwrap_err();
    assert!(
        err.to_string().contains("failed to clean queue of units/"),
        "unexpected error: {err}"
    );
    assert_eq!(ctx.database().collection("txns.prune").count().await?, 0);
    assert!(ctx.txns_count().await? > info.pending.len() as u64);

    let report = ctx.maybe_prune(&options()).await?;
    assert_eq!(report.decision.reason, PruneReason::NoPreviousRun);
    assert!(!report.cleanup.unwrap().should_retry);
    assert_eq!(ctx.txns_count().await?, info.pending.len() as u64);
    let pending = info.pending.iter().copied().collect();
    assert!(ctx.referenced_txns("units").await.is_subset(&pending));
    assert!(ctx.referenced_txns("machines").await.is_subset(&pending));
    Ok(())
}

#[tokio::test]
async fn test_failed_txn_removal_keeps_documents_consistent() -> Result<()> {
    let ctx = PruneTestContext::new();
    let info = generate_workload(&ctx.fixture, &WorkloadConfig::default()).await?;
    ctx.memory().fail_next("txns", Operation::Remove).await;

    let args = CleanAndPruneArgs {
        txn_batch_size: 50,
        ..Default::default()
    };
    assert!(ctx.clean_and_prune(args.clone()).await.is_err());

    // Transactions whose tokens were already pulled are simply found clean
    // on the next run and removed.
    let retry = ctx.clean_and_prune(args).await?;
    assert_eq!(retry.transactions_removed, info.resolved.len() as u64);
    assert_eq!(retry.docs_cleaned, 0);
    assert_eq!(ctx.txns_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_capped_runs_converge() -> Result<()> {
    let ctx = PruneTestContext::new();
    let info = generate_workload(&ctx.fixture, &WorkloadConfig::default()).await?;
    let args = CleanAndPruneArgs {
        txn_batch_size: 25,
        max_txns_to_process: 50,
        ..Default::default()
    };

    let first = ctx.clean_and_prune(args.clone()).await?;
    assert_eq!(first.transactions_removed, 50);
    assert!(first.should_retry);

    let mut removed = first.transactions_removed;
    let mut runs = 1;
    let mut retry = first.should_retry;
    while retry {
        assert!(runs < 10, "capped runs did not converge");
        let stats = ctx.clean_and_prune(args.clone()).await?;
        assert!(stats.transactions_removed <= 50);
        removed += stats.transactions_removed;
        retry = stats.should_retry;
        runs += 1;
    }

    assert_eq!(removed, info.resolved.len() as u64);
    assert_eq!(ctx.txns_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_invalid_batch_size_is_rejected_before_any_work() -> Result<()> {
    let ctx = PruneTestContext::new();
    generate_workload(&ctx.fixture, &WorkloadConfig::default()).await?;

    let err = ctx
        .clean_and_prune(CleanAndPruneArgs {
            txn_batch_size: 5,
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "invalid prune configuration: TxnBatchSize 5 too small, must be between 10 and 100000"
    );
    assert_eq!(ctx.txns_count().await?, 200);
    Ok(())
}

#[tokio::test]
async fn test_list_collections_failure_surfaces() -> Result<()> {
    let ctx = PruneTestContext::new();
    generate_workload(&ctx.fixture, &WorkloadConfig::default()).await?;
    ctx.memory().fail_next("", Operation::ListCollections).await;

    let err = ctx.maybe_prune(&options()).await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "failed to list collections: injected list collections failure"
    );
    assert_eq!(ctx.txns_count().await?, 200);
    Ok(())
}
