//! End-to-end pruning runs over seeded in-memory databases
//!
//! Covers the full decide, sweep and record cycle:
//! - Resolved transactions and their tokens disappear
//! - Unresolved transactions and their tokens survive, in order
//! - The time horizon is respected
//! - Stash entries are cleaned and removed
//! - A repeated run finds nothing left to do

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use common::model::{DocId, TxnState, token_txn_id};
use pruner::{CleanAndPruneArgs, PruneOptions, PruneReason, RemoverStrategy};
use tests_integration::fixtures::{PruneTestContext, WorkloadConfig};
use tests_integration::generators::generate_workload;

fn options() -> PruneOptions {
    PruneOptions {
        batch_sleep: Some(Duration::ZERO),
        txn_batch_size: 40,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_run_leaves_only_pending_transactions() -> Result<()> {
    tests_integration::init_test_logging();
    let ctx = PruneTestContext::new();
    let config = WorkloadConfig {
        txn_count: 300,
        pending_every: 7,
        ..Default::default()
    };
    let info = generate_workload(&ctx.fixture, &config).await?;

    let before: Vec<Vec<String>> = {
        let mut queues = Vec::new();
        for (collection, id) in &info.docs {
            queues.push(ctx.queue(collection, id).await?);
        }
        queues
    };

    let report = ctx.maybe_prune(&options()).await?;

    assert!(report.pruned());
    assert_eq!(report.decision.reason, PruneReason::NoPreviousRun);
    let cleanup = report.cleanup.unwrap();
    assert_eq!(cleanup.transactions_removed, info.resolved.len() as u64);
    assert!(!cleanup.should_retry);
    assert_eq!(ctx.txns_count().await?, info.pending.len() as u64);

    let pending: HashSet<_> = info.pending.iter().copied().collect();
    for ((collection, id), before) in info.docs.iter().zip(before) {
        let expected: Vec<String> = before
            .into_iter()
            .filter(|token| token_txn_id(token).is_some_and(|txn| pending.contains(&txn)))
            .collect();
        assert_eq!(ctx.queue(collection, id).await?, expected, "{collection}/{id}");
    }
    for collection in &config.collections {
        assert!(ctx.referenced_txns(collection).await.is_subset(&pending));
    }
    Ok(())
}

#[tokio::test]
async fn test_second_sweep_has_nothing_to_do() -> Result<()> {
    let ctx = PruneTestContext::new();
    generate_workload(
        &ctx.fixture,
        &WorkloadConfig {
            pending_every: 5,
            stashed_docs: 4,
            ..Default::default()
        },
    )
    .await?;

    let args = CleanAndPruneArgs {
        txn_batch_size: 25,
        ..Default::default()
    };
    let first = ctx.clean_and_prune(args.clone()).await?;
    assert!(first.transactions_removed > 0);
    assert!(first.docs_cleaned > 0);

    let second = ctx.clean_and_prune(args).await?;
    assert_eq!(second.transactions_removed, 0);
    assert_eq!(second.docs_cleaned, 0);
    assert_eq!(second.stash_documents_removed, 0);
    assert!(!second.should_retry);
    Ok(())
}

#[tokio::test]
async fn test_horizon_keeps_recent_transactions() -> Result<()> {
    let ctx = PruneTestContext::new();
    let fx = &ctx.fixture;
    let doc = fx.add_doc("machines", "m0").await?;
    let old = fx
        .add_txn(TxnState::Applied, fx.hours_ago(48), &[("machines", doc.clone())])
        .await?;
    let recent = fx
        .add_txn(TxnState::Applied, fx.hours_ago(1), &[("machines", doc.clone())])
        .await?;

    let report = ctx
        .maybe_prune(&PruneOptions {
            max_time: Some(fx.hours_ago(24)),
            ..options()
        })
        .await?;

    assert_eq!(report.cleanup.unwrap().transactions_removed, 1);
    let remaining: Vec<_> = ctx
        .queue("machines", &doc)
        .await?
        .iter()
        .filter_map(|token| token_txn_id(token))
        .collect();
    assert_eq!(remaining, vec![recent]);
    assert!(!ctx.referenced_txns("machines").await.contains(&old));
    assert_eq!(ctx.txns_count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_stash_entries_removed_once_unreferenced() -> Result<()> {
    let ctx = PruneTestContext::new();
    let config = WorkloadConfig {
        txn_count: 100,
        stashed_docs: 5,
        ..Default::default()
    };
    let info = generate_workload(&ctx.fixture, &config).await?;
    assert_eq!(ctx.stash_count().await?, 5);

    let report = ctx
        .maybe_prune(&PruneOptions {
            remover: RemoverStrategy::Bulk,
            ..options()
        })
        .await?;

    let cleanup = report.cleanup.unwrap();
    assert_eq!(cleanup.stash_documents_removed, 5);
    assert_eq!(cleanup.transactions_removed, info.resolved.len() as u64);
    let record = report.record.unwrap();
    assert_eq!(record.stash_docs_before, 5);
    assert_eq!(record.stash_docs_after, 0);
    assert_eq!(ctx.stash_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_stash_entry_with_pending_token_is_kept() -> Result<()> {
    let ctx = PruneTestContext::new();
    let fx = &ctx.fixture;
    let doc = DocId::from("u0");
    fx.add_txn(TxnState::Applied, fx.hours_ago(3), &[("units", doc.clone())])
        .await?;
    let pending = fx
        .add_txn(TxnState::Preparing, fx.hours_ago(2), &[("units", doc.clone())])
        .await?;
    let key = fx.stash_doc("units", &doc).await?;

    ctx.maybe_prune(&options()).await?;

    let stashed = ctx.queue("txns.stash", &key).await?;
    assert_eq!(stashed.len(), 1);
    assert_eq!(token_txn_id(&stashed[0]), Some(pending));
    Ok(())
}

#[tokio::test]
async fn test_growth_decision_across_runs() -> Result<()> {
    let ctx = PruneTestContext::new();
    let fx = &ctx.fixture;
    for _ in 0..50 {
        fx.add_txn(TxnState::Prepared, fx.hours_ago(1), &[("machines", "m0".into())])
            .await?;
    }

    let first = ctx.maybe_prune(&options()).await?;
    assert!(first.pruned());
    assert_eq!(first.record.unwrap().txns_after, 50);

    for _ in 0..60 {
        fx.add_txn(TxnState::Applied, fx.hours_ago(1), &[("machines", "m1".into())])
            .await?;
    }
    let skipped = ctx.maybe_prune(&options()).await?;
    assert!(!skipped.pruned());
    assert_eq!(skipped.decision.reason, PruneReason::NotEnoughNewTransactions);

    for _ in 0..60 {
        fx.add_txn(TxnState::Applied, fx.hours_ago(1), &[("machines", "m1".into())])
            .await?;
    }
    let grown = ctx.maybe_prune(&options()).await?;
    assert_eq!(grown.decision.reason, PruneReason::GrownSignificantly);
    assert_eq!(grown.cleanup.unwrap().transactions_removed, 120);
    assert_eq!(grown.record.unwrap().txns_after, 50);

    assert_eq!(ctx.metrics.runs_started(), 2);
    assert_eq!(ctx.metrics.runs_skipped(), 1);
    Ok(())
}

#[tokio::test]
async fn test_run_driven_by_config_file() -> Result<()> {
    let (config, _dir) = tests_integration::load_test_config(
        r#"
        [database]
        name = "juju"

        [prune]
        txns_collection = "txns"
        batch_sleep = "0s"
        txn_batch_size = 20
        max_age = "1h"
        remover = "bulk"

        [logging]
        level = "debug"
        "#,
    )?;
    common::logging::init_logging(&config.logging);
    let ctx = PruneTestContext::new();
    let info = generate_workload(
        &ctx.fixture,
        &WorkloadConfig {
            txn_count: 60,
            age_hours: 3,
            ..Default::default()
        },
    )
    .await?;

    assert_eq!(PruneOptions::from(&config.prune).remover, RemoverStrategy::Bulk);
    let report = pruner::maybe_prune_with_config(ctx.database(), &config, &ctx.metrics).await?;

    assert_eq!(
        report.cleanup.unwrap().transactions_removed,
        info.resolved.len() as u64
    );
    assert_eq!(ctx.txns_count().await?, 0);
    Ok(())
}
