use anyhow::{Result, bail};
use common::model::{DocId, TxnState};
use common::testing::TxnFixture;

use crate::fixtures::{WorkloadConfig, WorkloadInfo};

/// Seed `fixture` with the transactions described by `config`.
///
/// Transaction `i` touches `ops_per_txn` documents spread over the
/// configured collections, so hot documents collect long queues. The
/// assignment is deterministic: two databases seeded with the same config
/// hold the same documents and queues.
pub async fn generate_workload(fixture: &TxnFixture, config: &WorkloadConfig) -> Result<WorkloadInfo> {
    if config.collections.is_empty() || config.docs_per_collection == 0 {
        bail!("workload needs at least one collection and one document");
    }

    let mut info = WorkloadInfo::default();
    for collection in &config.collections {
        for n in 0..config.docs_per_collection {
            let id = fixture.add_doc(collection, doc_id(n)).await?;
            info.docs.push((collection.clone(), id));
        }
    }

    let created = fixture.hours_ago(config.age_hours);
    for i in 0..config.txn_count {
        let ops: Vec<(&str, DocId)> = (0..config.ops_per_txn)
            .map(|j| {
                let collection = &config.collections[(i + j) % config.collections.len()];
                let doc = (i * 7 + j) % config.docs_per_collection;
                (collection.as_str(), doc_id(doc))
            })
            .collect();

        let pending = config.pending_every > 0 && i % config.pending_every == 0;
        let state = match (pending, i % 2) {
            (true, _) => TxnState::Prepared,
            (false, 0) => TxnState::Applied,
            (false, _) => TxnState::Aborted,
        };
        let id = fixture.add_txn(state, created, &ops).await?;
        if pending {
            info.pending.push(id);
        } else {
            info.resolved.push(id);
        }
    }

    let first = &config.collections[0];
    for n in 0..config.stashed_docs.min(config.docs_per_collection) {
        let key = fixture.stash_doc(first, &doc_id(n)).await?;
        info.stashed.push(key);
    }
    Ok(info)
}

fn doc_id(n: usize) -> DocId {
    DocId::from(format!("doc-{n:04}"))
}
