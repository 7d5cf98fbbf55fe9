//! Persisted record of pruning runs.
//!
//! Every run inserts a [`PruneStatsRecord`] into `<txns>.prune` and then
//! points the singleton `last` document at it, so the previous run's
//! result is found without scanning the history.

use chrono::{DateTime, Utc};
use common::model::{DocId, ObjectId};
use common::store::{Collection, Document, Update};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, StoreResultExt};

/// Id of the pointer document.
pub const LAST_RUN_ID: &str = "last";

/// Field of the pointer document naming the latest record.
const POINTER_FIELD: &str = "id";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStatsRecord {
    #[serde(skip)]
    pub id: ObjectId,
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
    #[serde(rename = "txns-before")]
    pub txns_before: u64,
    #[serde(rename = "txns-after")]
    pub txns_after: u64,
    #[serde(rename = "stash-docs-before")]
    pub stash_docs_before: u64,
    #[serde(rename = "stash-docs-after")]
    pub stash_docs_after: u64,
}

/// Transaction count left by the last recorded run.
///
/// `None` when no run was recorded, or when the pointer no longer leads to
/// a readable record. The latter is logged and forces the next run to
/// prune.
pub async fn last_txns_count(prune: &dyn Collection) -> Result<Option<u64>> {
    let pointer = prune
        .find_id(&DocId::from(LAST_RUN_ID))
        .await
        .context("failed to load pruning stats pointer")?;
    let Some(pointer) = pointer else {
        return Ok(None);
    };

    let Some(id) = pointer
        .get(POINTER_FIELD)
        .and_then(|value| value.as_str())
        .and_then(|hex| ObjectId::from_hex(hex).ok())
    else {
        warn!(collection = prune.name(), "pruning stats pointer was broken - will recover");
        return Ok(None);
    };

    let record = prune
        .find_id(&DocId::Object(id))
        .await
        .context("failed to load pruning stats")?;
    match record.map(|doc| doc.decode::<PruneStatsRecord>()) {
        Some(Ok(record)) => Ok(Some(record.txns_after)),
        Some(Err(err)) => {
            warn!(
                collection = prune.name(),
                error = %err,
                "pruning stats record unreadable - will recover"
            );
            Ok(None)
        }
        None => {
            warn!(collection = prune.name(), "pruning stats pointer was broken - will recover");
            Ok(None)
        }
    }
}

/// Insert `record` and point the `last` document at it.
pub async fn write_prune_stats(prune: &dyn Collection, record: &PruneStatsRecord) -> Result<()> {
    let doc = Document::from_record(record.id, record).context("failed to write prune stats")?;
    prune
        .insert(doc)
        .await
        .context("failed to write prune stats")?;
    prune
        .upsert_id(
            &DocId::from(LAST_RUN_ID),
            Update::set(POINTER_FIELD, record.id.to_hex()),
        )
        .await
        .context("failed to write prune stats pointer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::store::{Database, MemoryDatabase, Operation};

    fn record(txns_after: u64) -> PruneStatsRecord {
        let started = Utc::now() - Duration::seconds(5);
        PruneStatsRecord {
            id: ObjectId::new(),
            started,
            completed: Utc::now(),
            txns_before: 5000,
            txns_after,
            stash_docs_before: 40,
            stash_docs_after: 3,
        }
    }

    #[tokio::test]
    async fn test_no_previous_run() {
        let db = MemoryDatabase::default();
        let prune = db.collection("txns.prune");
        assert_eq!(last_txns_count(prune.as_ref()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pointer_follows_latest_record() {
        let db = MemoryDatabase::default();
        let prune = db.collection("txns.prune");

        write_prune_stats(prune.as_ref(), &record(1200)).await.unwrap();
        let latest = record(800);
        write_prune_stats(prune.as_ref(), &latest).await.unwrap();

        assert_eq!(last_txns_count(prune.as_ref()).await.unwrap(), Some(800));
        assert_eq!(prune.count().await.unwrap(), 3);

        let stored = prune
            .find_id(&DocId::Object(latest.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("txns-after"), Some(&serde_json::Value::from(800)));
        assert_eq!(stored.get("stash-docs-before"), Some(&serde_json::Value::from(40)));
    }

    #[tokio::test]
    async fn test_broken_pointer_recovers() {
        let db = MemoryDatabase::default();
        let prune = db.collection("txns.prune");
        let orphan = record(10);
        write_prune_stats(prune.as_ref(), &orphan).await.unwrap();
        prune.remove_id(&DocId::Object(orphan.id)).await.unwrap();

        assert_eq!(last_txns_count(prune.as_ref()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_garbage_pointer_recovers() {
        let db = MemoryDatabase::default();
        let prune = db.collection("txns.prune");
        prune
            .upsert_id(&DocId::from(LAST_RUN_ID), Update::set("id", 42))
            .await
            .unwrap();

        assert_eq!(last_txns_count(prune.as_ref()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_failure_is_an_error() {
        let db = MemoryDatabase::default();
        let prune = db.collection("txns.prune");
        db.fail_next("txns.prune", Operation::Find).await;

        let err = last_txns_count(prune.as_ref()).await.unwrap_err();
        assert!(err.to_string().starts_with("failed to load pruning stats pointer"));
    }

    #[tokio::test]
    async fn test_pointer_write_failure_is_reported() {
        let db = MemoryDatabase::default();
        let prune = db.collection("txns.prune");
        db.fail_next("txns.prune", Operation::Update).await;

        let err = write_prune_stats(prune.as_ref(), &record(1)).await.unwrap_err();
        assert!(err.to_string().starts_with("failed to write prune stats pointer"));
    }
}
