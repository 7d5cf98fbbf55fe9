//! Pruning test context over an in-memory database

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use common::model::{DocId, ObjectId, token_txn_id};
use common::store::{Collection, Database, MemoryDatabase};
use common::testing::TxnFixture;
use pruner::{CleanAndPruneArgs, CleanupStats, PruneMetrics, PruneOptions, PruneReport};

/// Shape of a generated workload
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Transactions to create
    pub txn_count: usize,
    /// Collections the transactions touch
    pub collections: Vec<String>,
    pub docs_per_collection: usize,
    /// Documents touched by each transaction
    pub ops_per_txn: usize,
    /// Every n-th transaction stays unresolved; 0 resolves all of them
    pub pending_every: usize,
    /// Documents of the first collection moved into the stash afterwards
    pub stashed_docs: usize,
    /// Age of the generated transactions
    pub age_hours: i64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            txn_count: 200,
            collections: vec!["machines".to_string(), "units".to_string()],
            docs_per_collection: 25,
            ops_per_txn: 2,
            pending_every: 0,
            stashed_docs: 0,
            age_hours: 2,
        }
    }
}

/// What a generated workload contains
#[derive(Debug, Clone, Default)]
pub struct WorkloadInfo {
    pub resolved: Vec<ObjectId>,
    pub pending: Vec<ObjectId>,
    /// Every document touched, as (collection, id)
    pub docs: Vec<(String, DocId)>,
    /// Stash keys of the documents moved to the stash
    pub stashed: Vec<DocId>,
}

/// Complete test context for pruning
pub struct PruneTestContext {
    pub fixture: TxnFixture,
    pub metrics: PruneMetrics,
}

impl PruneTestContext {
    /// Creates a new context with an empty in-memory database
    pub fn new() -> Self {
        Self {
            fixture: TxnFixture::with_database(MemoryDatabase::new("juju"), "txns"),
            metrics: PruneMetrics::new(),
        }
    }

    pub fn memory(&self) -> &MemoryDatabase {
        self.fixture.database()
    }

    pub fn database(&self) -> Arc<dyn Database> {
        Arc::new(self.fixture.database().clone())
    }

    pub fn txns(&self) -> Arc<dyn Collection> {
        self.fixture.txns()
    }

    /// Run the full decide, prune and record cycle
    pub async fn maybe_prune(&self, options: &PruneOptions) -> Result<PruneReport> {
        Ok(pruner::maybe_prune(self.database(), "txns", options, &self.metrics).await?)
    }

    /// Run the sweeps directly, bypassing the decision
    pub async fn clean_and_prune(&self, args: CleanAndPruneArgs) -> Result<CleanupStats> {
        Ok(pruner::clean_and_prune(CleanAndPruneArgs {
            txns: Some(self.txns()),
            ..args
        })
        .await?)
    }

    pub async fn txns_count(&self) -> Result<u64> {
        Ok(self.txns().count().await?)
    }

    pub async fn stash_count(&self) -> Result<u64> {
        Ok(self.fixture.stash().count().await?)
    }

    /// Ids of every transaction referenced by a token in `collection`
    pub async fn referenced_txns(&self, collection: &str) -> HashSet<ObjectId> {
        self.memory()
            .documents(collection)
            .await
            .iter()
            .flat_map(|doc| doc.queue())
            .filter_map(|token| token_txn_id(&token))
            .collect()
    }

    /// Queue of one document, empty when the document does not exist
    pub async fn queue(&self, collection: &str, id: &DocId) -> Result<Vec<String>> {
        Ok(self.fixture.queue(collection, id).await?.unwrap_or_default())
    }
}

impl Default for PruneTestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_prune_context() -> Result<()> {
        let ctx = PruneTestContext::new();
        assert_eq!(ctx.txns_count().await?, 0);
        assert_eq!(ctx.stash_count().await?, 0);
        assert_eq!(ctx.database().name(), "juju");
        Ok(())
    }

    #[test]
    fn test_workload_config_default() {
        let config = WorkloadConfig::default();
        assert_eq!(config.txn_count, 200);
        assert_eq!(config.collections.len(), 2);
        assert_eq!(config.pending_every, 0);
    }
}
