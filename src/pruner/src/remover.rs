//! Batched deletion of documents by id.
//!
//! Removers queue ids and submit them to the store in flushes of at most
//! [`MAX_BULK_OPS`] ids. Documents that are already gone are not an error:
//! another pruner may have removed them first. [`Remover::removed`] only
//! counts documents the store reports as actually removed.

use std::sync::Arc;

use async_trait::async_trait;
use common::model::DocId;
use common::store::{Bulk, Collection, Filter, StoreError};
use tracing::debug;

use crate::config::{MAX_BULK_OPS, RemoverStrategy};
use crate::error::{Result, StoreResultExt};

#[async_trait]
pub trait Remover: Send {
    /// Queue `id` for removal, flushing once the queue is full.
    async fn remove(&mut self, id: DocId) -> Result<()>;

    /// Submit everything queued. A no-op when nothing is queued.
    async fn flush(&mut self) -> Result<()>;

    /// Documents removed by completed flushes.
    fn removed(&self) -> u64;
}

/// Build the remover for `strategy` over `collection`.
pub fn new_remover(strategy: RemoverStrategy, collection: Arc<dyn Collection>) -> Box<dyn Remover> {
    match strategy {
        RemoverStrategy::Batch => Box::new(BatchRemover::new(collection)),
        RemoverStrategy::Bulk => Box::new(BulkRemover::new(collection)),
    }
}

/// Removes each flush with a single `id in {...}` query.
pub struct BatchRemover {
    collection: Arc<dyn Collection>,
    queue: Vec<DocId>,
    removed: u64,
}

impl BatchRemover {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        Self {
            collection,
            queue: Vec::with_capacity(MAX_BULK_OPS),
            removed: 0,
        }
    }
}

#[async_trait]
impl Remover for BatchRemover {
    async fn remove(&mut self, id: DocId) -> Result<()> {
        self.queue.push(id);
        if self.queue.len() >= MAX_BULK_OPS {
            return self.flush().await;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let filter = Filter::id_in(self.queue.iter().cloned());
        match self.collection.remove_all(&filter).await {
            Ok(removed) => {
                debug!(
                    collection = self.collection.name(),
                    queued = self.queue.len(),
                    removed,
                    "flushed batch removal"
                );
                self.removed += removed;
            }
            Err(StoreError::NotFound) => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("removing {} documents from {}", self.queue.len(), self.collection.name())
                });
            }
        }
        self.queue.clear();
        Ok(())
    }

    fn removed(&self) -> u64 {
        self.removed
    }
}

/// Removes each flush with an unordered bulk request of single-id removals.
pub struct BulkRemover {
    collection: Arc<dyn Collection>,
    chunk: Bulk,
    removed: u64,
}

impl BulkRemover {
    pub fn new(collection: Arc<dyn Collection>) -> Self {
        Self {
            collection,
            chunk: Bulk::unordered(),
            removed: 0,
        }
    }
}

#[async_trait]
impl Remover for BulkRemover {
    async fn remove(&mut self, id: DocId) -> Result<()> {
        self.chunk.remove(id);
        if self.chunk.len() >= MAX_BULK_OPS {
            return self.flush().await;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        let size = self.chunk.len();
        match self.collection.run_bulk(self.chunk.clone()).await {
            Ok(result) => {
                debug!(
                    collection = self.collection.name(),
                    queued = size,
                    matched = result.matched,
                    "flushed bulk removal"
                );
                self.removed += result.matched;
            }
            Err(StoreError::NotFound) => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("bulk removing {size} documents from {}", self.collection.name())
                });
            }
        }
        self.chunk = Bulk::unordered();
        Ok(())
    }

    fn removed(&self) -> u64 {
        self.removed
    }
}
