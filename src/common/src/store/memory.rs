use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{
    Bulk, BulkOp, BulkResult, Collection, Cursor, Database, Document, Filter, Operation, Query,
    SortOrder, StoreError, StoreResult, Update,
};
use crate::model::DocId;

type CollectionData = BTreeMap<DocId, Document>;

/// In-memory database used by tests and local runs.
///
/// Every single-document operation takes the database write lock, so
/// updates and removals are atomic per document like a real document store.
/// Cursors page by id, resuming after the last id they returned, which keeps
/// them stable while other tasks mutate the collection.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    name: String,
    collections: RwLock<BTreeMap<String, CollectionData>>,
    failures: Mutex<Vec<(String, Operation)>>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                collections: RwLock::new(BTreeMap::new()),
                failures: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make the next `operation` on `collection` fail with
    /// [`StoreError::Injected`].
    pub async fn fail_next(&self, collection: &str, operation: Operation) {
        self.inner
            .failures
            .lock()
            .await
            .push((collection.to_string(), operation));
    }

    /// Create an empty collection so it shows up in
    /// [`Database::collection_names`].
    pub async fn create_collection(&self, name: &str) {
        self.inner
            .collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();
    }

    /// All documents of a collection, in id order.
    pub async fn documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .collections
            .read()
            .await
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn check_failure(&self, collection: &str, operation: Operation) -> StoreResult<()> {
        let mut failures = self.inner.failures.lock().await;
        if let Some(pos) = failures
            .iter()
            .position(|(name, op)| name == collection && *op == operation)
        {
            failures.remove(pos);
            return Err(StoreError::Injected(operation));
        }
        Ok(())
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new("test")
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn collection_names(&self) -> StoreResult<Vec<String>> {
        self.check_failure("", Operation::ListCollections).await?;
        Ok(self.inner.collections.read().await.keys().cloned().collect())
    }

    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(MemoryCollection {
            db: self.clone(),
            name: name.to_string(),
        })
    }
}

/// Handle to a collection of a [`MemoryDatabase`].
#[derive(Debug, Clone)]
pub struct MemoryCollection {
    db: MemoryDatabase,
    name: String,
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn database(&self) -> Arc<dyn Database> {
        Arc::new(self.db.clone())
    }

    async fn count(&self) -> StoreResult<u64> {
        self.db.check_failure(&self.name, Operation::Count).await?;
        let collections = self.db.inner.collections.read().await;
        Ok(collections
            .get(&self.name)
            .map_or(0, |docs| docs.len() as u64))
    }

    async fn find_id(&self, id: &DocId) -> StoreResult<Option<Document>> {
        self.db.check_failure(&self.name, Operation::Find).await?;
        let collections = self.db.inner.collections.read().await;
        Ok(collections
            .get(&self.name)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn find(&self, query: Query) -> Box<dyn Cursor> {
        Box::new(MemoryCursor {
            db: self.db.clone(),
            collection: self.name.clone(),
            query,
            last: None,
            exhausted: false,
        })
    }

    async fn insert(&self, doc: Document) -> StoreResult<()> {
        self.db.check_failure(&self.name, Operation::Insert).await?;
        let mut collections = self.db.inner.collections.write().await;
        let docs = collections.entry(self.name.clone()).or_default();
        if docs.contains_key(&doc.id) {
            return Err(StoreError::Write(format!(
                "duplicate id {} in {}",
                doc.id, self.name
            )));
        }
        docs.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn update_id(&self, id: &DocId, update: Update) -> StoreResult<bool> {
        self.db.check_failure(&self.name, Operation::Update).await?;
        let mut collections = self.db.inner.collections.write().await;
        let doc = collections
            .get_mut(&self.name)
            .and_then(|docs| docs.get_mut(id))
            .ok_or(StoreError::NotFound)?;
        Ok(update.apply(doc))
    }

    async fn upsert_id(&self, id: &DocId, update: Update) -> StoreResult<()> {
        self.db.check_failure(&self.name, Operation::Update).await?;
        let mut collections = self.db.inner.collections.write().await;
        let doc = collections
            .entry(self.name.clone())
            .or_default()
            .entry(id.clone())
            .or_insert_with(|| Document::new(id.clone()));
        update.apply(doc);
        Ok(())
    }

    async fn remove_id(&self, id: &DocId) -> StoreResult<()> {
        self.db.check_failure(&self.name, Operation::Remove).await?;
        let mut collections = self.db.inner.collections.write().await;
        collections
            .get_mut(&self.name)
            .and_then(|docs| docs.remove(id))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn remove_all(&self, filter: &Filter) -> StoreResult<u64> {
        self.db.check_failure(&self.name, Operation::Remove).await?;
        let mut collections = self.db.inner.collections.write().await;
        let Some(docs) = collections.get_mut(&self.name) else {
            return Ok(0);
        };
        let before = docs.len();
        match filter {
            Filter::IdIn(ids) => {
                for id in ids {
                    docs.remove(id);
                }
            }
            _ => docs.retain(|_, doc| !filter.matches(doc)),
        }
        Ok((before - docs.len()) as u64)
    }

    async fn run_bulk(&self, bulk: Bulk) -> StoreResult<BulkResult> {
        self.db.check_failure(&self.name, Operation::Bulk).await?;
        let mut collections = self.db.inner.collections.write().await;
        let docs = collections.entry(self.name.clone()).or_default();
        let mut result = BulkResult::default();
        for op in bulk.ops() {
            match op {
                BulkOp::Remove(id) => {
                    if docs.remove(id).is_some() {
                        result.matched += 1;
                        result.modified += 1;
                    }
                }
                BulkOp::Update(id, update) => {
                    if let Some(doc) = docs.get_mut(id) {
                        result.matched += 1;
                        if update.apply(doc) {
                            result.modified += 1;
                        }
                    }
                }
            }
        }
        Ok(result)
    }
}

struct MemoryCursor {
    db: MemoryDatabase,
    collection: String,
    query: Query,
    last: Option<DocId>,
    exhausted: bool,
}

#[async_trait]
impl Cursor for MemoryCursor {
    async fn next_batch(&mut self) -> StoreResult<Option<Vec<Document>>> {
        if self.exhausted {
            return Ok(None);
        }
        self.db
            .check_failure(&self.collection, Operation::Find)
            .await?;

        let limit = match self.query.batch_size {
            0 => usize::MAX,
            n => n,
        };
        let collections = self.db.inner.collections.read().await;
        let batch: Vec<Document> = match collections.get(&self.collection) {
            None => Vec::new(),
            Some(docs) => {
                let matching = |doc: &&Document| self.query.filter.matches(doc);
                match (self.query.order, &self.last) {
                    (SortOrder::Ascending, None) => {
                        docs.values().filter(matching).take(limit).cloned().collect()
                    }
                    (SortOrder::Ascending, Some(last)) => docs
                        .range((Bound::Excluded(last), Bound::Unbounded))
                        .map(|(_, doc)| doc)
                        .filter(matching)
                        .take(limit)
                        .cloned()
                        .collect(),
                    (SortOrder::Descending, None) => docs
                        .values()
                        .rev()
                        .filter(matching)
                        .take(limit)
                        .cloned()
                        .collect(),
                    (SortOrder::Descending, Some(last)) => docs
                        .range((Bound::Unbounded, Bound::Excluded(last)))
                        .rev()
                        .map(|(_, doc)| doc)
                        .filter(matching)
                        .take(limit)
                        .cloned()
                        .collect(),
                }
            }
        };

        match batch.last() {
            None => {
                self.exhausted = true;
                Ok(None)
            }
            Some(doc) => {
                self.last = Some(doc.id.clone());
                if batch.len() < limit {
                    self.exhausted = true;
                }
                Ok(Some(batch))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(n: usize) -> MemoryDatabase {
        let db = MemoryDatabase::default();
        let coll = db.collection("widgets");
        for i in 0..n {
            coll.insert(Document::new(format!("w{i:02}")).with_field("n", i))
                .await
                .unwrap();
        }
        db
    }

    async fn drain(mut cursor: Box<dyn Cursor>) -> Vec<Vec<String>> {
        let mut batches = Vec::new();
        while let Some(batch) = cursor.next_batch().await.unwrap() {
            batches.push(batch.iter().map(|d| d.id.to_string()).collect());
        }
        batches
    }

    #[tokio::test]
    async fn test_cursor_batches_ascending_and_descending() {
        let db = seeded(5).await;
        let coll = db.collection("widgets");

        let asc = drain(coll.find(Query::new(Filter::All).batch_size(2))).await;
        assert_eq!(
            asc,
            vec![vec!["w00", "w01"], vec!["w02", "w03"], vec!["w04"]]
        );

        let desc = drain(
            coll.find(
                Query::new(Filter::All)
                    .batch_size(3)
                    .order(SortOrder::Descending),
            ),
        )
        .await;
        assert_eq!(desc, vec![vec!["w04", "w03", "w02"], vec!["w01", "w00"]]);
    }

    #[tokio::test]
    async fn test_cursor_survives_concurrent_removal() {
        let db = seeded(6).await;
        let coll = db.collection("widgets");

        let mut cursor = coll.find(Query::new(Filter::All).batch_size(2));
        let first = cursor.next_batch().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);

        for doc in &first {
            coll.remove_id(&doc.id).await.unwrap();
        }
        let second = cursor.next_batch().await.unwrap().unwrap();
        assert_eq!(second[0].id, DocId::from("w02"));
    }

    #[tokio::test]
    async fn test_update_and_remove_missing_document_report_not_found() {
        let db = MemoryDatabase::default();
        let coll = db.collection("widgets");

        let err = coll
            .update_id(&DocId::from("nope"), Update::set("a", 1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(coll.remove_id(&DocId::from("nope")).await.unwrap_err().is_not_found());
        assert_eq!(
            coll.remove_all(&Filter::id_in([DocId::from("nope")]))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_bulk_counts_only_existing_documents() {
        let db = seeded(3).await;
        let coll = db.collection("widgets");

        let mut bulk = Bulk::unordered();
        bulk.remove(DocId::from("w00"));
        bulk.remove(DocId::from("w00"));
        bulk.remove(DocId::from("missing"));
        bulk.remove(DocId::from("w02"));
        let result = coll.run_bulk(bulk).await.unwrap();

        assert_eq!(result.matched, 2);
        assert_eq!(coll.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_fire_once() {
        let db = seeded(1).await;
        let coll = db.collection("widgets");
        db.fail_next("widgets", Operation::Count).await;

        assert!(matches!(
            coll.count().await,
            Err(StoreError::Injected(Operation::Count))
        ));
        assert_eq!(coll.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collection_names() {
        let db = seeded(1).await;
        db.create_collection("empty").await;

        assert_eq!(
            db.collection_names().await.unwrap(),
            vec!["empty".to_string(), "widgets".to_string()]
        );
    }
}
