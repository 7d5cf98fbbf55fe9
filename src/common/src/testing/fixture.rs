use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};

use crate::model::{DocId, ObjectId, QUEUE_FIELD, StashKey, Txn, TxnOp, TxnState, txn_token};
use crate::store::{Collection, Database, Document, Filter, MemoryDatabase, StoreResult, Update};

/// Seeds a [`MemoryDatabase`] the way the transaction runner would leave it:
/// a record in the transaction collection plus the transaction's token
/// appended to every document it touched.
#[derive(Debug, Clone)]
pub struct TxnFixture {
    db: MemoryDatabase,
    txns_name: String,
    nonce: Arc<AtomicU64>,
}

impl TxnFixture {
    pub fn new(txns_name: impl Into<String>) -> Self {
        Self::with_database(MemoryDatabase::default(), txns_name)
    }

    pub fn with_database(db: MemoryDatabase, txns_name: impl Into<String>) -> Self {
        Self {
            db,
            txns_name: txns_name.into(),
            nonce: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    pub fn txns(&self) -> Arc<dyn Collection> {
        self.db.collection(&self.txns_name)
    }

    pub fn stash(&self) -> Arc<dyn Collection> {
        self.db.collection(&format!("{}.stash", self.txns_name))
    }

    pub fn hours_ago(&self, hours: i64) -> DateTime<Utc> {
        Utc::now() - Duration::hours(hours)
    }

    /// Insert an empty document into `collection`.
    pub async fn add_doc(&self, collection: &str, id: impl Into<DocId>) -> StoreResult<DocId> {
        let id = id.into();
        self.db
            .collection(collection)
            .insert(Document::new(id.clone()).with_queue(Vec::<String>::new()))
            .await?;
        Ok(id)
    }

    /// Record a transaction created at `created` and append its token to the
    /// queue of every document it touched, creating missing documents.
    pub async fn add_txn(
        &self,
        state: TxnState,
        created: DateTime<Utc>,
        ops: &[(&str, DocId)],
    ) -> StoreResult<ObjectId> {
        let txn = Txn::new(
            ObjectId::with_time(created),
            state,
            ops.iter()
                .map(|(collection, id)| TxnOp::new(*collection, id.clone()))
                .collect(),
        );
        self.txns().insert(Document::from_txn(&txn)?).await?;

        let token = txn_token(&txn.id, &self.next_nonce());
        for op in &txn.ops {
            self.db
                .collection(&op.collection)
                .upsert_id(&op.doc_id, Update::push(QUEUE_FIELD, token.clone()))
                .await?;
        }
        Ok(txn.id)
    }

    /// Move a document into the stash, keeping its queue, as a removal
    /// would.
    pub async fn stash_doc(&self, collection: &str, id: &DocId) -> StoreResult<DocId> {
        let coll = self.db.collection(collection);
        let doc = coll.find_id(id).await?.unwrap_or_else(|| Document::new(id.clone()));
        coll.remove_all(&Filter::id_in([id.clone()])).await?;

        let key = DocId::Stash(StashKey::new(collection, id.clone()));
        let stash_doc = Document {
            id: key.clone(),
            fields: doc.fields,
        };
        self.stash().insert(stash_doc).await?;
        Ok(key)
    }

    /// Current queue of a document, or `None` if it does not exist.
    pub async fn queue(&self, collection: &str, id: &DocId) -> StoreResult<Option<Vec<String>>> {
        Ok(self
            .db
            .collection(collection)
            .find_id(id)
            .await?
            .map(|doc| doc.queue()))
    }

    fn next_nonce(&self) -> String {
        format!("{:08x}", self.nonce.fetch_add(1, Ordering::Relaxed))
    }
}
