//! Document store interface consumed by the pruner.
//!
//! The store is a narrow view of a document database: per-collection counts,
//! id lookups, filtered batch cursors, partial updates, removals and unordered
//! bulk submissions. A missing document surfaces as [`StoreError::NotFound`]
//! so callers can treat races with concurrent writers as no-ops.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::model::{DocId, ObjectId, QUEUE_FIELD, Txn};

pub mod memory;
pub use memory::MemoryDatabase;

/// Store operations, used for error reporting and failure injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    ListCollections,
    Count,
    Find,
    Insert,
    Update,
    Remove,
    Bulk,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ListCollections => "list collections",
            Self::Count => "count",
            Self::Find => "find",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Bulk => "bulk",
        };
        f.write_str(name)
    }
}

/// Error types that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,

    #[error("failed to connect to database: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("injected {0} failure")]
    Injected(Operation),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A document: an id plus arbitrary JSON fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: DocId,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<DocId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set the transaction queue of this document.
    pub fn with_queue<I, S>(self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue: Vec<Value> = tokens
            .into_iter()
            .map(|token| Value::String(token.into()))
            .collect();
        self.with_field(QUEUE_FIELD, queue)
    }

    /// Build a document from a serializable record whose fields become the
    /// document body.
    pub fn from_record<T: Serialize>(id: impl Into<DocId>, record: &T) -> StoreResult<Self> {
        match serde_json::to_value(record)? {
            Value::Object(fields) => Ok(Self {
                id: id.into(),
                fields,
            }),
            other => Err(StoreError::InvalidDocument(format!(
                "record must serialize to an object, got {other}"
            ))),
        }
    }

    /// Decode the document body into a record type.
    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Tokens in the document's transaction queue, in order. Non-string
    /// entries are skipped.
    pub fn queue(&self) -> Vec<String> {
        match self.fields.get(QUEUE_FIELD) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn from_txn(txn: &Txn) -> StoreResult<Self> {
        Self::from_record(txn.id, txn)
    }

    pub fn to_txn(&self) -> StoreResult<Txn> {
        let DocId::Object(id) = &self.id else {
            return Err(StoreError::InvalidDocument(format!(
                "transaction id must be an object id, got {}",
                self.id
            )));
        };
        let mut txn: Txn = self.decode()?;
        txn.id = *id;
        Ok(txn)
    }
}

/// Query filter over documents.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    All,
    IdIn(Vec<DocId>),
    IdAtMost(DocId),
    FieldIn { field: String, values: Vec<Value> },
    And(Vec<Filter>),
}

impl Filter {
    pub fn id_in<I: IntoIterator<Item = DocId>>(ids: I) -> Self {
        Self::IdIn(ids.into_iter().collect())
    }

    pub fn field_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::FieldIn {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Transactions created at or before the time encoded in `max_id`.
    pub fn created_at_most(max_id: ObjectId) -> Self {
        Self::IdAtMost(DocId::Object(max_id))
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::IdIn(ids) => ids.contains(&doc.id),
            Self::IdAtMost(max) => doc.id <= *max,
            Self::FieldIn { field, values } => doc
                .fields
                .get(field)
                .is_some_and(|value| values.contains(value)),
            Self::And(filters) => filters.iter().all(|filter| filter.matches(doc)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// A batched find over a collection, sorted by document id.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub order: SortOrder,
    /// Documents returned per batch. Zero means everything in one batch.
    pub batch_size: usize,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            order: SortOrder::Ascending,
            batch_size: 0,
        }
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Partial document mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    Set { field: String, value: Value },
    /// Append a value to an array field, creating it if missing.
    Push { field: String, value: Value },
    /// Remove every occurrence of the given values from an array field.
    PullAll { field: String, values: Vec<Value> },
}

impl Update {
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Set {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn push(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Push {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn pull_all<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::PullAll {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Apply the update to a document, returning whether it changed.
    pub fn apply(&self, doc: &mut Document) -> bool {
        match self {
            Self::Set { field, value } => {
                let previous = doc.fields.insert(field.clone(), value.clone());
                previous.as_ref() != Some(value)
            }
            Self::Push { field, value } => {
                let entry = doc
                    .fields
                    .entry(field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                match entry {
                    Value::Array(items) => {
                        items.push(value.clone());
                        true
                    }
                    other => {
                        *other = Value::Array(vec![value.clone()]);
                        true
                    }
                }
            }
            Self::PullAll { field, values } => match doc.fields.get_mut(field) {
                Some(Value::Array(items)) => {
                    let before = items.len();
                    items.retain(|item| !values.contains(item));
                    items.len() != before
                }
                _ => false,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BulkOp {
    Remove(DocId),
    Update(DocId, Update),
}

/// A set of operations submitted in one round trip.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bulk {
    ordered: bool,
    ops: Vec<BulkOp>,
}

impl Bulk {
    /// Operations may be applied in any order; one failure does not stop the
    /// rest.
    pub fn unordered() -> Self {
        Self {
            ordered: false,
            ops: Vec::new(),
        }
    }

    pub fn ordered() -> Self {
        Self {
            ordered: true,
            ops: Vec::new(),
        }
    }

    pub fn remove(&mut self, id: DocId) {
        self.ops.push(BulkOp::Remove(id));
    }

    pub fn update(&mut self, id: DocId, update: Update) {
        self.ops.push(BulkOp::Update(id, update));
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BulkOp] {
        &self.ops
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BulkResult {
    /// Documents matched by the operations (for removals, documents removed).
    pub matched: u64,
    pub modified: u64,
}

/// Iterates the results of a [`Query`] one batch at a time.
#[async_trait]
pub trait Cursor: Send {
    /// Fetch the next batch, or `None` once the query is exhausted.
    async fn next_batch(&mut self) -> StoreResult<Option<Vec<Document>>>;
}

/// A handle to one collection of a database.
#[async_trait]
pub trait Collection: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// The database this collection belongs to.
    fn database(&self) -> Arc<dyn Database>;

    async fn count(&self) -> StoreResult<u64>;

    async fn find_id(&self, id: &DocId) -> StoreResult<Option<Document>>;

    fn find(&self, query: Query) -> Box<dyn Cursor>;

    async fn insert(&self, doc: Document) -> StoreResult<()>;

    /// Apply `update` to one document. Fails with [`StoreError::NotFound`]
    /// when the document does not exist; otherwise reports whether the
    /// document changed.
    async fn update_id(&self, id: &DocId, update: Update) -> StoreResult<bool>;

    /// Apply `update`, creating an empty document first if needed.
    async fn upsert_id(&self, id: &DocId, update: Update) -> StoreResult<()>;

    /// Remove one document. Fails with [`StoreError::NotFound`] when absent.
    async fn remove_id(&self, id: &DocId) -> StoreResult<()>;

    /// Remove every matching document, returning how many were removed.
    async fn remove_all(&self, filter: &Filter) -> StoreResult<u64>;

    async fn run_bulk(&self, bulk: Bulk) -> StoreResult<BulkResult>;
}

/// A database: a named set of collections.
#[async_trait]
pub trait Database: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    async fn collection_names(&self) -> StoreResult<Vec<String>>;

    fn collection(&self, name: &str) -> Arc<dyn Collection>;
}

/// Fetch documents by id in sub-batches of at most `chunk_size` ids.
pub async fn find_ids(
    collection: &dyn Collection,
    ids: &[DocId],
    chunk_size: usize,
) -> StoreResult<Vec<Document>> {
    let mut found = Vec::with_capacity(ids.len());
    let mut seen = HashSet::new();
    for chunk in ids.chunks(chunk_size.max(1)) {
        let mut cursor = collection.find(Query::new(Filter::id_in(chunk.iter().cloned())));
        while let Some(batch) = cursor.next_batch().await? {
            found.extend(batch.into_iter().filter(|doc| seen.insert(doc.id.clone())));
        }
    }
    Ok(found)
}
