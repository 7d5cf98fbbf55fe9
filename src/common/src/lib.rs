pub mod config;
pub mod logging;
pub mod model;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use model::{DocId, ObjectId, StashKey, Txn, TxnOp, TxnState};
pub use store::{Collection, Database, Document, MemoryDatabase, StoreError, StoreResult};
