//! Transaction data model shared by the store and the pruner.
//!
//! Transaction records live in the base transaction collection (`txns` by
//! default). Every document a transaction touches carries the transaction's
//! token in its `txn-queue` array until a pruner removes it.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Field holding the ordered list of transaction tokens on a document.
pub const QUEUE_FIELD: &str = "txn-queue";

/// Field holding the numeric transaction state on a transaction record.
pub const STATE_FIELD: &str = "s";

/// Length of the hex encoded transaction id at the start of a queue token.
pub const TOKEN_ID_LEN: usize = 24;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("object id must be 12 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid object id hex: {0}")]
    InvalidHex(String),

    #[error("unknown transaction state {0}")]
    UnknownState(u8),
}

static PROCESS_UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();
static COUNTER: AtomicU32 = AtomicU32::new(0);

fn process_unique() -> [u8; 5] {
    *PROCESS_UNIQUE.get_or_init(|| {
        let random = uuid::Uuid::new_v4();
        let mut bytes = [0u8; 5];
        bytes.copy_from_slice(&random.as_bytes()[..5]);
        bytes
    })
}

fn epoch_seconds(time: DateTime<Utc>) -> u32 {
    time.timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

/// A 12-byte object identifier whose first four bytes are the big-endian
/// creation time in seconds. Ids therefore sort by creation time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generate a fresh id stamped with the current time.
    pub fn new() -> Self {
        Self::with_time(Utc::now())
    }

    /// Generate a fresh id stamped with `time`.
    pub fn with_time(time: DateTime<Utc>) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&epoch_seconds(time).to_be_bytes());
        bytes[4..9].copy_from_slice(&process_unique());
        let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    /// The greatest id that can have been created at `time`.
    ///
    /// Every id created at or before `time` compares less than or equal to it.
    pub fn max_for_time(time: DateTime<Utc>) -> Self {
        let mut bytes = [0xffu8; 12];
        bytes[..4].copy_from_slice(&epoch_seconds(time).to_be_bytes());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, ModelError> {
        let decoded = hex::decode(s).map_err(|e| ModelError::InvalidHex(e.to_string()))?;
        let bytes: [u8; 12] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| ModelError::InvalidLength(decoded.len()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Creation time encoded in the id, truncated to seconds.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let secs = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        DateTime::from_timestamp(i64::from(secs), 0).unwrap_or_default()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl std::str::FromStr for ObjectId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Key of a stash document: the collection and id of the document it
/// preserves.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StashKey {
    #[serde(rename = "c")]
    pub collection: String,
    pub id: Box<DocId>,
}

impl StashKey {
    pub fn new(collection: impl Into<String>, id: DocId) -> Self {
        Self {
            collection: collection.into(),
            id: Box::new(id),
        }
    }
}

/// Identifier of a document within a collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocId {
    Object(ObjectId),
    Text(String),
    Stash(StashKey),
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(id) => write!(f, "{id}"),
            Self::Text(id) => f.write_str(id),
            Self::Stash(key) => write!(f, "{}/{}", key.collection, key.id),
        }
    }
}

impl From<ObjectId> for DocId {
    fn from(id: ObjectId) -> Self {
        Self::Object(id)
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<String> for DocId {
    fn from(id: String) -> Self {
        Self::Text(id)
    }
}

impl From<StashKey> for DocId {
    fn from(key: StashKey) -> Self {
        Self::Stash(key)
    }
}

/// Lifecycle state of a transaction record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TxnState {
    Preparing = 1,
    Prepared = 2,
    Aborting = 3,
    Applying = 4,
    /// Pre-conditions failed, nothing was applied.
    Aborted = 5,
    /// All changes were applied.
    Applied = 6,
}

impl TxnState {
    /// States a transaction never leaves. Only these are prune eligible.
    pub const TERMINAL: [TxnState; 2] = [TxnState::Aborted, TxnState::Applied];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl TryFrom<u8> for TxnState {
    type Error = ModelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Preparing),
            2 => Ok(Self::Prepared),
            3 => Ok(Self::Aborting),
            4 => Ok(Self::Applying),
            5 => Ok(Self::Aborted),
            6 => Ok(Self::Applied),
            other => Err(ModelError::UnknownState(other)),
        }
    }
}

impl From<TxnState> for u8 {
    fn from(state: TxnState) -> Self {
        state as u8
    }
}

/// A single operation of a transaction, naming the document it touched.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnOp {
    #[serde(rename = "c")]
    pub collection: String,
    #[serde(rename = "d")]
    pub doc_id: DocId,
}

impl TxnOp {
    pub fn new(collection: impl Into<String>, doc_id: impl Into<DocId>) -> Self {
        Self {
            collection: collection.into(),
            doc_id: doc_id.into(),
        }
    }
}

/// A transaction record as stored in the transaction collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Txn {
    #[serde(skip)]
    pub id: ObjectId,
    #[serde(rename = "s")]
    pub state: TxnState,
    #[serde(rename = "o", default)]
    pub ops: Vec<TxnOp>,
}

impl Txn {
    pub fn new(id: ObjectId, state: TxnState, ops: Vec<TxnOp>) -> Self {
        Self { id, state, ops }
    }

    /// Token this transaction appends to a document queue.
    pub fn token(&self, nonce: &str) -> String {
        txn_token(&self.id, nonce)
    }
}

/// Build a queue token of the form `<24 hex id>_<nonce>`.
pub fn txn_token(id: &ObjectId, nonce: &str) -> String {
    format!("{id}_{nonce}")
}

/// Extract the transaction id from a queue token.
///
/// Returns `None` for tokens that do not start with a 24 character hex id
/// followed by `_` or the end of the string.
pub fn token_txn_id(token: &str) -> Option<ObjectId> {
    let prefix = token.get(..TOKEN_ID_LEN)?;
    match token.as_bytes().get(TOKEN_ID_LEN) {
        None | Some(b'_') => ObjectId::from_hex(prefix).ok(),
        Some(_) => None,
    }
}
