//! Incremental sweep over resolved transactions.
//!
//! A sweep reads aborted and applied transactions in id order (or reverse
//! order), strips their tokens from the queues of every document they
//! touched and then removes the transaction records. Documents that no
//! longer exist are looked up in the stash, whose entries are removed once
//! their queue is empty.
//!
//! Removing transactions while a cursor walks the same collection can make
//! the cursor miss entries, and new transactions resolve while a sweep runs,
//! so a sweep repeats its pass until one finds nothing to do or
//! [`MAX_ITER_COUNT`] passes ran.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::model::{DocId, ObjectId, QUEUE_FIELD, STATE_FIELD, StashKey, TxnState, token_txn_id};
use common::store::{
    Collection, Database, Document, Filter, Query, SortOrder, StoreError, Update, find_ids,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{Instrument, debug, info_span, warn};

use crate::collections::{stash_collection_name, txn_collections};
use crate::config::{
    DEFAULT_TXN_BATCH_SIZE, LOG_INTERVAL, MAX_ITER_COUNT, MAX_MEMORY_TOKENS, QUEUE_BATCH_SIZE,
    RemoverStrategy,
};
use crate::error::{Result, StoreResultExt};
use crate::progress::ProgressMessage;
use crate::rate_gate::RateGate;
use crate::remover::{Remover, new_remover};

/// Counters collected by one or more sweeps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrunerStats {
    pub doc_cache_hits: u64,
    pub doc_cache_misses: u64,
    /// Documents named by a transaction that exist neither in their
    /// collection nor in the stash.
    pub docs_missing: u64,
    pub collection_queries: u64,
    pub stash_queries: u64,
    pub doc_queues_cleaned: u64,
    pub doc_tokens_cleaned: u64,
    pub docs_already_clean: u64,
    pub txns_evaluated: u64,
    pub txns_removed: u64,
    pub stash_docs_removed: u64,
    pub cache_flushes: u64,
    pub passes: u64,
    /// The sweep stopped with work possibly left over.
    pub should_retry: bool,
}

impl PrunerStats {
    /// Documents whose queues were evaluated.
    pub fn docs_inspected(&self) -> u64 {
        self.doc_cache_hits + self.doc_cache_misses
    }
}

/// Field-wise sum of two sets of stats. The retry flag is set if either
/// sweep set it.
pub fn combine_stats(a: PrunerStats, b: PrunerStats) -> PrunerStats {
    PrunerStats {
        doc_cache_hits: a.doc_cache_hits + b.doc_cache_hits,
        doc_cache_misses: a.doc_cache_misses + b.doc_cache_misses,
        docs_missing: a.docs_missing + b.docs_missing,
        collection_queries: a.collection_queries + b.collection_queries,
        stash_queries: a.stash_queries + b.stash_queries,
        doc_queues_cleaned: a.doc_queues_cleaned + b.doc_queues_cleaned,
        doc_tokens_cleaned: a.doc_tokens_cleaned + b.doc_tokens_cleaned,
        docs_already_clean: a.docs_already_clean + b.docs_already_clean,
        txns_evaluated: a.txns_evaluated + b.txns_evaluated,
        txns_removed: a.txns_removed + b.txns_removed,
        stash_docs_removed: a.stash_docs_removed + b.stash_docs_removed,
        cache_flushes: a.cache_flushes + b.cache_flushes,
        passes: a.passes + b.passes,
        should_retry: a.should_retry || b.should_retry,
    }
}

impl fmt::Display for PrunerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PrunerStats(")?;
        writeln!(f, "  DocCacheHits: {}", self.doc_cache_hits)?;
        writeln!(f, "  DocCacheMisses: {}", self.doc_cache_misses)?;
        writeln!(f, "  DocsMissing: {}", self.docs_missing)?;
        writeln!(f, "  CollectionQueries: {}", self.collection_queries)?;
        writeln!(f, "  StashQueries: {}", self.stash_queries)?;
        writeln!(f, "  DocQueuesCleaned: {}", self.doc_queues_cleaned)?;
        writeln!(f, "  DocTokensCleaned: {}", self.doc_tokens_cleaned)?;
        writeln!(f, "  DocsAlreadyClean: {}", self.docs_already_clean)?;
        writeln!(f, "  TxnsEvaluated: {}", self.txns_evaluated)?;
        writeln!(f, "  TxnsRemoved: {}", self.txns_removed)?;
        writeln!(f, "  StashDocsRemoved: {}", self.stash_docs_removed)?;
        writeln!(f, "  CacheFlushes: {}", self.cache_flushes)?;
        writeln!(f, "  Passes: {}", self.passes)?;
        writeln!(f, "  ShouldRetry: {}", self.should_retry)?;
        write!(f, ")")
    }
}

/// Transactions a run may still evaluate, shared by its sweeps.
#[derive(Clone, Debug)]
pub struct TxnBudget(Arc<AtomicUsize>);

impl TxnBudget {
    pub fn new(limit: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(limit)))
    }

    /// Take up to `wanted` transactions from the budget and return how many
    /// were granted.
    pub fn claim(&self, wanted: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                granted = left.min(wanted);
                Some(left - granted)
            });
        granted
    }

    pub fn remaining(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Parameters of one sweep.
#[derive(Clone, Debug, Default)]
pub struct IncrementalPruneArgs {
    /// Only transactions created at or before this time are pruned.
    pub max_time: Option<DateTime<Utc>>,
    /// Walk transactions from the newest to the oldest.
    pub reverse_order: bool,
    /// Transactions per batch; 0 uses the default.
    pub txn_batch_size: usize,
    /// Pause between batches.
    pub txn_batch_sleep: Duration,
    /// Transactions evaluated before the sweep stops; 0 means no cap.
    /// Ignored when `budget` is set.
    pub max_txns_to_process: usize,
    /// Cap shared with the other sweeps of the same run.
    pub budget: Option<TxnBudget>,
    pub progress: Option<UnboundedSender<ProgressMessage>>,
    pub remover: RemoverStrategy,
}

/// Runs a sweep over one transaction collection.
pub struct IncrementalPruner {
    args: IncrementalPruneArgs,
}

impl IncrementalPruner {
    pub fn new(args: IncrementalPruneArgs) -> Self {
        Self { args }
    }

    /// Sweep `txns`. Any store failure other than a missing document aborts
    /// the sweep.
    pub async fn prune(self, txns: Arc<dyn Collection>) -> Result<PrunerStats> {
        let direction = if self.args.reverse_order {
            "reverse"
        } else {
            "forward"
        };
        let span = info_span!("txn_sweep", direction, txns = txns.name());
        Sweep::new(self.args, txns).run().instrument(span).await
    }
}

type DocKey = (String, DocId);

/// Queues of recently read documents, bounded by the number of tokens held.
#[derive(Debug, Default)]
struct DocCache {
    queues: HashMap<DocKey, Vec<String>>,
    tokens: usize,
}

impl DocCache {
    /// The cached queue of a document, provided it still holds a token for
    /// every transaction in `expected`. A queue missing one of them may be
    /// older than those transactions and must be read again.
    fn lookup(&self, key: &DocKey, expected: &HashSet<ObjectId>) -> Option<&Vec<String>> {
        let queue = self.queues.get(key)?;
        let present: HashSet<ObjectId> = queue
            .iter()
            .filter_map(|token| token_txn_id(token))
            .collect();
        expected.is_subset(&present).then_some(queue)
    }

    fn insert(&mut self, key: DocKey, queue: Vec<String>) {
        self.tokens += queue.len();
        if let Some(old) = self.queues.insert(key, queue) {
            self.tokens -= old.len();
        }
    }

    fn remove(&mut self, key: &DocKey) {
        if let Some(old) = self.queues.remove(key) {
            self.tokens -= old.len();
        }
    }

    fn is_full(&self) -> bool {
        self.tokens > MAX_MEMORY_TOKENS
    }

    fn clear(&mut self) {
        self.queues.clear();
        self.tokens = 0;
    }
}

/// What a single pass over the resolved transactions did.
#[derive(Debug, Default)]
struct PassOutcome {
    work_done: u64,
    capped: bool,
    cache_overflowed: bool,
}

/// A document whose queue still has to be evaluated, with the batch
/// transactions expected in it.
type Wanted = BTreeMap<DocId, HashSet<ObjectId>>;

struct Sweep {
    args: IncrementalPruneArgs,
    batch_size: usize,
    db: Arc<dyn Database>,
    txns: Arc<dyn Collection>,
    stash: Arc<dyn Collection>,
    txn_remover: Box<dyn Remover>,
    stash_remover: Box<dyn Remover>,
    collections: HashSet<String>,
    cache: DocCache,
    stats: PrunerStats,
    budget: Option<TxnBudget>,
    log_gate: RateGate,
    reported_txns: u64,
    reported_docs: u64,
}

impl Sweep {
    fn new(args: IncrementalPruneArgs, txns: Arc<dyn Collection>) -> Self {
        let db = txns.database();
        let stash = db.collection(&stash_collection_name(txns.name()));
        let batch_size = match args.txn_batch_size {
            0 => DEFAULT_TXN_BATCH_SIZE,
            n => n,
        };
        let budget = args.budget.clone().or_else(|| {
            (args.max_txns_to_process > 0).then(|| TxnBudget::new(args.max_txns_to_process))
        });
        Self {
            txn_remover: new_remover(args.remover, Arc::clone(&txns)),
            stash_remover: new_remover(args.remover, Arc::clone(&stash)),
            args,
            batch_size,
            db,
            txns,
            stash,
            collections: HashSet::new(),
            cache: DocCache::default(),
            stats: PrunerStats::default(),
            budget,
            log_gate: RateGate::new(LOG_INTERVAL),
            reported_txns: 0,
            reported_docs: 0,
        }
    }

    async fn run(mut self) -> Result<PrunerStats> {
        let mut finished = false;
        for pass in 1..=MAX_ITER_COUNT {
            let outcome = self.run_pass().await?;
            self.stats.passes += 1;
            debug!(
                pass,
                work_done = outcome.work_done,
                capped = outcome.capped,
                cache_overflowed = outcome.cache_overflowed,
                "sweep pass complete"
            );
            if outcome.capped {
                break;
            }
            if outcome.work_done == 0 && !outcome.cache_overflowed {
                finished = true;
                break;
            }
        }
        if !finished {
            self.stats.should_retry = true;
        }
        self.stats.txns_removed = self.txn_remover.removed();
        self.stats.stash_docs_removed = self.stash_remover.removed();
        Ok(self.stats)
    }

    fn work_counter(&self) -> u64 {
        self.txn_remover.removed() + self.stash_remover.removed() + self.stats.doc_queues_cleaned
    }

    async fn run_pass(&mut self) -> Result<PassOutcome> {
        let mut outcome = PassOutcome::default();
        let work_before = self.work_counter();

        let names = self
            .db
            .collection_names()
            .await
            .context("failed to list collections")?;
        self.collections = txn_collections(names, self.txns.name()).into_iter().collect();

        let mut cursor = self.txns.find(self.resolved_txns_query());
        let mut first = true;
        while let Some(mut batch) = cursor
            .next_batch()
            .await
            .with_context(|| format!("failed to read resolved transactions from {}", self.txns.name()))?
        {
            if batch.is_empty() {
                continue;
            }
            if let Some(budget) = &self.budget {
                let granted = budget.claim(batch.len());
                if granted == 0 {
                    self.stats.should_retry = true;
                    outcome.capped = true;
                    break;
                }
                batch.truncate(granted);
            }
            if !first && !self.args.txn_batch_sleep.is_zero() {
                tokio::time::sleep(self.args.txn_batch_sleep).await;
            }
            first = false;

            self.process_batch(batch).await?;
            if self.cache.is_full() {
                self.flush().await?;
                self.cache.clear();
                self.stats.cache_flushes += 1;
                outcome.cache_overflowed = true;
            }
            self.report_progress();
            if self.log_gate.ready() {
                debug!(
                    txns_evaluated = self.stats.txns_evaluated,
                    txns_removed = self.txn_remover.removed(),
                    docs_cleaned = self.stats.doc_queues_cleaned,
                    "sweep in progress"
                );
            }
        }

        self.flush().await?;
        self.report_progress();
        outcome.work_done = self.work_counter() - work_before;
        Ok(outcome)
    }

    fn resolved_txns_query(&self) -> Query {
        let mut filters = vec![Filter::field_in(
            STATE_FIELD,
            TxnState::TERMINAL.map(u8::from),
        )];
        if let Some(max_time) = self.args.max_time {
            filters.push(Filter::created_at_most(ObjectId::max_for_time(max_time)));
        }
        let order = if self.args.reverse_order {
            SortOrder::Descending
        } else {
            SortOrder::Ascending
        };
        Query::new(Filter::And(filters))
            .order(order)
            .batch_size(self.batch_size)
    }

    async fn process_batch(&mut self, batch: Vec<Document>) -> Result<()> {
        let mut txn_ids = Vec::with_capacity(batch.len());
        let mut touched: BTreeMap<String, Wanted> = BTreeMap::new();
        for doc in &batch {
            let txn = doc
                .to_txn()
                .with_context(|| format!("failed to decode transaction {}", doc.id))?;
            for op in txn.ops {
                touched
                    .entry(op.collection)
                    .or_default()
                    .entry(op.doc_id)
                    .or_default()
                    .insert(txn.id);
            }
            txn_ids.push(txn.id);
        }
        self.stats.txns_evaluated += txn_ids.len() as u64;
        let resolved: HashSet<ObjectId> = txn_ids.iter().copied().collect();

        let mut stashed = Wanted::new();
        for (name, wanted) in touched {
            let missing = if self.collections.contains(&name) {
                let collection = self.db.collection(&name);
                self.clean_collection(collection.as_ref(), wanted, &resolved, false)
                    .await?
            } else {
                wanted
            };
            for (id, expected) in missing {
                stashed.insert(DocId::Stash(StashKey::new(name.as_str(), id)), expected);
            }
        }
        if !stashed.is_empty() {
            let stash = Arc::clone(&self.stash);
            let missing = self
                .clean_collection(stash.as_ref(), stashed, &resolved, true)
                .await?;
            self.stats.docs_missing += missing.len() as u64;
        }

        for id in txn_ids {
            self.txn_remover.remove(DocId::Object(id)).await?;
        }
        Ok(())
    }

    /// Strip resolved tokens from the wanted documents of `collection`,
    /// returning the ones that do not exist there.
    async fn clean_collection(
        &mut self,
        collection: &dyn Collection,
        mut wanted: Wanted,
        resolved: &HashSet<ObjectId>,
        is_stash: bool,
    ) -> Result<Wanted> {
        let name = collection.name().to_string();
        let mut loaded: Vec<(DocId, Vec<String>)> = Vec::with_capacity(wanted.len());
        let mut misses = Vec::new();
        for (id, expected) in &wanted {
            // Stash entries are read fresh: emptying one removes it.
            let cached = if is_stash {
                None
            } else {
                self.cache.lookup(&(name.clone(), id.clone()), expected)
            };
            match cached {
                Some(queue) => {
                    self.stats.doc_cache_hits += 1;
                    loaded.push((id.clone(), queue.clone()));
                }
                None => misses.push(id.clone()),
            }
        }

        for chunk in misses.chunks(QUEUE_BATCH_SIZE) {
            if is_stash {
                self.stats.stash_queries += 1;
            } else {
                self.stats.collection_queries += 1;
            }
            let found = find_ids(collection, chunk, QUEUE_BATCH_SIZE)
                .await
                .with_context(|| format!("failed to load documents from {name}"))?;
            self.stats.doc_cache_misses += found.len() as u64;
            for doc in found {
                let queue = doc.queue();
                if !is_stash {
                    self.cache.insert((name.clone(), doc.id.clone()), queue.clone());
                }
                loaded.push((doc.id, queue));
            }
        }

        for (id, queue) in loaded {
            wanted.remove(&id);
            self.clean_document(collection, &name, id, queue, resolved, is_stash)
                .await?;
        }
        Ok(wanted)
    }

    async fn clean_document(
        &mut self,
        collection: &dyn Collection,
        name: &str,
        id: DocId,
        queue: Vec<String>,
        resolved: &HashSet<ObjectId>,
        is_stash: bool,
    ) -> Result<()> {
        let key = (name.to_string(), id);
        let (pull, remaining): (Vec<String>, Vec<String>) = queue
            .into_iter()
            .partition(|token| token_txn_id(token).is_some_and(|txn| resolved.contains(&txn)));

        if !pull.is_empty() {
            let pulled = pull.len() as u64;
            match collection
                .update_id(&key.1, Update::pull_all(QUEUE_FIELD, pull))
                .await
            {
                Ok(true) => {
                    self.stats.doc_queues_cleaned += 1;
                    self.stats.doc_tokens_cleaned += pulled;
                }
                Ok(false) => self.stats.docs_already_clean += 1,
                Err(StoreError::NotFound) => {
                    self.cache.remove(&key);
                    return Ok(());
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to clean queue of {name}/{}", key.1));
                }
            }
        } else {
            self.stats.docs_already_clean += 1;
        }

        if is_stash {
            if remaining.is_empty() {
                self.stash_remover.remove(key.1).await?;
            }
        } else {
            self.cache.insert(key, remaining);
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.stash_remover.flush().await?;
        self.txn_remover.flush().await
    }

    fn report_progress(&mut self) {
        let txns = self.txn_remover.removed();
        let docs = self.stats.doc_queues_cleaned;
        let msg = ProgressMessage {
            txns_removed: txns - self.reported_txns,
            docs_cleaned: docs - self.reported_docs,
        };
        if msg == ProgressMessage::default() {
            return;
        }
        self.reported_txns = txns;
        self.reported_docs = docs;
        if let Some(progress) = &self.args.progress {
            if progress.send(msg).is_err() {
                warn!("progress reporter stopped before the sweep finished");
            }
        }
    }
}
