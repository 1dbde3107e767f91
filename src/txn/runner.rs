use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::TxnError;

pub type TxnResult<T> = std::result::Result<T, TxnError>;

pub type TxnId = u64;

pub type Payload = serde_json::Map<String, Value>;

/// One pending-transaction marker in a document's queue.
///
/// The nonce distinguishes reused transaction ids after chaos; a token whose
/// nonce does not match its transaction record is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub txn_id: TxnId,
    pub nonce: u64,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{:08x}", self.txn_id, self.nonce)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Preparing,
    Prepared,
    Applying,
    Applied,
    Aborting,
    Aborted,
}

impl TxnState {
    pub fn name(&self) -> &'static str {
        match self {
            TxnState::Preparing => "preparing",
            TxnState::Prepared => "prepared",
            TxnState::Applying => "applying",
            TxnState::Applied => "applied",
            TxnState::Aborting => "aborting",
            TxnState::Aborted => "aborted",
        }
    }
}

/// A stored document: payload fields plus its pending-transaction queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    /// Whether the document logically exists. A non-present document is a
    /// placeholder that only carries queue tokens.
    pub present: bool,
    pub payload: Payload,
    pub queue: Vec<Token>,
}

/// Named collections of documents, shared between runners.
#[derive(Debug, Default)]
pub struct Database {
    collections: DashMap<String, DashMap<String, Document>>,
}

impl Database {
    pub fn new() -> Self {
        Database::default()
    }

    /// Seeds a document outside any transaction.
    pub fn insert(&self, collection: &str, doc_id: &str, payload: Payload) {
        let coll = self.collections.entry(collection.to_string()).or_default();
        let mut doc = coll.entry(doc_id.to_string()).or_default();
        doc.present = true;
        doc.payload = payload;
    }

    pub fn get(&self, collection: &str, doc_id: &str) -> Option<Document> {
        let coll = self.collections.get(collection)?;
        let doc = coll.get(doc_id)?;
        Some(doc.value().clone())
    }

    pub(crate) fn ensure_doc(&self, collection: &str, doc_id: &str) {
        let coll = self.collections.entry(collection.to_string()).or_default();
        coll.entry(doc_id.to_string()).or_default();
    }

    pub(crate) fn with_doc<R>(
        &self,
        collection: &str,
        doc_id: &str,
        f: impl FnOnce(&mut Document) -> R,
    ) -> Option<R> {
        let coll = self.collections.get(collection)?;
        let mut doc = coll.get_mut(doc_id)?;
        Some(f(&mut doc))
    }

    /// Drops a placeholder once nothing references it any more.
    pub(crate) fn drop_placeholder(&self, collection: &str, doc_id: &str) {
        if let Some(coll) = self.collections.get(collection) {
            coll.remove_if(doc_id, |_, doc| !doc.present && doc.queue.is_empty());
        }
    }
}

/// Mutation half of an [`Op`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Action {
    /// Pure assertion; the document is never mutated.
    #[default]
    None,
    Insert(Payload),
    Update(Payload),
    Remove,
}

/// One operation of a transaction, addressing a single document.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub collection: String,
    pub doc_id: String,

    /// Payload fields that must hold for the transaction to apply.
    pub assert: Option<Payload>,

    pub change: Action,
}

impl Op {
    pub fn insert(collection: impl Into<String>, doc_id: impl Into<String>, payload: Payload) -> Self {
        Op {
            collection: collection.into(),
            doc_id: doc_id.into(),
            assert: None,
            change: Action::Insert(payload),
        }
    }

    pub fn update(collection: impl Into<String>, doc_id: impl Into<String>, set: Payload) -> Self {
        Op {
            collection: collection.into(),
            doc_id: doc_id.into(),
            assert: None,
            change: Action::Update(set),
        }
    }

    pub fn remove(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Op {
            collection: collection.into(),
            doc_id: doc_id.into(),
            assert: None,
            change: Action::Remove,
        }
    }

    pub fn assert(
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        expected: Payload,
    ) -> Self {
        Op {
            collection: collection.into(),
            doc_id: doc_id.into(),
            assert: Some(expected),
            change: Action::None,
        }
    }

    pub fn with_assert(mut self, expected: Payload) -> Self {
        self.assert = Some(expected);
        self
    }

    pub fn is_assert_only(&self) -> bool {
        self.assert.is_some() && matches!(self.change, Action::None)
    }
}

/// Back-pressure bounds for the coordination queue. Zero disables a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Longest a document's pending-transaction queue may grow before new
    /// candidates are turned away.
    pub max_txn_queue_length: usize,

    /// Dead-token pull-set size that triggers a cleanup update on documents
    /// touched only by assertions.
    pub assertion_cleanup_length: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions {
            max_txn_queue_length: 1000,
            assertion_cleanup_length: 10,
        }
    }
}

#[derive(Debug, Clone)]
struct TxnRecord {
    nonce: u64,
    state: TxnState,
    ops: Vec<Op>,
}

/// Runs multi-document transactions against a [`Database`].
///
/// Constructed with [`RunnerOptions::default`]; [`set_options`](Self::set_options)
/// replaces the whole options value.
pub struct Runner {
    db: Arc<Database>,
    txns_name: String,
    records: DashMap<TxnId, TxnRecord>,
    next_id: AtomicU64,
    options: RunnerOptions,
}

impl Runner {
    pub fn new(db: Arc<Database>, txns_collection: impl Into<String>) -> Self {
        Runner {
            db,
            txns_name: txns_collection.into(),
            records: DashMap::new(),
            next_id: AtomicU64::new(0),
            options: RunnerOptions::default(),
        }
    }

    pub fn options(&self) -> RunnerOptions {
        self.options
    }

    pub fn set_options(&mut self, options: RunnerOptions) {
        self.options = options;
    }

    /// The state a transaction ended in, if the runner still knows it.
    pub fn state(&self, txn_id: TxnId) -> Option<TxnState> {
        self.records.get(&txn_id).map(|record| record.state)
    }

    /// Prepares, asserts, and applies `ops` as one transaction.
    pub fn run(&self, ops: Vec<Op>) -> TxnResult<TxnId> {
        if ops.is_empty() {
            return Err(TxnError::EmptyTxn);
        }
        let txn_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let nonce = txn_id;
        self.records.insert(
            txn_id,
            TxnRecord {
                nonce,
                state: TxnState::Preparing,
                ops: ops.clone(),
            },
        );
        debug!(txn_id, txns = %self.txns_name, ops = ops.len(), "running transaction");

        let token = Token { txn_id, nonce };
        self.prepare(token, &ops)?;
        self.set_state(txn_id, TxnState::Prepared)?;

        if let Err(err) = self.assert_phase(token, &ops) {
            self.abort_or_reload(txn_id)?;
            return Err(err);
        }

        self.apply(token, &ops)?;
        Ok(txn_id)
    }

    /// Enqueues the token on every target document, enforcing the queue
    /// bound. An over-long queue aborts the candidate, leaving the queue as
    /// it was found.
    fn prepare(&self, token: Token, ops: &[Op]) -> TxnResult<()> {
        let max = self.options.max_txn_queue_length;
        for op in ops {
            self.db.ensure_doc(&op.collection, &op.doc_id);
            let len = self
                .db
                .with_doc(&op.collection, &op.doc_id, |doc| {
                    if !doc.queue.contains(&token) {
                        doc.queue.push(token);
                    }
                    doc.queue.len()
                })
                .unwrap_or(1);
            if max > 0 && len > max {
                self.abort_or_reload(token.txn_id)?;
                return Err(TxnError::QueueTooLong {
                    collection: op.collection.clone(),
                    doc_id: op.doc_id.clone(),
                    len,
                });
            }
        }
        Ok(())
    }

    fn assert_phase(&self, token: Token, ops: &[Op]) -> TxnResult<()> {
        for op in ops {
            if op.is_assert_only() {
                self.maybe_cleanup(token, op);
            }
            let doc = self.db.get(&op.collection, &op.doc_id);
            let present = doc.as_ref().map(|doc| doc.present).unwrap_or(false);
            let change_ok = match &op.change {
                Action::Insert(_) => !present,
                Action::Update(_) | Action::Remove => present,
                Action::None => true,
            };
            let assert_ok = match (&op.assert, &doc) {
                (None, _) => true,
                (Some(expected), Some(doc)) if present => expected
                    .iter()
                    .all(|(field, value)| doc.payload.get(field) == Some(value)),
                (Some(_), _) => false,
            };
            if !(change_ok && assert_ok) {
                debug!(
                    txn_id = token.txn_id,
                    collection = %op.collection,
                    doc_id = %op.doc_id,
                    "assertion failed"
                );
                return Err(TxnError::Aborted);
            }
        }
        Ok(())
    }

    /// Assert-only documents are never mutated by their transactions, so
    /// dead tokens would otherwise accumulate in their queues without bound.
    fn maybe_cleanup(&self, own: Token, op: &Op) {
        let threshold = self.options.assertion_cleanup_length;
        if threshold == 0 {
            return;
        }
        let queue = self
            .db
            .get(&op.collection, &op.doc_id)
            .map(|doc| doc.queue)
            .unwrap_or_default();
        let pull: Vec<Token> = queue
            .iter()
            .filter(|token| **token != own && self.is_dead(**token))
            .copied()
            .collect();
        if pull.len() < threshold {
            return;
        }
        debug!(
            collection = %op.collection,
            doc_id = %op.doc_id,
            pulled = pull.len(),
            "pulling dead tokens from assert-only txn-queue"
        );
        let _ = self.db.with_doc(&op.collection, &op.doc_id, |doc| {
            doc.queue.retain(|token| !pull.contains(token));
        });
    }

    fn is_dead(&self, token: Token) -> bool {
        match self.records.get(&token.txn_id) {
            Some(record) => {
                record.nonce != token.nonce
                    || matches!(record.state, TxnState::Applied | TxnState::Aborted)
            }
            // A token no runner knows about is chaos leftovers.
            None => true,
        }
    }

    fn apply(&self, token: Token, ops: &[Op]) -> TxnResult<()> {
        self.set_state(token.txn_id, TxnState::Applying)?;
        for op in ops {
            match &op.change {
                Action::None => {}
                Action::Insert(payload) => {
                    let _ = self.db.with_doc(&op.collection, &op.doc_id, |doc| {
                        doc.present = true;
                        doc.payload = payload.clone();
                    });
                }
                Action::Update(set) => {
                    let _ = self.db.with_doc(&op.collection, &op.doc_id, |doc| {
                        for (field, value) in set {
                            doc.payload.insert(field.clone(), value.clone());
                        }
                    });
                }
                Action::Remove => {
                    let _ = self.db.with_doc(&op.collection, &op.doc_id, |doc| {
                        doc.present = false;
                        doc.payload.clear();
                    });
                }
            }
            let _ = self.db.with_doc(&op.collection, &op.doc_id, |doc| {
                doc.queue.retain(|queued| *queued != token);
            });
            self.db.drop_placeholder(&op.collection, &op.doc_id);
        }
        self.set_state(token.txn_id, TxnState::Applied)
    }

    /// Turns a candidate back, pulling its token from every document it
    /// reached. Accepts both `preparing` and `prepared`: a transaction may
    /// be aborted before its token reached every document.
    fn abort_or_reload(&self, txn_id: TxnId) -> TxnResult<()> {
        let (token, ops) = {
            let mut record = self
                .records
                .get_mut(&txn_id)
                .ok_or(TxnError::TxnMissing { txn_id })?;
            match record.state {
                TxnState::Preparing | TxnState::Prepared => {
                    record.state = TxnState::Aborting;
                }
                TxnState::Aborted => return Ok(()),
                state => {
                    return Err(TxnError::BadAbortState {
                        txn_id,
                        state: state.name(),
                    })
                }
            }
            (
                Token {
                    txn_id,
                    nonce: record.nonce,
                },
                record.ops.clone(),
            )
        };
        for op in &ops {
            let _ = self.db.with_doc(&op.collection, &op.doc_id, |doc| {
                doc.queue.retain(|queued| *queued != token);
            });
            self.db.drop_placeholder(&op.collection, &op.doc_id);
        }
        self.set_state(txn_id, TxnState::Aborted)
    }

    fn set_state(&self, txn_id: TxnId, state: TxnState) -> TxnResult<()> {
        let mut record = self
            .records
            .get_mut(&txn_id)
            .ok_or(TxnError::TxnMissing { txn_id })?;
        record.state = state;
        Ok(())
    }
}
