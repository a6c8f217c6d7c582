//! In-memory document engine.
//!
//! Holds every collection in a `HashMap` behind an `RwLock`. Each stored
//! document carries an engine-private key and a version. Transactions
//! take a private copy of each collection on first touch and, on commit,
//! merge back only the documents they matched or wrote. A commit fails
//! with a write conflict only if one of those documents was changed
//! underneath it, so writers on unrelated documents never block each
//! other. A transaction that is dropped without commit simply discards
//! its copies.
//!
//! Used by the test suite and for development. Faults can be injected per
//! collection and operation to exercise rollback paths.

use super::expr::{get_path, get_path_mut, remove_path, set_path, values_equal};
use super::{
    Collection, Document, DocumentEngine, EngineError, EngineResult, Executor, Expr, Operation,
    Pipeline, Transaction, TxnOptions, UpdateOp, UpdateOutcome, UpdateSpec,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Engine-private document key.
type DocKey = u64;

#[derive(Debug, Clone)]
struct Slot {
    key: DocKey,
    version: u64,
    doc: Document,
}

#[derive(Debug, Clone, Default)]
struct CollectionData {
    slots: Vec<Slot>,
}

impl CollectionData {
    fn docs(&self) -> Vec<Document> {
        self.slots.iter().map(|s| s.doc.clone()).collect()
    }

    fn version_of(&self, key: DocKey) -> Option<u64> {
        self.slots.iter().find(|s| s.key == key).map(|s| s.version)
    }

    /// Fold a transaction's changes to its touched documents into this
    /// (current) collection.
    fn merge(&mut self, staged: &TxnCollection) {
        for key in &staged.touched {
            let written = staged.data.slots.iter().find(|s| s.key == *key);
            let pos = self.slots.iter().position(|s| s.key == *key);
            match (written, pos) {
                (Some(slot), Some(pos)) => {
                    let current = &mut self.slots[pos];
                    if current.doc != slot.doc {
                        current.doc = slot.doc.clone();
                        current.version += 1;
                    }
                }
                (Some(slot), None) if !staged.base.contains_key(key) => {
                    self.slots.push(Slot {
                        key: *key,
                        version: 0,
                        doc: slot.doc.clone(),
                    });
                }
                (None, Some(pos)) => {
                    self.slots.remove(pos);
                }
                _ => {}
            }
        }
    }
}

type Collections = HashMap<Collection, CollectionData>;
type Indexes = HashMap<Collection, Vec<Vec<String>>>;

#[derive(Debug, Default)]
struct Shared {
    collections: RwLock<Collections>,
    indexes: RwLock<Indexes>,
    faults: Mutex<Vec<(Collection, Operation)>>,
    unavailable: AtomicBool,
    next_key: AtomicU64,
}

impl Shared {
    fn check_available(&self) -> EngineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("engine offline".to_string()));
        }
        Ok(())
    }

    /// Consume a pending fault for this call, if one was injected.
    fn check_fault(&self, collection: Collection, operation: Operation) -> EngineResult<()> {
        self.check_available()?;
        let mut faults = self.faults.lock().map_err(|_| EngineError::LockPoisoned)?;
        if let Some(pos) = faults
            .iter()
            .position(|f| *f == (collection, operation))
        {
            faults.remove(pos);
            tracing::debug!(%collection, ?operation, "Injected engine fault fired");
            return Err(EngineError::Injected {
                collection,
                operation,
            });
        }
        Ok(())
    }

    fn indexes_for(&self, collection: Collection) -> EngineResult<Vec<Vec<String>>> {
        let indexes = self.indexes.read().map_err(|_| EngineError::LockPoisoned)?;
        Ok(indexes.get(&collection).cloned().unwrap_or_default())
    }

    fn allocate_key(&self) -> DocKey {
        self.next_key.fetch_add(1, Ordering::SeqCst)
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// In-memory [`DocumentEngine`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryEngine {
    shared: Arc<Shared>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `operation` on `collection` fail, inside or outside a
    /// transaction.
    pub fn fail_next(&self, collection: Collection, operation: Operation) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.push((collection, operation));
        }
    }

    /// Simulate losing (or regaining) the connection to the database.
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Raw contents of a collection, bypassing pipelines.
    pub fn dump(&self, collection: Collection) -> EngineResult<Vec<Document>> {
        let collections = self
            .shared
            .collections
            .read()
            .map_err(|_| EngineError::LockPoisoned)?;
        Ok(collections
            .get(&collection)
            .map(CollectionData::docs)
            .unwrap_or_default())
    }
}

#[async_trait]
impl Executor for InMemoryEngine {
    async fn aggregate(
        &self,
        collection: Collection,
        pipeline: &Pipeline,
    ) -> EngineResult<Vec<Document>> {
        self.shared.check_fault(collection, Operation::Aggregate)?;
        let collections = self
            .shared
            .collections
            .read()
            .map_err(|_| EngineError::LockPoisoned)?;
        Ok(run_pipeline(|c| collections.get(&c), collection, pipeline))
    }

    async fn insert_one(&self, collection: Collection, document: Document) -> EngineResult<()> {
        self.shared.check_fault(collection, Operation::Insert)?;
        let indexes = self.shared.indexes_for(collection)?;
        let key = self.shared.allocate_key();
        let mut collections = self
            .shared
            .collections
            .write()
            .map_err(|_| EngineError::LockPoisoned)?;
        let data = collections.entry(collection).or_default();
        insert(data, collection, &indexes, key, document)
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Expr,
        update: &UpdateSpec,
    ) -> EngineResult<UpdateOutcome> {
        self.direct_update(collection, filter, update, false)
    }

    async fn update_many(
        &self,
        collection: Collection,
        filter: &Expr,
        update: &UpdateSpec,
    ) -> EngineResult<UpdateOutcome> {
        self.direct_update(collection, filter, update, true)
    }

    async fn delete_one(&self, collection: Collection, filter: &Expr) -> EngineResult<u64> {
        self.direct_delete(collection, filter, false)
    }

    async fn delete_many(&self, collection: Collection, filter: &Expr) -> EngineResult<u64> {
        self.direct_delete(collection, filter, true)
    }
}

impl InMemoryEngine {
    fn direct_update(
        &self,
        collection: Collection,
        filter: &Expr,
        update: &UpdateSpec,
        many: bool,
    ) -> EngineResult<UpdateOutcome> {
        self.shared.check_fault(collection, Operation::Update)?;
        let indexes = self.shared.indexes_for(collection)?;
        let mut collections = self
            .shared
            .collections
            .write()
            .map_err(|_| EngineError::LockPoisoned)?;
        let data = collections.entry(collection).or_default();
        let (outcome, _) = update_docs(data, collection, &indexes, filter, update, many)?;
        Ok(outcome)
    }

    fn direct_delete(
        &self,
        collection: Collection,
        filter: &Expr,
        many: bool,
    ) -> EngineResult<u64> {
        self.shared.check_fault(collection, Operation::Delete)?;
        let mut collections = self
            .shared
            .collections
            .write()
            .map_err(|_| EngineError::LockPoisoned)?;
        let data = collections.entry(collection).or_default();
        Ok(delete_docs(data, filter, many).len() as u64)
    }
}

#[async_trait]
impl DocumentEngine for InMemoryEngine {
    fn as_executor(&self) -> &dyn Executor {
        self
    }

    async fn begin(&self, options: TxnOptions) -> EngineResult<Box<dyn Transaction>> {
        self.shared.check_available()?;
        tracing::trace!(?options, "Transaction started");
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            options,
            work: Mutex::new(TxnWork {
                open: true,
                ..Default::default()
            }),
        }))
    }

    async fn create_unique_index(
        &self,
        collection: Collection,
        fields: &[&str],
    ) -> EngineResult<()> {
        self.shared.check_available()?;
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        {
            let collections = self
                .shared
                .collections
                .read()
                .map_err(|_| EngineError::LockPoisoned)?;
            if let Some(data) = collections.get(&collection) {
                check_unique(
                    collection,
                    data.slots.iter().map(|s| &s.doc),
                    std::slice::from_ref(&fields),
                )?;
            }
        }
        let mut indexes = self
            .shared
            .indexes
            .write()
            .map_err(|_| EngineError::LockPoisoned)?;
        let entry = indexes.entry(collection).or_default();
        if !entry.contains(&fields) {
            entry.push(fields);
        }
        Ok(())
    }

    async fn ping(&self) -> EngineResult<()> {
        self.shared.check_available()
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

/// A transaction's private copy of one collection.
#[derive(Debug, Default)]
struct TxnCollection {
    data: CollectionData,
    /// Version of every document at snapshot time.
    base: HashMap<DocKey, u64>,
    /// Documents this transaction matched, inserted or deleted.
    touched: BTreeSet<DocKey>,
}

#[derive(Debug, Default)]
struct TxnWork {
    open: bool,
    collections: HashMap<Collection, TxnCollection>,
}

impl TxnWork {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(EngineError::TransactionClosed)
        }
    }

    /// Take a private copy of a collection the first time it is touched.
    fn snapshot(&mut self, shared: &Shared, collection: Collection) -> EngineResult<()> {
        if self.collections.contains_key(&collection) {
            return Ok(());
        }
        let collections = shared
            .collections
            .read()
            .map_err(|_| EngineError::LockPoisoned)?;
        let data = collections.get(&collection).cloned().unwrap_or_default();
        let base = data.slots.iter().map(|s| (s.key, s.version)).collect();
        self.collections.insert(
            collection,
            TxnCollection {
                data,
                base,
                touched: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn dirty(&self) -> impl Iterator<Item = (&Collection, &TxnCollection)> {
        self.collections.iter().filter(|(_, c)| !c.touched.is_empty())
    }
}

/// Transaction over an [`InMemoryEngine`].
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    options: TxnOptions,
    work: Mutex<TxnWork>,
}

impl MemoryTransaction {
    /// Run a write against the private copy of `collection`. `f` returns
    /// the keys of the documents it matched.
    fn with_collection<R>(
        &self,
        collection: Collection,
        operation: Operation,
        f: impl FnOnce(&mut CollectionData) -> EngineResult<(R, Vec<DocKey>)>,
    ) -> EngineResult<R> {
        self.shared.check_fault(collection, operation)?;
        let mut work = self.work.lock().map_err(|_| EngineError::LockPoisoned)?;
        work.ensure_open()?;
        work.snapshot(&self.shared, collection)?;
        let staged = work
            .collections
            .get_mut(&collection)
            .ok_or(EngineError::TransactionClosed)?;
        let (result, keys) = f(&mut staged.data)?;
        staged.touched.extend(keys);
        Ok(result)
    }
}

#[async_trait]
impl Executor for MemoryTransaction {
    async fn aggregate(
        &self,
        collection: Collection,
        pipeline: &Pipeline,
    ) -> EngineResult<Vec<Document>> {
        self.shared.check_fault(collection, Operation::Aggregate)?;
        let mut work = self.work.lock().map_err(|_| EngineError::LockPoisoned)?;
        work.ensure_open()?;
        work.snapshot(&self.shared, collection)?;
        for foreign in pipeline.foreign_collections() {
            work.snapshot(&self.shared, foreign)?;
        }
        Ok(run_pipeline(
            |c| work.collections.get(&c).map(|t| &t.data),
            collection,
            pipeline,
        ))
    }

    async fn insert_one(&self, collection: Collection, document: Document) -> EngineResult<()> {
        let indexes = self.shared.indexes_for(collection)?;
        let key = self.shared.allocate_key();
        self.with_collection(collection, Operation::Insert, |data| {
            insert(data, collection, &indexes, key, document)?;
            Ok(((), vec![key]))
        })
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Expr,
        update: &UpdateSpec,
    ) -> EngineResult<UpdateOutcome> {
        let indexes = self.shared.indexes_for(collection)?;
        self.with_collection(collection, Operation::Update, |data| {
            update_docs(data, collection, &indexes, filter, update, false)
        })
    }

    async fn update_many(
        &self,
        collection: Collection,
        filter: &Expr,
        update: &UpdateSpec,
    ) -> EngineResult<UpdateOutcome> {
        let indexes = self.shared.indexes_for(collection)?;
        self.with_collection(collection, Operation::Update, |data| {
            update_docs(data, collection, &indexes, filter, update, true)
        })
    }

    async fn delete_one(&self, collection: Collection, filter: &Expr) -> EngineResult<u64> {
        self.with_collection(collection, Operation::Delete, |data| {
            let keys = delete_docs(data, filter, false);
            Ok((keys.len() as u64, keys))
        })
    }

    async fn delete_many(&self, collection: Collection, filter: &Expr) -> EngineResult<u64> {
        self.with_collection(collection, Operation::Delete, |data| {
            let keys = delete_docs(data, filter, true);
            Ok((keys.len() as u64, keys))
        })
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn as_executor(&self) -> &dyn Executor {
        self
    }

    fn options(&self) -> TxnOptions {
        self.options
    }

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        self.shared.check_available()?;
        let mut work = self.work.lock().map_err(|_| EngineError::LockPoisoned)?;
        work.ensure_open()?;
        work.open = false;

        let mut indexes = HashMap::new();
        for (collection, _) in work.dirty() {
            indexes.insert(*collection, self.shared.indexes_for(*collection)?);
        }

        let mut collections = self
            .shared
            .collections
            .write()
            .map_err(|_| EngineError::LockPoisoned)?;

        let mut merged = Vec::new();
        for (collection, staged) in work.dirty() {
            let mut data = collections.get(collection).cloned().unwrap_or_default();
            for key in &staged.touched {
                let Some(seen) = staged.base.get(key) else {
                    continue;
                };
                let current = data.version_of(*key);
                if current != Some(*seen) {
                    tracing::debug!(
                        %collection,
                        key,
                        seen,
                        ?current,
                        "Transaction lost a write race"
                    );
                    return Err(EngineError::WriteConflict {
                        collection: *collection,
                    });
                }
            }
            data.merge(staged);
            let fields = indexes.get(collection).map_or(&[][..], Vec::as_slice);
            if check_unique(*collection, data.slots.iter().map(|s| &s.doc), fields).is_err() {
                tracing::debug!(%collection, "Concurrent insert took a unique key");
                return Err(EngineError::WriteConflict {
                    collection: *collection,
                });
            }
            merged.push((*collection, data));
        }

        for (collection, data) in merged {
            collections.insert(collection, data);
        }
        work.collections.clear();
        tracing::trace!(write_concern = ?self.options.write_concern, "Transaction committed");
        Ok(())
    }

    async fn abort(self: Box<Self>) -> EngineResult<()> {
        let mut work = self.work.lock().map_err(|_| EngineError::LockPoisoned)?;
        work.open = false;
        work.collections.clear();
        tracing::trace!("Transaction aborted");
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Ok(work) = self.work.get_mut() {
            let dirty = work.dirty().count();
            if work.open && dirty > 0 {
                tracing::debug!(
                    collections = dirty,
                    "Transaction dropped without commit, discarding writes"
                );
            }
        }
    }
}

// ============================================================================
// OPERATIONS
// ============================================================================

fn run_pipeline<'a>(
    lookup: impl Fn(Collection) -> Option<&'a CollectionData>,
    collection: Collection,
    pipeline: &Pipeline,
) -> Vec<Document> {
    let source = lookup(collection)
        .map(CollectionData::docs)
        .unwrap_or_default();
    let joined: HashMap<Collection, Vec<Document>> = pipeline
        .foreign_collections()
        .into_iter()
        .map(|c| (c, lookup(c).map(CollectionData::docs).unwrap_or_default()))
        .collect();
    let foreign = |c: Collection| -> &[Document] {
        joined.get(&c).map_or(&[][..], Vec::as_slice)
    };
    pipeline.run(source, &foreign)
}

fn insert(
    data: &mut CollectionData,
    collection: Collection,
    indexes: &[Vec<String>],
    key: DocKey,
    document: Document,
) -> EngineResult<()> {
    check_unique(
        collection,
        data.slots.iter().map(|s| &s.doc).chain(std::iter::once(&document)),
        indexes,
    )?;
    data.slots.push(Slot {
        key,
        version: 0,
        doc: document,
    });
    Ok(())
}

/// Returns the outcome and the keys of every matched document.
fn update_docs(
    data: &mut CollectionData,
    collection: Collection,
    indexes: &[Vec<String>],
    filter: &Expr,
    update: &UpdateSpec,
    many: bool,
) -> EngineResult<(UpdateOutcome, Vec<DocKey>)> {
    let mut candidate = data.slots.clone();
    let mut outcome = UpdateOutcome::default();
    let mut matched = Vec::new();
    for slot in candidate.iter_mut() {
        if !filter.matches(&slot.doc) {
            continue;
        }
        outcome.matched += 1;
        matched.push(slot.key);
        let before = slot.doc.clone();
        apply_update(&mut slot.doc, update);
        if slot.doc != before {
            outcome.modified += 1;
            slot.version += 1;
        }
        if !many {
            break;
        }
    }
    if outcome.modified > 0 {
        check_unique(collection, candidate.iter().map(|s| &s.doc), indexes)?;
        data.slots = candidate;
    }
    Ok((outcome, matched))
}

/// Returns the keys of the deleted documents.
fn delete_docs(data: &mut CollectionData, filter: &Expr, many: bool) -> Vec<DocKey> {
    if many {
        let mut deleted = Vec::new();
        data.slots.retain(|s| {
            let hit = filter.matches(&s.doc);
            if hit {
                deleted.push(s.key);
            }
            !hit
        });
        deleted
    } else {
        match data.slots.iter().position(|s| filter.matches(&s.doc)) {
            Some(pos) => vec![data.slots.remove(pos).key],
            None => Vec::new(),
        }
    }
}

/// Apply every op of an update to one document.
pub(crate) fn apply_update(doc: &mut Document, update: &UpdateSpec) {
    for op in update.ops() {
        match op {
            UpdateOp::Set(field, value) => set_path(doc, field, value.clone()),
            UpdateOp::Unset(field) => {
                remove_path(doc, field);
            }
            UpdateOp::Inc(field, by) => {
                let current = get_path(doc, field).and_then(Value::as_i64).unwrap_or(0);
                set_path(doc, field, Value::from(current + by));
            }
            UpdateOp::Push(field, value) => {
                if let Some(items) = array_mut(doc, field) {
                    items.push(value.clone());
                }
            }
            UpdateOp::AddToSet(field, value) => {
                if let Some(items) = array_mut(doc, field) {
                    if !items.iter().any(|i| values_equal(i, value)) {
                        items.push(value.clone());
                    }
                }
            }
            UpdateOp::Pull(field, value) => {
                if let Some(Value::Array(items)) = get_path_mut(doc, field) {
                    items.retain(|i| !values_equal(i, value));
                }
            }
            UpdateOp::PullWhere(field, condition) => {
                if let Some(Value::Array(items)) = get_path_mut(doc, field) {
                    items.retain(|i| match i {
                        Value::Object(element) => !condition.matches(element),
                        _ => true,
                    });
                }
            }
            UpdateOp::ReplaceInArray { field, from, to } => {
                if let Some(Value::Array(items)) = get_path_mut(doc, field) {
                    let mut out: Vec<Value> = Vec::with_capacity(items.len());
                    for item in items.drain(..) {
                        let item = if values_equal(&item, from) {
                            to.clone()
                        } else {
                            item
                        };
                        if !out.iter().any(|o| values_equal(o, &item)) {
                            out.push(item);
                        }
                    }
                    *items = out;
                }
            }
        }
    }
}

/// The array at `field`, created (or replacing a non-array) if needed.
fn array_mut<'a>(doc: &'a mut Document, field: &str) -> Option<&'a mut Vec<Value>> {
    if !matches!(get_path(doc, field), Some(Value::Array(_))) {
        set_path(doc, field, Value::Array(Vec::new()));
    }
    get_path_mut(doc, field).and_then(Value::as_array_mut)
}

/// Fail if any two documents share a key on any unique index. Documents
/// missing an indexed field are not indexed.
fn check_unique<'a, I>(
    collection: Collection,
    docs: I,
    indexes: &[Vec<String>],
) -> EngineResult<()>
where
    I: Iterator<Item = &'a Document> + Clone,
{
    for fields in indexes {
        let mut seen = HashSet::new();
        for doc in docs.clone() {
            let key: Option<Vec<Value>> = fields
                .iter()
                .map(|f| get_path(doc, f).filter(|v| !v.is_null()).cloned())
                .collect();
            if let Some(key) = key {
                if !seen.insert(Value::Array(key).to_string()) {
                    return Err(EngineError::DuplicateKey {
                        collection,
                        index: fields.join(", "),
                    });
                }
            }
        }
    }
    Ok(())
}
